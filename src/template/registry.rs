use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use super::{TemplateContainer, TemplateError};

/// A template addressable by its type name.
pub trait NamedTemplate {
    fn type_name(&self) -> &str;
}

impl<T: NamedTemplate + ?Sized> NamedTemplate for Arc<T> {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }
}

impl<T: NamedTemplate + ?Sized> NamedTemplate for Box<T> {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }
}

/// Builds templates of one type from a container body.
///
/// The chain is handed back in so composite templates can build their children.
pub trait TemplateFactory<T>: Send + Sync {
    /// Template type this factory handles, without the `Template` suffix.
    fn target_name(&self) -> &'static str;

    fn create(&self, body: &Value, chain: &TemplateFactoryChain<T>) -> Result<Vec<T>, TemplateError>;
}

/// Factories tried in registration order; the first whose target matches the
/// container's type builds it.
pub struct TemplateFactoryChain<T> {
    factories: Vec<Box<dyn TemplateFactory<T>>>,
}

impl<T> TemplateFactoryChain<T> {
    pub fn new() -> Self {
        TemplateFactoryChain {
            factories: Vec::new(),
        }
    }

    pub fn with(mut self, factory: impl TemplateFactory<T> + 'static) -> Self {
        self.register(factory);
        self
    }

    pub fn register(&mut self, factory: impl TemplateFactory<T> + 'static) {
        self.factories.push(Box::new(factory));
    }

    pub fn target_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.target_name()).collect()
    }

    pub fn create(&self, container: &TemplateContainer) -> Result<Vec<T>, TemplateError> {
        let factory = self
            .factories
            .iter()
            .find(|factory| container.matches(factory.target_name()))
            .ok_or_else(|| TemplateError::TemplateNotFound(container.template_type.clone()))?;

        factory.create(&container.template, self)
    }

    /// Builds templates from a raw `{ templateType, template }` envelope.
    pub fn create_from_value(&self, value: &Value) -> Result<Vec<T>, TemplateError> {
        let container = TemplateContainer::from_value(value)?;
        self.create(&container)
    }
}

impl<T: NamedTemplate> TemplateFactoryChain<T> {
    pub fn load(&self, text: &str) -> Result<TemplateCollection<T>, TemplateError> {
        let value: Value = serde_json::from_str(text)?;
        self.load_value(&value)
    }

    pub fn load_value(&self, value: &Value) -> Result<TemplateCollection<T>, TemplateError> {
        let collection = TemplateCollection::from_templates(self.create_from_value(value)?)?;
        debug!(templates = collection.len(), "Loaded template collection");
        Ok(collection)
    }
}

impl<T> Default for TemplateFactoryChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TemplateFactoryChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateFactoryChain")
            .field("targets", &self.target_names())
            .finish()
    }
}

/// Wraps an array of individually typed templates.
///
/// Each element goes back through the full chain. Violations from every element
/// are reported together, prefixed with the element index.
pub struct CollectionTemplateFactory<T> {
    target: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CollectionTemplateFactory<T> {
    pub fn new(target: &'static str) -> Self {
        CollectionTemplateFactory {
            target,
            _marker: PhantomData,
        }
    }
}

impl<T> TemplateFactory<T> for CollectionTemplateFactory<T> {
    fn target_name(&self) -> &'static str {
        self.target
    }

    fn create(&self, body: &Value, chain: &TemplateFactoryChain<T>) -> Result<Vec<T>, TemplateError> {
        let items = body.as_array().ok_or_else(|| {
            TemplateError::invalid(vec![format!("$: {} expects an array of templates", self.target)])
        })?;

        let mut templates = Vec::with_capacity(items.len());
        let mut errors = Vec::new();

        for (index, item) in items.iter().enumerate() {
            match chain.create_from_value(item) {
                Ok(created) => templates.extend(created),
                Err(TemplateError::InvalidTemplate { errors: violations }) => {
                    errors.extend(violations.into_iter().map(|violation| {
                        match violation.strip_prefix('$') {
                            Some(rest) => format!("$[{}]{}", index, rest),
                            None => format!("$[{}]: {}", index, violation),
                        }
                    }));
                }
                Err(e) => return Err(e),
            }
        }

        if !errors.is_empty() {
            return Err(TemplateError::invalid(errors));
        }
        Ok(templates)
    }
}

/// Templates indexed by type name, case-insensitively.
#[derive(Debug, Clone)]
pub struct TemplateCollection<T> {
    templates: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: NamedTemplate> TemplateCollection<T> {
    pub fn new() -> Self {
        TemplateCollection {
            templates: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn from_templates(templates: impl IntoIterator<Item = T>) -> Result<Self, TemplateError> {
        let mut collection = Self::new();
        for template in templates {
            collection.insert(template)?;
        }
        Ok(collection)
    }

    pub fn insert(&mut self, template: T) -> Result<(), TemplateError> {
        let key = template.type_name().to_lowercase();
        if self.index.contains_key(&key) {
            return Err(TemplateError::DuplicateTemplate(template.type_name().to_string()));
        }
        self.index.insert(key, self.templates.len());
        self.templates.push(template);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&T> {
        self.index
            .get(&type_name.to_lowercase())
            .map(|&position| &self.templates[position])
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.index.contains_key(&type_name.to_lowercase())
    }
}

impl<T> TemplateCollection<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl<T: NamedTemplate> Default for TemplateCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> IntoIterator for &'a TemplateCollection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.templates.iter()
    }
}
