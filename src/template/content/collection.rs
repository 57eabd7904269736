use serde_json::Value;
use std::sync::Arc;

use super::{ContentTemplate, Measurements};
use crate::template::registry::{NamedTemplate, TemplateCollection, TemplateFactoryChain};
use crate::template::TemplateError;

/// Every registered content template applied to the same event, in registration
/// order.
#[derive(Debug, Clone, Default)]
pub struct CollectionContentTemplate {
    templates: TemplateCollection<Arc<dyn ContentTemplate>>,
}

impl CollectionContentTemplate {
    pub fn new(templates: TemplateCollection<Arc<dyn ContentTemplate>>) -> Self {
        CollectionContentTemplate { templates }
    }

    /// Parses a device content document with the given factory chain.
    pub fn load(chain: &TemplateFactoryChain<Arc<dyn ContentTemplate>>, text: &str) -> Result<Self, TemplateError> {
        Ok(Self::new(chain.load(text)?))
    }

    pub fn templates(&self) -> &TemplateCollection<Arc<dyn ContentTemplate>> {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl NamedTemplate for CollectionContentTemplate {
    fn type_name(&self) -> &str {
        "CollectionContent"
    }
}

impl ContentTemplate for CollectionContentTemplate {
    fn get_measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a> {
        Box::new(
            self.templates
                .iter()
                .flat_map(move |template| template.get_measurements(root)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::DefaultExpressionEvaluatorFactory;
    use crate::template::content::content_template_factory;
    use serde_json::json;

    fn create_test_document() -> String {
        json!({
            "templateType": "CollectionContentTemplate",
            "template": [
                {
                    "templateType": "JsonPathContent",
                    "template": {
                        "typeName": "heartrate",
                        "typeMatchExpression": "$..[?(@.heartrate)]",
                        "deviceIdExpression": "$.device",
                        "timestampExpression": "$.date",
                        "values": [{"valueName": "hr", "valueExpression": "$.heartrate", "required": true}]
                    }
                },
                {
                    "templateType": "CalculatedContent",
                    "template": {
                        "typeName": "steps",
                        "typeMatchExpression": "$..[?(@.steps)]",
                        "deviceIdExpression": "$.matchedToken.device",
                        "timestampExpression": "$.matchedToken.date",
                        "values": [{"valueName": "steps", "valueExpression": "$.matchedToken.steps"}]
                    }
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_collection_yields_measurements_of_every_template() {
        let chain = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()));
        let collection = CollectionContentTemplate::load(&chain, &create_test_document()).unwrap();
        assert_eq!(collection.len(), 2);

        let event = json!({
            "samples": [
                {"heartrate": 60, "device": "abc", "date": "2024-03-01T10:00:00Z"},
                {"steps": 12, "device": "abc", "date": "2024-03-01T10:00:00Z"}
            ]
        });

        let types: Vec<String> = collection
            .get_measurements(&event)
            .map(|m| m.unwrap().measure_type)
            .collect();
        assert_eq!(types, vec!["heartrate", "steps"]);
    }

    #[test]
    fn test_event_matching_nothing_yields_nothing() {
        let chain = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()));
        let collection = CollectionContentTemplate::load(&chain, &create_test_document()).unwrap();

        assert_eq!(collection.get_measurements(&json!({"other": 1})).count(), 0);
    }
}
