use jmespath::Runtime;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    connector_runtime, Expression, ExpressionError, ExpressionEvaluator, ExpressionLanguage,
    JmesPathEvaluator, JsonPathEvaluator,
};

/// Compiles expressions into evaluators.
pub trait ExpressionEvaluatorFactory: Send + Sync {
    fn create(&self, expression: &Expression) -> Result<Arc<dyn ExpressionEvaluator>, ExpressionError>;
}

/// Compiles JSONPath directly and JMESPath against the connector runtime.
#[derive(Clone, Copy)]
pub struct DefaultExpressionEvaluatorFactory {
    runtime: &'static Runtime,
}

impl DefaultExpressionEvaluatorFactory {
    pub fn new() -> Self {
        Self::with_runtime(connector_runtime())
    }

    pub fn with_runtime(runtime: &'static Runtime) -> Self {
        DefaultExpressionEvaluatorFactory { runtime }
    }
}

impl Default for DefaultExpressionEvaluatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultExpressionEvaluatorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultExpressionEvaluatorFactory").finish()
    }
}

impl ExpressionEvaluatorFactory for DefaultExpressionEvaluatorFactory {
    fn create(&self, expression: &Expression) -> Result<Arc<dyn ExpressionEvaluator>, ExpressionError> {
        Ok(match expression.language {
            ExpressionLanguage::JsonPath => Arc::new(JsonPathEvaluator::compile(&expression.value)?),
            ExpressionLanguage::JmesPath => {
                Arc::new(JmesPathEvaluator::compile(&expression.value, self.runtime)?)
            }
        })
    }
}

/// Evaluators precompiled for one template instance.
///
/// Every expression the template references is compiled when the template is
/// built; the map is never modified afterwards, so per-event evaluation is a
/// lookup. Expressions outside the map are compiled on demand and not kept.
pub struct CachingExpressionEvaluatorFactory {
    evaluators: HashMap<Expression, Arc<dyn ExpressionEvaluator>>,
    inner: Arc<dyn ExpressionEvaluatorFactory>,
}

impl CachingExpressionEvaluatorFactory {
    pub fn precompile<'a>(
        inner: Arc<dyn ExpressionEvaluatorFactory>,
        expressions: impl IntoIterator<Item = &'a Expression>,
    ) -> Result<Self, ExpressionError> {
        let mut evaluators = HashMap::new();
        for expression in expressions {
            if !evaluators.contains_key(expression) {
                evaluators.insert(expression.clone(), inner.create(expression)?);
            }
        }
        Ok(CachingExpressionEvaluatorFactory { evaluators, inner })
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    pub fn contains(&self, expression: &Expression) -> bool {
        self.evaluators.contains_key(expression)
    }
}

impl fmt::Debug for CachingExpressionEvaluatorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingExpressionEvaluatorFactory")
            .field("evaluators", &self.evaluators.len())
            .finish()
    }
}

impl ExpressionEvaluatorFactory for CachingExpressionEvaluatorFactory {
    fn create(&self, expression: &Expression) -> Result<Arc<dyn ExpressionEvaluator>, ExpressionError> {
        match self.evaluators.get(expression) {
            Some(evaluator) => Ok(Arc::clone(evaluator)),
            None => self.inner.create(expression),
        }
    }
}
