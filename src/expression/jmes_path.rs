use jmespath::ast::Ast;
use jmespath::{Rcvar, Runtime};
use serde_json::Value;
use std::fmt;

use super::{Expression, ExpressionError, ExpressionEvaluator};

/// Evaluates a compiled JMESPath expression.
///
/// Compiled expressions borrow the runtime that holds their function table, so
/// the runtime must outlive every evaluator built from it.
pub struct JmesPathEvaluator {
    expression: Expression,
    compiled: jmespath::Expression<'static>,
}

impl JmesPathEvaluator {
    pub fn compile(value: &str, runtime: &'static Runtime) -> Result<Self, ExpressionError> {
        let expression = Expression::jmes_path(value);
        let compiled = runtime
            .compile(value)
            .map_err(|e| ExpressionError::compile(&expression, e))?;
        Ok(JmesPathEvaluator {
            expression,
            compiled,
        })
    }

    fn search(&self, data: &Value) -> Result<Rcvar, ExpressionError> {
        self.compiled
            .search(data)
            .map_err(|e| ExpressionError::evaluation(&self.expression, e))
    }

    fn is_projection(&self) -> bool {
        matches!(
            self.compiled.as_ast(),
            Ast::Projection { .. } | Ast::Flatten { .. } | Ast::ObjectValues { .. }
        )
    }

    fn to_json(&self, variable: &Rcvar) -> Result<Value, ExpressionError> {
        serde_json::to_value(&**variable).map_err(|e| ExpressionError::evaluation(&self.expression, e))
    }
}

impl fmt::Debug for JmesPathEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JmesPathEvaluator")
            .field("expression", &self.expression)
            .finish()
    }
}

impl ExpressionEvaluator for JmesPathEvaluator {
    fn expression(&self) -> &Expression {
        &self.expression
    }

    fn select_token(&self, data: &Value) -> Result<Option<Value>, ExpressionError> {
        let result = self.search(data)?;
        if result.is_null() {
            return Ok(None);
        }

        if self.is_projection() {
            if let Some(items) = result.as_array() {
                let mut present = items.iter().filter(|item| !item.is_null());
                return match (present.next(), present.next()) {
                    (None, _) => Ok(None),
                    (Some(item), None) => self.to_json(item).map(Some),
                    (Some(_), Some(_)) => Err(ExpressionError::multiple_tokens(&self.expression)),
                };
            }
        }

        self.to_json(&result).map(Some)
    }

    fn select_tokens(&self, data: &Value) -> Result<Vec<Value>, ExpressionError> {
        let result = self.search(data)?;
        if result.is_null() {
            return Ok(Vec::new());
        }

        match result.as_array() {
            Some(items) if self.is_projection() => items
                .iter()
                .filter(|item| !item.is_null())
                .map(|item| self.to_json(item))
                .collect(),
            _ => Ok(vec![self.to_json(&result)?]),
        }
    }
}
