//! Path expressions over device JSON
//!
//! Templates locate values inside raw device payloads with path expressions written
//! in one of two interchangeable languages: JSONPath and JMESPath. An [`Expression`]
//! is compiled once into an [`ExpressionEvaluator`] and evaluated many times.

mod factory;
mod functions;
mod jmes_path;
mod json_path;

pub use factory::{
    CachingExpressionEvaluatorFactory, DefaultExpressionEvaluatorFactory,
    ExpressionEvaluatorFactory,
};
pub use functions::connector_runtime;
pub use jmes_path::JmesPathEvaluator;
pub use json_path::JsonPathEvaluator;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The language an expression is written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ExpressionLanguage {
    #[default]
    JsonPath,
    JmesPath,
}

impl fmt::Display for ExpressionLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionLanguage::JsonPath => write!(f, "JsonPath"),
            ExpressionLanguage::JmesPath => write!(f, "JmesPath"),
        }
    }
}

impl FromStr for ExpressionLanguage {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonpath" => Ok(ExpressionLanguage::JsonPath),
            "jmespath" => Ok(ExpressionLanguage::JmesPath),
            _ => Err(ExpressionError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for ExpressionLanguage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A path expression together with its language.
///
/// Two expressions are the same compiled artifact when both the text and the
/// language match, so the pair doubles as the evaluator cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expression {
    pub value: String,
    #[serde(default)]
    pub language: ExpressionLanguage,
}

impl Expression {
    pub fn new(value: impl Into<String>, language: ExpressionLanguage) -> Self {
        Expression {
            value: value.into(),
            language,
        }
    }

    pub fn json_path(value: impl Into<String>) -> Self {
        Self::new(value, ExpressionLanguage::JsonPath)
    }

    pub fn jmes_path(value: impl Into<String>) -> Self {
        Self::new(value, ExpressionLanguage::JmesPath)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.language)
    }
}

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Unable to compile {language} expression '{expression}': {message}")]
    Compile {
        expression: String,
        language: ExpressionLanguage,
        message: String,
    },

    #[error("Multiple tokens were returned using expression '{expression}'")]
    MultipleTokens { expression: String },

    #[error("Unable to evaluate {language} expression '{expression}': {message}")]
    Evaluation {
        expression: String,
        language: ExpressionLanguage,
        message: String,
    },

    #[error("Unsupported expression language '{0}'")]
    UnsupportedLanguage(String),
}

impl ExpressionError {
    pub fn compile(expression: &Expression, message: impl fmt::Display) -> Self {
        ExpressionError::Compile {
            expression: expression.value.clone(),
            language: expression.language,
            message: message.to_string(),
        }
    }

    pub fn evaluation(expression: &Expression, message: impl fmt::Display) -> Self {
        ExpressionError::Evaluation {
            expression: expression.value.clone(),
            language: expression.language,
            message: message.to_string(),
        }
    }

    pub fn multiple_tokens(expression: &Expression) -> Self {
        ExpressionError::MultipleTokens {
            expression: expression.value.clone(),
        }
    }
}

/// A compiled expression.
///
/// Evaluation is a pure function of the input document: calling either method
/// twice on the same value yields the same tokens. JSON `null` results count as
/// "no token".
pub trait ExpressionEvaluator: Send + Sync + fmt::Debug {
    /// The expression this evaluator was compiled from.
    fn expression(&self) -> &Expression;

    /// Returns the single token selected by the expression, if any.
    fn select_token(&self, data: &Value) -> Result<Option<Value>, ExpressionError>;

    /// Returns every token selected by the expression.
    fn select_tokens(&self, data: &Value) -> Result<Vec<Value>, ExpressionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing_is_case_insensitive() {
        assert_eq!("JsonPath".parse::<ExpressionLanguage>().unwrap(), ExpressionLanguage::JsonPath);
        assert_eq!("JMESPath".parse::<ExpressionLanguage>().unwrap(), ExpressionLanguage::JmesPath);
        assert_eq!("jmespath".parse::<ExpressionLanguage>().unwrap(), ExpressionLanguage::JmesPath);
        assert!(matches!(
            "xpath".parse::<ExpressionLanguage>(),
            Err(ExpressionError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_expression_deserializes_with_default_language() {
        let expression: Expression = serde_json::from_str(r#"{"value": "$.a"}"#).unwrap();
        assert_eq!(expression, Expression::json_path("$.a"));

        let expression: Expression =
            serde_json::from_str(r#"{"value": "a.b", "language": "JmesPath"}"#).unwrap();
        assert_eq!(expression, Expression::jmes_path("a.b"));
    }
}
