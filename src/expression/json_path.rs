use serde_json::Value;
use serde_json_path::JsonPath;

use super::{Expression, ExpressionError, ExpressionEvaluator};

/// Evaluates RFC 9535 JSONPath queries.
///
/// A descendant filter (`$..[?...]`) also tests the root itself, so the same
/// type match selects a single flat payload as well as the entries of a batch.
#[derive(Debug)]
pub struct JsonPathEvaluator {
    expression: Expression,
    path: JsonPath,
    includes_root: bool,
}

impl JsonPathEvaluator {
    pub fn compile(value: &str) -> Result<Self, ExpressionError> {
        let expression = Expression::json_path(value);
        let path = JsonPath::parse(value).map_err(|e| ExpressionError::compile(&expression, e))?;
        let includes_root = value.trim_start().starts_with("$..[?");
        Ok(JsonPathEvaluator {
            expression,
            path,
            includes_root,
        })
    }

    fn query(&self, data: &Value) -> Vec<Value> {
        fn present(nodes: Vec<&Value>) -> Vec<Value> {
            nodes.into_iter().filter(|node| !node.is_null()).cloned().collect()
        }

        if self.includes_root {
            // descendants of a one-element array are the root followed by its descendants
            let wrapped = Value::Array(vec![data.clone()]);
            present(self.path.query(&wrapped).all())
        } else {
            present(self.path.query(data).all())
        }
    }
}

impl ExpressionEvaluator for JsonPathEvaluator {
    fn expression(&self) -> &Expression {
        &self.expression
    }

    fn select_token(&self, data: &Value) -> Result<Option<Value>, ExpressionError> {
        Ok(self.query(data).into_iter().next())
    }

    fn select_tokens(&self, data: &Value) -> Result<Vec<Value>, ExpressionError> {
        Ok(self.query(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_token_returns_first_match() {
        let evaluator = JsonPathEvaluator::compile("$.readings[*].hr").unwrap();
        let data = json!({"readings": [{"hr": 60}, {"hr": 61}]});

        assert_eq!(evaluator.select_token(&data).unwrap(), Some(json!(60)));
        assert_eq!(evaluator.select_tokens(&data).unwrap(), vec![json!(60), json!(61)]);
    }

    #[test]
    fn test_missing_and_null_values_yield_nothing() {
        let evaluator = JsonPathEvaluator::compile("$.patient").unwrap();

        assert_eq!(evaluator.select_token(&json!({"device": "abc"})).unwrap(), None);
        assert_eq!(evaluator.select_token(&json!({"patient": null})).unwrap(), None);
        assert!(evaluator.select_tokens(&json!({"patient": null})).unwrap().is_empty());
    }

    #[test]
    fn test_filter_selects_matching_elements() {
        let evaluator = JsonPathEvaluator::compile("$..[?(@.heartRate)]").unwrap();
        let data = json!({"Body": [{"heartRate": "78"}, {"steps": 10}, {"heartRate": "80"}]});

        let tokens = evaluator.select_tokens(&data).unwrap();
        assert_eq!(tokens, vec![json!({"heartRate": "78"}), json!({"heartRate": "80"})]);
    }

    #[test]
    fn test_descendant_filter_matches_flat_payload() {
        let evaluator = JsonPathEvaluator::compile("$..[?(@.heartrate)]").unwrap();
        let event = json!({"heartrate": "60", "device": "abc", "date": "2024-03-01T10:00:00Z"});

        assert_eq!(evaluator.select_tokens(&event).unwrap(), vec![event.clone()]);
        assert!(evaluator.select_tokens(&json!({"steps": 10})).unwrap().is_empty());
    }

    #[test]
    fn test_root_is_only_added_for_descendant_filters() {
        let evaluator = JsonPathEvaluator::compile("$..hr").unwrap();
        let data = json!({"hr": 60, "nested": {"hr": 61}});

        assert_eq!(evaluator.select_tokens(&data).unwrap(), vec![json!(60), json!(61)]);
    }

    #[test]
    fn test_invalid_path_fails_to_compile() {
        let err = JsonPathEvaluator::compile("$.[").unwrap_err();
        assert!(matches!(err, ExpressionError::Compile { .. }));
    }
}
