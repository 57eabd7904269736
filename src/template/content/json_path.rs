use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{
    ContentTemplate, ExtractorDefinition, MeasurementExtractor, Measurements, TokenScope,
    ValueExpression,
};
use crate::expression::{Expression, ExpressionEvaluatorFactory};
use crate::template::registry::{NamedTemplate, TemplateFactory, TemplateFactoryChain};
use crate::template::schema::{self, JsonKind, MemberRule};
use crate::template::TemplateError;

const IOT_DEVICE_ID_EXPRESSION: &str = "$.SystemProperties['iothub-connection-device-id']";
const IOT_TIMESTAMP_EXPRESSION: &str = "$.SystemProperties['iothub-enqueuedtime']";

const VALUE_RULES: &[MemberRule] = &[
    MemberRule::required("valueName", JsonKind::String),
    MemberRule::required("valueExpression", JsonKind::String),
    MemberRule::optional("required", JsonKind::Flag),
];

const JSON_PATH_RULES: &[MemberRule] = &[
    MemberRule::required("typeName", JsonKind::String),
    MemberRule::required("typeMatchExpression", JsonKind::String),
    MemberRule::required("deviceIdExpression", JsonKind::String),
    MemberRule::required("timestampExpression", JsonKind::String),
    MemberRule::optional("patientIdExpression", JsonKind::String),
    MemberRule::optional("encounterIdExpression", JsonKind::String),
    MemberRule::optional("correlationIdExpression", JsonKind::String),
    MemberRule::optional("values", JsonKind::Array).with_members(VALUE_RULES),
];

const IOT_RULES: &[MemberRule] = &[
    MemberRule::required("typeName", JsonKind::String),
    MemberRule::required("typeMatchExpression", JsonKind::String),
    MemberRule::optional("patientIdExpression", JsonKind::String),
    MemberRule::optional("encounterIdExpression", JsonKind::String),
    MemberRule::optional("correlationIdExpression", JsonKind::String),
    MemberRule::optional("values", JsonKind::Array).with_members(VALUE_RULES),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPathValue {
    value_name: String,
    value_expression: String,
    #[serde(default, deserialize_with = "schema::deserialize_flag")]
    required: bool,
}

impl From<JsonPathValue> for ValueExpression {
    fn from(value: JsonPathValue) -> Self {
        ValueExpression {
            name: value.value_name,
            expression: Expression::json_path(value.value_expression),
            required: value.required,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPathContentBody {
    type_name: String,
    type_match_expression: String,
    device_id_expression: String,
    timestamp_expression: String,
    patient_id_expression: Option<String>,
    encounter_id_expression: Option<String>,
    correlation_id_expression: Option<String>,
    #[serde(default)]
    values: Vec<JsonPathValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IotJsonPathContentBody {
    type_name: String,
    type_match_expression: String,
    patient_id_expression: Option<String>,
    encounter_id_expression: Option<String>,
    correlation_id_expression: Option<String>,
    #[serde(default)]
    values: Vec<JsonPathValue>,
}

/// Content template whose expressions are all JSONPath, evaluated against each
/// matched type token.
#[derive(Debug)]
pub struct JsonPathContentTemplate {
    extractor: MeasurementExtractor,
}

impl JsonPathContentTemplate {
    fn build(body: JsonPathContentBody, evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Result<Self, TemplateError> {
        let definition = ExtractorDefinition {
            type_name: body.type_name,
            type_match: Expression::json_path(body.type_match_expression),
            device_id: Expression::json_path(body.device_id_expression),
            timestamp: Expression::json_path(body.timestamp_expression),
            patient_id: body.patient_id_expression.map(Expression::json_path),
            encounter_id: body.encounter_id_expression.map(Expression::json_path),
            correlation_id: body.correlation_id_expression.map(Expression::json_path),
            values: body.values.into_iter().map(ValueExpression::from).collect(),
            scope: TokenScope::Token,
        };

        Ok(JsonPathContentTemplate {
            extractor: MeasurementExtractor::compile(definition, evaluators)?,
        })
    }
}

impl NamedTemplate for JsonPathContentTemplate {
    fn type_name(&self) -> &str {
        self.extractor.type_name()
    }
}

impl ContentTemplate for JsonPathContentTemplate {
    fn get_measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a> {
        self.extractor.measurements(root)
    }
}

/// JSONPath template for IoT hub envelopes
/// (`{ "Body": ..., "Properties": ..., "SystemProperties": ... }`).
///
/// Device id and timestamp always come from the hub's system properties.
/// Expressions are authored against the envelope; the matched token is reachable
/// as `$.matchedToken`.
#[derive(Debug)]
pub struct IotJsonPathContentTemplate {
    extractor: MeasurementExtractor,
}

impl IotJsonPathContentTemplate {
    fn build(body: IotJsonPathContentBody, evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Result<Self, TemplateError> {
        let definition = ExtractorDefinition {
            type_name: body.type_name,
            type_match: Expression::json_path(body.type_match_expression),
            device_id: Expression::json_path(IOT_DEVICE_ID_EXPRESSION),
            timestamp: Expression::json_path(IOT_TIMESTAMP_EXPRESSION),
            patient_id: body.patient_id_expression.map(Expression::json_path),
            encounter_id: body.encounter_id_expression.map(Expression::json_path),
            correlation_id: body.correlation_id_expression.map(Expression::json_path),
            values: body.values.into_iter().map(ValueExpression::from).collect(),
            scope: TokenScope::InjectedRoot,
        };

        Ok(IotJsonPathContentTemplate {
            extractor: MeasurementExtractor::compile(definition, evaluators)?,
        })
    }
}

impl NamedTemplate for IotJsonPathContentTemplate {
    fn type_name(&self) -> &str {
        self.extractor.type_name()
    }
}

impl ContentTemplate for IotJsonPathContentTemplate {
    fn get_measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a> {
        self.extractor.measurements(root)
    }
}

pub struct JsonPathContentTemplateFactory {
    evaluators: Arc<dyn ExpressionEvaluatorFactory>,
}

impl JsonPathContentTemplateFactory {
    pub fn new(evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Self {
        JsonPathContentTemplateFactory { evaluators }
    }
}

impl TemplateFactory<Arc<dyn ContentTemplate>> for JsonPathContentTemplateFactory {
    fn target_name(&self) -> &'static str {
        "JsonPathContent"
    }

    fn create(
        &self,
        body: &Value,
        _chain: &TemplateFactoryChain<Arc<dyn ContentTemplate>>,
    ) -> Result<Vec<Arc<dyn ContentTemplate>>, TemplateError> {
        let body: JsonPathContentBody = schema::deserialize_checked(body, JSON_PATH_RULES)?;
        let template = JsonPathContentTemplate::build(body, Arc::clone(&self.evaluators))?;
        Ok(vec![Arc::new(template)])
    }
}

pub struct IotJsonPathContentTemplateFactory {
    evaluators: Arc<dyn ExpressionEvaluatorFactory>,
}

impl IotJsonPathContentTemplateFactory {
    pub fn new(evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Self {
        IotJsonPathContentTemplateFactory { evaluators }
    }
}

impl TemplateFactory<Arc<dyn ContentTemplate>> for IotJsonPathContentTemplateFactory {
    fn target_name(&self) -> &'static str {
        "IotJsonPathContent"
    }

    fn create(
        &self,
        body: &Value,
        _chain: &TemplateFactoryChain<Arc<dyn ContentTemplate>>,
    ) -> Result<Vec<Arc<dyn ContentTemplate>>, TemplateError> {
        let body: IotJsonPathContentBody = schema::deserialize_checked(body, IOT_RULES)?;
        let template = IotJsonPathContentTemplate::build(body, Arc::clone(&self.evaluators))?;
        Ok(vec![Arc::new(template)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::DefaultExpressionEvaluatorFactory;
    use crate::template::content::{content_template_factory, MeasurementError};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn load(template: Value) -> Arc<dyn ContentTemplate> {
        let chain = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()));
        let mut templates = chain.create_from_value(&template).unwrap();
        templates.remove(0)
    }

    fn heartrate_template() -> Value {
        json!({
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "heartrate",
                "typeMatchExpression": "$..[?(@.heartrate)]",
                "deviceIdExpression": "$.device",
                "timestampExpression": "$.date",
                "values": [
                    {"valueName": "hr", "valueExpression": "$.heartrate", "required": "true"},
                    {"valueName": "spo2", "valueExpression": "$.spo2"}
                ]
            }
        })
    }

    #[test]
    fn test_one_measurement_per_matched_token() {
        let template = load(heartrate_template());
        let event = json!({
            "readings": [
                {"heartrate": "60", "device": "abc", "date": "2024-03-01T10:00:00Z"},
                {"heartrate": 61, "spo2": 98, "device": "abc", "date": "2024-03-01T10:00:05Z"},
                {"steps": 10, "device": "abc", "date": "2024-03-01T10:00:05Z"}
            ]
        });

        let measurements: Vec<_> = template
            .get_measurements(&event)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(measurements.len(), 2);
        assert_eq!(measurements[0].measure_type, "heartrate");
        assert_eq!(measurements[0].device_id, "abc");
        assert_eq!(
            measurements[0].occurrence_time_utc,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(measurements[0].property("hr"), Some("60"));
        assert_eq!(measurements[0].property("spo2"), None);
        assert_eq!(measurements[1].property("hr"), Some("61"));
        assert_eq!(measurements[1].property("spo2"), Some("98"));
    }

    #[test]
    fn test_flat_payload_matches_filter_type_match() {
        let template = load(heartrate_template());
        let event = json!({"heartrate": "60", "device": "abc", "date": "2024-03-01T10:00:00Z"});

        let measurements: Vec<_> = template
            .get_measurements(&event)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].property("hr"), Some("60"));
        assert_eq!(template.get_measurements(&json!({"steps": 10})).count(), 0);
    }

    #[test]
    fn test_required_value_missing_fails_only_that_measurement() {
        let template = load(json!({
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "heartrate",
                "typeMatchExpression": "$.readings[*]",
                "deviceIdExpression": "$.device",
                "timestampExpression": "$.date",
                "values": [{"valueName": "hr", "valueExpression": "$.heartrate", "required": true}]
            }
        }));
        let event = json!({
            "readings": [
                {"device": "abc", "date": "2024-03-01T10:00:00Z"},
                {"heartrate": 70, "device": "abc", "date": "2024-03-01T10:00:00Z"}
            ]
        });

        let results: Vec<_> = template.get_measurements(&event).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            &results[0],
            Err(MeasurementError::RequiredValueMissing { name, .. }) if name == "hr"
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_declared_identity_must_resolve() {
        let template = load(json!({
            "templateType": "JsonPathContent",
            "template": {
                "typeName": "heartrate",
                "typeMatchExpression": "$.readings[*]",
                "deviceIdExpression": "$.device",
                "timestampExpression": "$.date",
                "correlationIdExpression": "$.session"
            }
        }));
        let event = json!({"readings": [{"device": "abc", "date": "2024-03-01T10:00:00Z"}]});

        let results: Vec<_> = template.get_measurements(&event).collect();
        assert!(matches!(
            &results[0],
            Err(MeasurementError::RequiredValueMissing { name, .. }) if name == "correlationId"
        ));
    }

    #[test]
    fn test_missing_device_and_bad_timestamp() {
        let template = load(heartrate_template());

        let no_device = json!({"r": {"heartrate": 1, "date": "2024-03-01T10:00:00Z"}});
        let results: Vec<_> = template.get_measurements(&no_device).collect();
        assert!(matches!(
            &results[0],
            Err(MeasurementError::RequiredValueMissing { name, .. }) if name == "deviceId"
        ));

        let bad_time = json!({"r": {"heartrate": 1, "device": "abc", "date": "soon"}});
        let results: Vec<_> = template.get_measurements(&bad_time).collect();
        assert!(matches!(&results[0], Err(MeasurementError::InvalidTimestamp { .. })));
    }

    #[test]
    fn test_invalid_body_reports_all_violations() {
        let chain = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()));
        let err = chain
            .create_from_value(&json!({
                "templateType": "JsonPathContentTemplate",
                "template": {"typeName": "heartrate", "values": [{"valueName": "hr"}]}
            }))
            .unwrap_err();

        assert_eq!(
            err.violations(),
            &[
                "$.typeMatchExpression: required member missing".to_string(),
                "$.deviceIdExpression: required member missing".to_string(),
                "$.timestampExpression: required member missing".to_string(),
                "$.values[0].valueExpression: required member missing".to_string(),
            ]
        );
    }

    #[test]
    fn test_invalid_expression_fails_at_load() {
        let chain = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()));
        let mut template = heartrate_template();
        template["template"]["deviceIdExpression"] = json!("$.[");

        let err = chain.create_from_value(&template).unwrap_err();
        assert!(matches!(err, TemplateError::Expression(_)));
    }

    #[test]
    fn test_iot_template_reads_system_properties() {
        let template = load(json!({
            "templateType": "IotJsonPathContent",
            "template": {
                "typeName": "heartrate",
                "typeMatchExpression": "$..[?(@.heartRate)]",
                "patientIdExpression": "$.Properties.patient",
                "values": [{"valueName": "hr", "valueExpression": "$.matchedToken.heartRate", "required": true}]
            }
        }));
        let event = json!({
            "Body": {"heartRate": 72},
            "Properties": {"patient": "p1"},
            "SystemProperties": {
                "iothub-connection-device-id": "device-7",
                "iothub-enqueuedtime": "2024-03-01T10:00:00Z"
            }
        });

        let measurements: Vec<_> = template
            .get_measurements(&event)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].device_id, "device-7");
        assert_eq!(measurements[0].patient_id.as_deref(), Some("p1"));
        assert_eq!(measurements[0].property("hr"), Some("72"));
    }
}
