use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{
    ContentTemplate, ExtractorDefinition, MeasurementExtractor, Measurements, TemplateExpression,
    TokenScope, ValueExpression,
};
use crate::expression::{ExpressionEvaluatorFactory, ExpressionLanguage};
use crate::template::registry::{NamedTemplate, TemplateFactory, TemplateFactoryChain};
use crate::template::schema::{self, JsonKind, MemberRule};
use crate::template::TemplateError;

const VALUE_RULES: &[MemberRule] = &[
    MemberRule::required("valueName", JsonKind::String),
    MemberRule::required("valueExpression", JsonKind::Expression),
    MemberRule::optional("required", JsonKind::Flag),
];

const CALCULATED_RULES: &[MemberRule] = &[
    MemberRule::required("typeName", JsonKind::String),
    MemberRule::optional("defaultExpressionLanguage", JsonKind::String),
    MemberRule::required("typeMatchExpression", JsonKind::Expression),
    MemberRule::required("deviceIdExpression", JsonKind::Expression),
    MemberRule::required("timestampExpression", JsonKind::Expression),
    MemberRule::optional("patientIdExpression", JsonKind::Expression),
    MemberRule::optional("encounterIdExpression", JsonKind::Expression),
    MemberRule::optional("correlationIdExpression", JsonKind::Expression),
    MemberRule::optional("values", JsonKind::Array).with_members(VALUE_RULES),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculatedValue {
    value_name: String,
    value_expression: TemplateExpression,
    #[serde(default, deserialize_with = "schema::deserialize_flag")]
    required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalculatedContentBody {
    type_name: String,
    #[serde(default)]
    default_expression_language: ExpressionLanguage,
    type_match_expression: TemplateExpression,
    device_id_expression: TemplateExpression,
    timestamp_expression: TemplateExpression,
    patient_id_expression: Option<TemplateExpression>,
    encounter_id_expression: Option<TemplateExpression>,
    correlation_id_expression: Option<TemplateExpression>,
    #[serde(default)]
    values: Vec<CalculatedValue>,
}

/// Content template where each expression picks its own language.
///
/// JMESPath expressions can call the connector function library. Field
/// expressions run against the event root with the matched type token available
/// under `matchedToken`.
#[derive(Debug)]
pub struct CalculatedContentTemplate {
    extractor: MeasurementExtractor,
}

impl CalculatedContentTemplate {
    fn build(body: CalculatedContentBody, evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Result<Self, TemplateError> {
        let language = body.default_expression_language;
        let resolve = |expression: TemplateExpression| expression.resolve(language);

        let definition = ExtractorDefinition {
            type_name: body.type_name,
            type_match: resolve(body.type_match_expression),
            device_id: resolve(body.device_id_expression),
            timestamp: resolve(body.timestamp_expression),
            patient_id: body.patient_id_expression.map(resolve),
            encounter_id: body.encounter_id_expression.map(resolve),
            correlation_id: body.correlation_id_expression.map(resolve),
            values: body
                .values
                .into_iter()
                .map(|value| ValueExpression {
                    name: value.value_name,
                    expression: resolve(value.value_expression),
                    required: value.required,
                })
                .collect(),
            scope: TokenScope::InjectedRoot,
        };

        Ok(CalculatedContentTemplate {
            extractor: MeasurementExtractor::compile(definition, evaluators)?,
        })
    }
}

impl NamedTemplate for CalculatedContentTemplate {
    fn type_name(&self) -> &str {
        self.extractor.type_name()
    }
}

impl ContentTemplate for CalculatedContentTemplate {
    fn get_measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a> {
        self.extractor.measurements(root)
    }
}

pub struct CalculatedContentTemplateFactory {
    evaluators: Arc<dyn ExpressionEvaluatorFactory>,
}

impl CalculatedContentTemplateFactory {
    pub fn new(evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Self {
        CalculatedContentTemplateFactory { evaluators }
    }
}

impl TemplateFactory<Arc<dyn ContentTemplate>> for CalculatedContentTemplateFactory {
    fn target_name(&self) -> &'static str {
        "CalculatedContent"
    }

    fn create(
        &self,
        body: &Value,
        _chain: &TemplateFactoryChain<Arc<dyn ContentTemplate>>,
    ) -> Result<Vec<Arc<dyn ContentTemplate>>, TemplateError> {
        let body: CalculatedContentBody = schema::deserialize_checked(body, CALCULATED_RULES)?;
        let template = CalculatedContentTemplate::build(body, Arc::clone(&self.evaluators))?;
        Ok(vec![Arc::new(template)])
    }
}
