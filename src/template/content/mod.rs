//! Content templates
//!
//! A content template turns one raw device event into measurements. It selects
//! "type tokens" (one per candidate sample) with a type match expression, then reads
//! the device id, timestamp, optional identities and named values for each token.
//! Every produced element is a `Result`, so one bad sample never hides the others.

mod calculated;
mod collection;
mod json_path;

pub use calculated::{CalculatedContentTemplate, CalculatedContentTemplateFactory};
pub use collection::CollectionContentTemplate;
pub use json_path::{
    IotJsonPathContentTemplate, IotJsonPathContentTemplateFactory, JsonPathContentTemplate,
    JsonPathContentTemplateFactory,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::registry::{CollectionTemplateFactory, NamedTemplate, TemplateFactoryChain};
use crate::expression::{
    CachingExpressionEvaluatorFactory, Expression, ExpressionError, ExpressionEvaluator,
    ExpressionEvaluatorFactory, ExpressionLanguage,
};
use crate::measurement::Measurement;

/// Key under which the matched type token is exposed to field expressions.
pub const MATCHED_TOKEN_KEY: &str = "matchedToken";

pub type Measurements<'a> = Box<dyn Iterator<Item = Result<Measurement, MeasurementError>> + 'a>;

/// Failure to build a single measurement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeasurementError {
    #[error("Required value '{name}' was not found for template '{type_name}'")]
    RequiredValueMissing { type_name: String, name: String },

    #[error("Value '{value}' is not a valid timestamp for template '{type_name}'")]
    InvalidTimestamp { type_name: String, value: String },

    #[error("Expression failed for template '{type_name}': {source}")]
    Expression {
        type_name: String,
        #[source]
        source: ExpressionError,
    },
}

impl MeasurementError {
    pub fn type_name(&self) -> &str {
        match self {
            MeasurementError::RequiredValueMissing { type_name, .. }
            | MeasurementError::InvalidTimestamp { type_name, .. }
            | MeasurementError::Expression { type_name, .. } => type_name,
        }
    }
}

/// Turns one raw device event into measurements.
pub trait ContentTemplate: NamedTemplate + Send + Sync + fmt::Debug {
    /// Lazily extracts one measurement per matched type token.
    fn get_measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a>;
}

/// The factory chain for device content documents.
pub fn content_template_factory(
    evaluators: Arc<dyn ExpressionEvaluatorFactory>,
) -> TemplateFactoryChain<Arc<dyn ContentTemplate>> {
    TemplateFactoryChain::new()
        .with(JsonPathContentTemplateFactory::new(Arc::clone(&evaluators)))
        .with(IotJsonPathContentTemplateFactory::new(Arc::clone(&evaluators)))
        .with(CalculatedContentTemplateFactory::new(evaluators))
        .with(CollectionTemplateFactory::new("CollectionContent"))
}

/// An expression as authored in a template: a bare string in the template's
/// default language, or an explicit `{ value, language }` pair.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TemplateExpression {
    Text(String),
    Qualified {
        value: String,
        #[serde(default)]
        language: Option<ExpressionLanguage>,
    },
}

impl TemplateExpression {
    pub fn resolve(self, default_language: ExpressionLanguage) -> Expression {
        match self {
            TemplateExpression::Text(value) => Expression::new(value, default_language),
            TemplateExpression::Qualified { value, language } => {
                Expression::new(value, language.unwrap_or(default_language))
            }
        }
    }
}

/// Where field expressions are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenScope {
    /// Directly against the matched type token
    Token,
    /// Against a copy of the event root carrying the token under [`MATCHED_TOKEN_KEY`]
    InjectedRoot,
}

#[derive(Debug, Clone)]
pub(crate) struct ValueExpression {
    pub name: String,
    pub expression: Expression,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ExtractorDefinition {
    pub type_name: String,
    pub type_match: Expression,
    pub device_id: Expression,
    pub timestamp: Expression,
    pub patient_id: Option<Expression>,
    pub encounter_id: Option<Expression>,
    pub correlation_id: Option<Expression>,
    pub values: Vec<ValueExpression>,
    pub scope: TokenScope,
}

impl ExtractorDefinition {
    fn expressions(&self) -> impl Iterator<Item = &Expression> {
        [&self.type_match, &self.device_id, &self.timestamp]
            .into_iter()
            .chain(self.patient_id.iter())
            .chain(self.encounter_id.iter())
            .chain(self.correlation_id.iter())
            .chain(self.values.iter().map(|v| &v.expression))
    }
}

/// The extraction algorithm shared by every content template dialect.
pub(crate) struct MeasurementExtractor {
    definition: ExtractorDefinition,
    evaluators: CachingExpressionEvaluatorFactory,
}

impl MeasurementExtractor {
    pub fn compile(
        definition: ExtractorDefinition,
        factory: Arc<dyn ExpressionEvaluatorFactory>,
    ) -> Result<Self, ExpressionError> {
        let evaluators = CachingExpressionEvaluatorFactory::precompile(factory, definition.expressions())?;
        Ok(MeasurementExtractor {
            definition,
            evaluators,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.definition.type_name
    }

    pub fn measurements<'a>(&'a self, root: &'a Value) -> Measurements<'a> {
        let tokens = match self
            .evaluator(&self.definition.type_match)
            .and_then(|evaluator| evaluator.select_tokens(root))
        {
            Ok(tokens) => tokens,
            Err(e) => return Box::new(std::iter::once(Err(self.expression_error(e)))),
        };

        Box::new(
            tokens
                .into_iter()
                .map(move |token| self.create_measurement(root, token)),
        )
    }

    fn create_measurement(&self, root: &Value, token: Value) -> Result<Measurement, MeasurementError> {
        let definition = &self.definition;
        let context = match definition.scope {
            TokenScope::Token => token,
            TokenScope::InjectedRoot => inject_matched_token(root, token),
        };

        let device_id = self.required(&definition.device_id, &context, "deviceId")?;
        let timestamp = self.required_token(&definition.timestamp, &context, "timestamp")?;
        let occurrence_time_utc =
            parse_timestamp(&timestamp).ok_or_else(|| MeasurementError::InvalidTimestamp {
                type_name: definition.type_name.clone(),
                value: token_to_string(&timestamp),
            })?;

        let mut measurement = Measurement::new(&definition.type_name, device_id, occurrence_time_utc);
        measurement.patient_id = self.declared(definition.patient_id.as_ref(), &context, "patientId")?;
        measurement.encounter_id =
            self.declared(definition.encounter_id.as_ref(), &context, "encounterId")?;
        measurement.correlation_id =
            self.declared(definition.correlation_id.as_ref(), &context, "correlationId")?;

        for value in &definition.values {
            match self.select(&value.expression, &context)? {
                Some(token) => measurement.add_property(&value.name, token_to_string(&token)),
                None if value.required => return Err(self.missing(&value.name)),
                None => {}
            }
        }

        Ok(measurement)
    }

    /// An identity expression is optional, but once declared it must resolve.
    fn declared(
        &self,
        expression: Option<&Expression>,
        context: &Value,
        name: &str,
    ) -> Result<Option<String>, MeasurementError> {
        expression
            .map(|expression| self.required(expression, context, name))
            .transpose()
    }

    fn required(&self, expression: &Expression, context: &Value, name: &str) -> Result<String, MeasurementError> {
        self.required_token(expression, context, name)
            .map(|token| token_to_string(&token))
    }

    fn required_token(&self, expression: &Expression, context: &Value, name: &str) -> Result<Value, MeasurementError> {
        self.select(expression, context)?
            .ok_or_else(|| self.missing(name))
    }

    fn select(&self, expression: &Expression, context: &Value) -> Result<Option<Value>, MeasurementError> {
        self.evaluator(expression)
            .and_then(|evaluator| evaluator.select_token(context))
            .map_err(|e| self.expression_error(e))
    }

    fn evaluator(&self, expression: &Expression) -> Result<Arc<dyn ExpressionEvaluator>, ExpressionError> {
        self.evaluators.create(expression)
    }

    fn missing(&self, name: &str) -> MeasurementError {
        MeasurementError::RequiredValueMissing {
            type_name: self.definition.type_name.clone(),
            name: name.to_string(),
        }
    }

    fn expression_error(&self, source: ExpressionError) -> MeasurementError {
        MeasurementError::Expression {
            type_name: self.definition.type_name.clone(),
            source,
        }
    }
}

impl fmt::Debug for MeasurementExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementExtractor")
            .field("definition", &self.definition)
            .field("evaluators", &self.evaluators)
            .finish()
    }
}

fn inject_matched_token(root: &Value, token: Value) -> Value {
    let mut context = match root {
        Value::Object(object) => object.clone(),
        _ => Map::new(),
    };
    context.insert(MATCHED_TOKEN_KEY.to_string(), token);
    Value::Object(context)
}

/// Strings are taken verbatim, anything else as its compact JSON text.
pub fn token_to_string(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// RFC 3339, or a date-time without offset read as UTC.
pub fn parse_timestamp(token: &Value) -> Option<DateTime<Utc>> {
    let raw = token.as_str()?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
