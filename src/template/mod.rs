//! Templates
//!
//! Two families of templates drive the connector:
//! - content templates turn one raw device event into measurements
//! - FHIR templates describe how a group of measurements becomes an Observation
//!
//! Both arrive wrapped in the same self-describing envelope,
//! `{ "templateType": ..., "template": ... }`, and are built by a chain of
//! per-type factories (see [`registry`]).

pub mod content;
pub mod fhir;
pub mod registry;
pub mod schema;

pub use content::{
    content_template_factory, CollectionContentTemplate, ContentTemplate, MeasurementError,
    Measurements,
};
pub use fhir::{
    fhir_template_factory, CodeValueFhirTemplate, FhirCategory, FhirCode, FhirComponentTemplate,
    FhirTemplate, FhirTemplateKind, FhirValueKind, FhirValueType, PeriodInterval,
};
pub use registry::{
    CollectionTemplateFactory, NamedTemplate, TemplateCollection, TemplateFactory,
    TemplateFactoryChain,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expression::ExpressionError;
use schema::{JsonKind, MemberRule};

const TEMPLATE_SUFFIX: &str = "template";

/// Errors raised while loading templates.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid template: {}", .errors.join("; "))]
    InvalidTemplate { errors: Vec<String> },

    #[error("No template found for template type '{0}'")]
    TemplateNotFound(String),

    #[error("Duplicate template defined for type name '{0}'")]
    DuplicateTemplate(String),

    #[error("Template document is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl TemplateError {
    pub fn invalid(errors: Vec<String>) -> Self {
        TemplateError::InvalidTemplate { errors }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TemplateError::TemplateNotFound(_))
    }

    /// Violations carried by an invalid-template error.
    pub fn violations(&self) -> &[String] {
        match self {
            TemplateError::InvalidTemplate { errors } => errors,
            _ => &[],
        }
    }
}

const CONTAINER_RULES: &[MemberRule] = &[
    MemberRule::required("templateType", JsonKind::String),
    MemberRule::required("template", JsonKind::Any),
];

/// The envelope every template document is wrapped in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContainer {
    pub template_type: String,
    pub template: Value,
}

impl TemplateContainer {
    pub fn new(template_type: impl Into<String>, template: Value) -> Self {
        TemplateContainer {
            template_type: template_type.into(),
            template,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, TemplateError> {
        schema::deserialize_checked(value, CONTAINER_RULES)
    }

    /// Case-insensitive match on the target name, ignoring a `Template` suffix on
    /// either side.
    pub fn matches(&self, target: &str) -> bool {
        normalize_type_name(&self.template_type) == normalize_type_name(target)
    }
}

fn normalize_type_name(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    match lowered.strip_suffix(TEMPLATE_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => lowered,
    }
}
