//! Template validation
//!
//! Loads device and FHIR mapping documents and runs sample events through them
//! without touching a FHIR store, reporting everything that would go wrong.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::expression::{DefaultExpressionEvaluatorFactory, ExpressionEvaluatorFactory};
use crate::fhir::{Observation, ObservationProcessor};
use crate::measurement::{Measurement, MeasurementGroup};
use crate::template::{
    content_template_factory, fhir_template_factory, CollectionContentTemplate, ContentTemplate, FhirTemplate,
    NamedTemplate, TemplateCollection, TemplateError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationCategory {
    Normalization,
    FhirTransformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub category: ValidationCategory,
    pub message: String,
}

impl ValidationIssue {
    fn normalization(message: impl Into<String>) -> Self {
        ValidationIssue {
            category: ValidationCategory::Normalization,
            message: message.into(),
        }
    }

    fn fhir(message: impl Into<String>) -> Self {
        ValidationIssue {
            category: ValidationCategory::FhirTransformation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateResult {
    pub exceptions: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResult {
    pub device_event: Value,
    pub measurements: Vec<Measurement>,
    pub observations: Vec<Observation>,
    pub exceptions: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub template_result: TemplateResult,
    pub device_results: Vec<DeviceResult>,
}

impl ValidationResult {
    pub fn has_exceptions(&self) -> bool {
        !self.template_result.exceptions.is_empty()
            || self.device_results.iter().any(|result| !result.exceptions.is_empty())
    }
}

pub struct TemplateValidator {
    evaluators: Arc<dyn ExpressionEvaluatorFactory>,
    processor: ObservationProcessor,
}

impl TemplateValidator {
    pub fn new(evaluators: Arc<dyn ExpressionEvaluatorFactory>) -> Self {
        TemplateValidator {
            evaluators,
            processor: ObservationProcessor::default(),
        }
    }

    /// Validates whichever mappings are given and runs `events` through them.
    pub fn validate(&self, device_mapping: Option<&str>, fhir_mapping: Option<&str>, events: &[Value]) -> ValidationResult {
        let mut result = ValidationResult::default();
        let template_result = &mut result.template_result;

        let content = device_mapping.and_then(|text| {
            match content_template_factory(Arc::clone(&self.evaluators)).load(text) {
                Ok(templates) => Some(CollectionContentTemplate::new(templates)),
                Err(err) => {
                    push_template_error(&mut template_result.exceptions, ValidationCategory::Normalization, err);
                    None
                }
            }
        });
        let fhir_templates = fhir_mapping.and_then(|text| match fhir_template_factory().load(text) {
            Ok(templates) => Some(templates),
            Err(err) => {
                push_template_error(&mut template_result.exceptions, ValidationCategory::FhirTransformation, err);
                None
            }
        });

        if device_mapping.is_none() && fhir_mapping.is_none() {
            template_result
                .exceptions
                .push(ValidationIssue::normalization("No device or FHIR mapping was provided"));
        }

        if let (Some(content), Some(fhir_templates)) = (&content, &fhir_templates) {
            for template in content.templates() {
                if !fhir_templates.contains(template.type_name()) {
                    template_result.warnings.push(ValidationIssue::fhir(format!(
                        "No FHIR template exists for device template type '{}'",
                        template.type_name()
                    )));
                }
            }
        }

        if !events.is_empty() && content.is_none() && device_mapping.is_none() {
            template_result.exceptions.push(ValidationIssue::normalization(
                "A device mapping is required to validate device events",
            ));
        }

        if let Some(content) = &content {
            result.device_results = events
                .iter()
                .map(|event| self.validate_event(content, fhir_templates.as_ref(), event))
                .collect();
        }

        result
    }

    fn validate_event(
        &self,
        content: &CollectionContentTemplate,
        fhir_templates: Option<&TemplateCollection<FhirTemplate>>,
        event: &Value,
    ) -> DeviceResult {
        let mut device_result = DeviceResult {
            device_event: event.clone(),
            measurements: Vec::new(),
            observations: Vec::new(),
            exceptions: Vec::new(),
            warnings: Vec::new(),
        };

        for measurement in content.get_measurements(event) {
            match measurement {
                Ok(measurement) => device_result.measurements.push(measurement),
                Err(err) => device_result.exceptions.push(ValidationIssue::normalization(err.to_string())),
            }
        }

        if device_result.measurements.is_empty() && device_result.exceptions.is_empty() {
            device_result
                .warnings
                .push(ValidationIssue::normalization("No measurements were produced for the event"));
        }

        let Some(fhir_templates) = fhir_templates else {
            return device_result;
        };

        for group in MeasurementGroup::group(device_result.measurements.clone()) {
            let Some(template) = fhir_templates.get(group.measure_type()) else {
                device_result.warnings.push(ValidationIssue::fhir(format!(
                    "No FHIR template exists for measurement type '{}'",
                    group.measure_type()
                )));
                continue;
            };

            let windows = match self.processor.create_observation_groups(template, &group) {
                Ok(windows) => windows,
                Err(err) => {
                    device_result.exceptions.push(ValidationIssue::fhir(err.to_string()));
                    continue;
                }
            };
            for window in &windows {
                match self.processor.create_observation(template, window) {
                    Ok(observation) => device_result.observations.push(observation),
                    Err(err) => device_result.exceptions.push(ValidationIssue::fhir(err.to_string())),
                }
            }
        }

        device_result
    }
}

impl Default for TemplateValidator {
    fn default() -> Self {
        Self::new(Arc::new(DefaultExpressionEvaluatorFactory::new()))
    }
}

impl std::fmt::Debug for TemplateValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateValidator")
            .field("processor", &self.processor)
            .finish()
    }
}

/// Reports each schema violation separately.
fn push_template_error(issues: &mut Vec<ValidationIssue>, category: ValidationCategory, err: TemplateError) {
    let messages = match err {
        TemplateError::InvalidTemplate { errors } => errors,
        other => vec![other.to_string()],
    };
    issues.extend(messages.into_iter().map(|message| ValidationIssue { category, message }));
}
