//! FHIR Observation building
//!
//! This module holds the subset of the FHIR R4 model the connector writes, the
//! value encoders that render observation windows as FHIR values, and the template
//! processors that assemble and merge whole Observations.

pub mod processor;
pub mod resources;
pub mod value;

pub use processor::{
    CodeValueFhirTemplateProcessor, FhirTemplateProcessor, ObservationProcessor,
    CONNECTOR_CODING_SYSTEM,
};
pub use resources::{
    CodeableConcept, Coding, Device, ElementValue, Identifier, Meta, Observation,
    ObservationComponent, ObservationStatus, Patient, Period, Quantity, Reference, SampledData,
};
pub use value::{FhirValueEncoder, FhirValueEncoderRegistry, ObservationData};

use crate::template::FhirTemplateKind;

/// Errors raised while encoding or merging observations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObservationError {
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid data for value '{value_name}': {message}")]
    InvalidData { value_name: String, message: String },

    #[error("No processor registered for {0:?} templates")]
    ProcessorNotFound(FhirTemplateKind),
}

impl ObservationError {
    pub fn not_supported(message: impl Into<String>) -> Self {
        ObservationError::NotSupported(message.into())
    }

    pub fn invalid_data(value_name: &str, message: impl Into<String>) -> Self {
        ObservationError::InvalidData {
            value_name: value_name.to_string(),
            message: message.into(),
        }
    }
}
