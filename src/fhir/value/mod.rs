//! Value encoders
//!
//! One encoder per [`FhirValueKind`]. Each can build a fresh FHIR value from an
//! observation window and merge a window into a value that was persisted before.

mod codeable_concept;
mod quantity;
mod sampled_data;
mod string;

pub use codeable_concept::CodeableConceptValueEncoder;
pub use quantity::QuantityValueEncoder;
pub use sampled_data::{SampledDataValueEncoder, MAX_SAMPLE_SLOTS};
pub use string::StringValueEncoder;

use std::collections::HashMap;
use std::fmt;

use super::{ElementValue, ObservationError};
use crate::observation::{Boundary, TimedValue};
use crate::template::{FhirValueKind, FhirValueType};

/// Everything an encoder knows about the window being written.
#[derive(Debug, Clone, Copy)]
pub struct ObservationData<'a> {
    /// Boundary of the window the values come from
    pub data_period: Boundary,
    /// Effective period of the resulting observation
    pub observation_period: Boundary,
    /// Effective period of the observation being merged into, if any
    pub existing_period: Option<Boundary>,
    /// Time-ordered values of the encoded property
    pub values: &'a [TimedValue],
}

impl<'a> ObservationData<'a> {
    pub fn new(period: Boundary, values: &'a [TimedValue]) -> Self {
        ObservationData {
            data_period: period,
            observation_period: period,
            existing_period: None,
            values,
        }
    }

    /// Data merged into an observation whose effective period is `existing_period`.
    pub fn merging(data_period: Boundary, existing_period: Option<Boundary>, values: &'a [TimedValue]) -> Self {
        let observation_period = existing_period
            .map(|existing| existing.union(&data_period))
            .unwrap_or(data_period);
        ObservationData {
            data_period,
            observation_period,
            existing_period,
            values,
        }
    }
}

pub trait FhirValueEncoder: Send + Sync {
    fn kind(&self) -> FhirValueKind;

    fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError>;

    /// Merges the window into `existing`, which must be of this encoder's kind.
    fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError>;
}

/// Dispatch table from value kind to its encoder.
pub struct FhirValueEncoderRegistry {
    encoders: HashMap<FhirValueKind, Box<dyn FhirValueEncoder>>,
}

impl FhirValueEncoderRegistry {
    pub fn empty() -> Self {
        FhirValueEncoderRegistry {
            encoders: HashMap::new(),
        }
    }

    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(QuantityValueEncoder);
        registry.register(StringValueEncoder);
        registry.register(CodeableConceptValueEncoder);
        registry.register(SampledDataValueEncoder::default());
        registry
    }

    pub fn register(&mut self, encoder: impl FhirValueEncoder + 'static) {
        self.encoders.insert(encoder.kind(), Box::new(encoder));
    }

    pub fn encoder(&self, kind: FhirValueKind) -> Result<&dyn FhirValueEncoder, ObservationError> {
        self.encoders
            .get(&kind)
            .map(|encoder| encoder.as_ref())
            .ok_or_else(|| ObservationError::not_supported(format!("no encoder registered for {}", kind)))
    }

    pub fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError> {
        self.encoder(template.kind())?.create_value(template, data)
    }

    pub fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError> {
        self.encoder(template.kind())?.merge_value(template, data, existing)
    }
}

impl Default for FhirValueEncoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FhirValueEncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.encoders.keys().collect();
        kinds.sort();
        f.debug_struct("FhirValueEncoderRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

/// The one value a single-valued encoder needs.
pub(crate) fn single_value<'a>(template: &FhirValueType, data: &ObservationData<'a>) -> Result<&'a str, ObservationError> {
    match data.values {
        [(_, value)] => Ok(value.as_str()),
        values => Err(ObservationError::invalid_data(
            template.value_name(),
            format!("expected exactly one value in the window, found {}", values.len()),
        )),
    }
}

pub(crate) fn unexpected_template(encoder: FhirValueKind, template: &FhirValueType) -> ObservationError {
    ObservationError::not_supported(format!(
        "{} encoder cannot encode {} value '{}'",
        encoder,
        template.kind(),
        template.value_name()
    ))
}

pub(crate) fn unexpected_element(encoder: FhirValueKind, existing: &ElementValue) -> ObservationError {
    ObservationError::not_supported(format!(
        "{} encoder cannot merge into an existing {} value",
        encoder,
        existing.type_name()
    ))
}
