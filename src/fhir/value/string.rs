use super::{single_value, unexpected_element, unexpected_template, FhirValueEncoder, ObservationData};
use crate::fhir::{ElementValue, ObservationError};
use crate::template::{FhirValueKind, FhirValueType};

/// Passes the raw value through as `valueString`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringValueEncoder;

impl FhirValueEncoder for StringValueEncoder {
    fn kind(&self) -> FhirValueKind {
        FhirValueKind::String
    }

    fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError> {
        if !matches!(template, FhirValueType::String(_)) {
            return Err(unexpected_template(self.kind(), template));
        }
        single_value(template, data).map(|value| ElementValue::String(value.to_string()))
    }

    fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError> {
        match existing {
            ElementValue::String(_) => self.create_value(template, data),
            other => Err(unexpected_element(self.kind(), &other)),
        }
    }
}
