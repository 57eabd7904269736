use super::{single_value, unexpected_element, unexpected_template, FhirValueEncoder, ObservationData};
use crate::fhir::{CodeableConcept, Coding, ElementValue, ObservationError};
use crate::template::{FhirCode, FhirValueKind, FhirValueType};

/// Encodes a value as a `CodeableConcept` built from the template codes.
///
/// The concept text is the template's text, or the raw value when the template
/// has none.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeableConceptValueEncoder;

impl FhirValueEncoder for CodeableConceptValueEncoder {
    fn kind(&self) -> FhirValueKind {
        FhirValueKind::CodeableConcept
    }

    fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError> {
        let FhirValueType::CodeableConcept(concept) = template else {
            return Err(unexpected_template(self.kind(), template));
        };

        let raw = single_value(template, data)?;
        Ok(ElementValue::CodeableConcept(CodeableConcept {
            coding: concept.codes.iter().map(Coding::from).collect(),
            text: Some(concept.text.clone().unwrap_or_else(|| raw.to_string())),
        }))
    }

    fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError> {
        match existing {
            ElementValue::CodeableConcept(_) => self.create_value(template, data),
            other => Err(unexpected_element(self.kind(), &other)),
        }
    }
}

impl From<&FhirCode> for Coding {
    fn from(code: &FhirCode) -> Self {
        Coding {
            system: code.system.clone(),
            code: Some(code.code.clone()),
            display: code.display.clone(),
        }
    }
}
