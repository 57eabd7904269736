use super::{single_value, unexpected_element, unexpected_template, FhirValueEncoder, ObservationData};
use crate::fhir::{ElementValue, ObservationError, Quantity};
use crate::template::{FhirValueKind, FhirValueType};

/// Encodes a single decimal as a `Quantity`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantityValueEncoder;

impl FhirValueEncoder for QuantityValueEncoder {
    fn kind(&self) -> FhirValueKind {
        FhirValueKind::Quantity
    }

    fn create_value(&self, template: &FhirValueType, data: &ObservationData<'_>) -> Result<ElementValue, ObservationError> {
        let FhirValueType::Quantity(quantity) = template else {
            return Err(unexpected_template(self.kind(), template));
        };

        let raw = single_value(template, data)?;
        let value = raw.trim().parse::<f64>().map_err(|_| {
            ObservationError::invalid_data(&quantity.value_name, format!("'{}' is not a decimal", raw))
        })?;

        Ok(ElementValue::Quantity(Quantity {
            value: Some(value),
            unit: quantity.unit.clone(),
            system: quantity.system.clone(),
            code: quantity.code.clone(),
        }))
    }

    fn merge_value(
        &self,
        template: &FhirValueType,
        data: &ObservationData<'_>,
        existing: ElementValue,
    ) -> Result<ElementValue, ObservationError> {
        match existing {
            ElementValue::Quantity(_) => self.create_value(template, data),
            other => Err(unexpected_element(self.kind(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Boundary;
    use crate::template::fhir::{QuantityValueType, StringValueType};
    use chrono::{TimeZone, Utc};

    fn template() -> FhirValueType {
        FhirValueType::Quantity(QuantityValueType {
            value_name: "hr".to_string(),
            unit: Some("count/min".to_string()),
            system: Some("http://unitsofmeasure.org".to_string()),
            code: Some("/min".to_string()),
        })
    }

    fn encode(values: &[&str]) -> Result<ElementValue, ObservationError> {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let values: Vec<_> = values.iter().map(|v| (time, v.to_string())).collect();
        QuantityValueEncoder.create_value(&template(), &ObservationData::new(Boundary::instant(time), &values))
    }

    #[test]
    fn test_create_quantity() {
        assert_eq!(
            encode(&["72.5"]).unwrap(),
            ElementValue::Quantity(Quantity {
                value: Some(72.5),
                unit: Some("count/min".to_string()),
                system: Some("http://unitsofmeasure.org".to_string()),
                code: Some("/min".to_string()),
            })
        );
    }

    #[test]
    fn test_requires_exactly_one_decimal() {
        assert!(matches!(encode(&[]), Err(ObservationError::InvalidData { .. })));
        assert!(matches!(encode(&["1", "2"]), Err(ObservationError::InvalidData { .. })));
        assert!(matches!(encode(&["fast"]), Err(ObservationError::InvalidData { .. })));
    }

    #[test]
    fn test_rejects_foreign_template_and_element() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let values = vec![(time, "1".to_string())];
        let data = ObservationData::new(Boundary::instant(time), &values);
        let string_template = FhirValueType::String(StringValueType {
            value_name: "hr".to_string(),
        });

        assert!(matches!(
            QuantityValueEncoder.create_value(&string_template, &data),
            Err(ObservationError::NotSupported(_))
        ));
        assert!(matches!(
            QuantityValueEncoder.merge_value(&template(), &data, ElementValue::String("1".to_string())),
            Err(ObservationError::NotSupported(_))
        ));
        assert!(QuantityValueEncoder
            .merge_value(&template(), &data, encode(&["5"]).unwrap())
            .is_ok());
    }
}
