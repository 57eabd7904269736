use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::resources::{CodeableConcept, Coding, ElementValue, Observation, ObservationComponent, ObservationStatus};
use super::value::{FhirValueEncoderRegistry, ObservationData};
use super::ObservationError;
use crate::measurement::MeasurementGroup;
use crate::observation::{create_observation_groups, Boundary, ObservationGroup};
use crate::template::{CodeValueFhirTemplate, FhirCode, FhirTemplate, FhirTemplateKind, FhirValueKind, FhirValueType};

/// Coding system of the coding the connector adds to every code it writes.
pub const CONNECTOR_CODING_SYSTEM: &str = "https://emberlink.dev/fhir/coding";

/// Builds and merges Observations for one kind of FHIR template.
pub trait FhirTemplateProcessor: Send + Sync {
    fn kind(&self) -> FhirTemplateKind;

    fn create_observation_groups(
        &self,
        template: &FhirTemplate,
        group: &MeasurementGroup,
    ) -> Result<Vec<ObservationGroup>, ObservationError>;

    fn create_observation(&self, template: &FhirTemplate, group: &ObservationGroup) -> Result<Observation, ObservationError>;

    /// Merges the window into a copy of `existing`; `existing` is never modified.
    fn merge_observation(
        &self,
        template: &FhirTemplate,
        group: &ObservationGroup,
        existing: &Observation,
    ) -> Result<Observation, ObservationError>;
}

pub struct CodeValueFhirTemplateProcessor {
    encoders: Arc<FhirValueEncoderRegistry>,
}

impl CodeValueFhirTemplateProcessor {
    pub fn new(encoders: Arc<FhirValueEncoderRegistry>) -> Self {
        CodeValueFhirTemplateProcessor { encoders }
    }

    fn template<'t>(&self, template: &'t FhirTemplate) -> &'t CodeValueFhirTemplate {
        match template {
            FhirTemplate::CodeValue(code_value) => code_value,
        }
    }

    /// Encodes one templated value, merging into `existing` when present.
    ///
    /// SampledData is re-encoded even when the window has no samples for it, so
    /// every series stays anchored at the observation's effective start.
    fn encode_value(
        &self,
        template: &FhirValueType,
        group: &ObservationGroup,
        existing_period: Option<Boundary>,
        existing: Option<ElementValue>,
    ) -> Result<Option<ElementValue>, ObservationError> {
        let values = group.values_of(template.value_name());

        match existing {
            Some(existing) if !values.is_empty() || template.kind() == FhirValueKind::SampledData => {
                let data = ObservationData::merging(group.boundary(), existing_period, &values);
                self.encoders.merge_value(template, &data, existing).map(Some)
            }
            Some(existing) => Ok(Some(existing)),
            None if values.is_empty() => Ok(None),
            None => {
                let data = ObservationData::merging(group.boundary(), existing_period, &values);
                self.encoders.create_value(template, &data).map(Some)
            }
        }
    }
}

impl FhirTemplateProcessor for CodeValueFhirTemplateProcessor {
    fn kind(&self) -> FhirTemplateKind {
        FhirTemplateKind::CodeValue
    }

    fn create_observation_groups(
        &self,
        template: &FhirTemplate,
        group: &MeasurementGroup,
    ) -> Result<Vec<ObservationGroup>, ObservationError> {
        let template = self.template(template);
        Ok(create_observation_groups(group, template.period_interval))
    }

    fn create_observation(&self, template: &FhirTemplate, group: &ObservationGroup) -> Result<Observation, ObservationError> {
        let template = self.template(template);

        let mut observation = Observation::new(connector_code(&template.codes, &template.type_name));
        observation.status = ObservationStatus::Final;
        observation.issued = Some(Utc::now());
        observation.category = template.category.iter().map(category_concept).collect();
        observation.set_effective(group.boundary());

        if let Some(value) = &template.value {
            observation.set_value(self.encode_value(value, group, None, None)?);
        }

        for component in &template.components {
            if let Some(value) = self.encode_value(&component.value, group, None, None)? {
                let code = connector_code(&component.codes, component.value.value_name());
                observation.component.push(ObservationComponent::new(code, value));
            }
        }

        Ok(observation)
    }

    fn merge_observation(
        &self,
        template: &FhirTemplate,
        group: &ObservationGroup,
        existing: &Observation,
    ) -> Result<Observation, ObservationError> {
        let template = self.template(template);
        let existing_period = existing.effective_boundary();
        let mut merged = existing.clone();

        if let Some(value) = &template.value {
            let encoded = self.encode_value(value, group, existing_period, existing.value())?;
            merged.set_value(encoded);
        }

        for component_template in &template.components {
            let value_name = component_template.value.value_name();
            let position = merged
                .component
                .iter()
                .position(|c| c.code.has_coding(CONNECTOR_CODING_SYSTEM, value_name));

            match position {
                Some(index) => {
                    let current = merged.component[index].value();
                    let encoded = self.encode_value(&component_template.value, group, existing_period, current)?;
                    merged.component[index].set_value(encoded);
                }
                None => {
                    if let Some(value) = self.encode_value(&component_template.value, group, existing_period, None)? {
                        let code = connector_code(&component_template.codes, value_name);
                        merged.component.push(ObservationComponent::new(code, value));
                    }
                }
            }
        }

        let period = existing_period
            .map(|existing| existing.union(&group.boundary()))
            .unwrap_or_else(|| group.boundary());
        merged.set_effective(period);

        if merged != *existing {
            merged.status = ObservationStatus::Amended;
            merged.issued = Some(Utc::now());
        }

        Ok(merged)
    }
}

impl fmt::Debug for CodeValueFhirTemplateProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeValueFhirTemplateProcessor")
            .field("encoders", &self.encoders)
            .finish()
    }
}

/// Template codes plus the connector coding carrying `implicit_code`.
fn connector_code(codes: &[FhirCode], implicit_code: &str) -> CodeableConcept {
    let mut coding: Vec<Coding> = codes.iter().map(Coding::from).collect();
    coding.push(Coding {
        system: Some(CONNECTOR_CODING_SYSTEM.to_string()),
        code: Some(implicit_code.to_string()),
        display: Some(implicit_code.to_string()),
    });
    CodeableConcept {
        coding,
        text: Some(implicit_code.to_string()),
    }
}

fn category_concept(category: &crate::template::FhirCategory) -> CodeableConcept {
    CodeableConcept {
        coding: category.codes.iter().map(Coding::from).collect(),
        text: category.text.clone(),
    }
}

/// Dispatch table from template kind to its processor.
pub struct ObservationProcessor {
    processors: HashMap<FhirTemplateKind, Box<dyn FhirTemplateProcessor>>,
}

impl ObservationProcessor {
    pub fn new(encoders: Arc<FhirValueEncoderRegistry>) -> Self {
        let mut processor = ObservationProcessor {
            processors: HashMap::new(),
        };
        processor.register(CodeValueFhirTemplateProcessor::new(encoders));
        processor
    }

    pub fn register(&mut self, processor: impl FhirTemplateProcessor + 'static) {
        self.processors.insert(processor.kind(), Box::new(processor));
    }

    fn processor(&self, template: &FhirTemplate) -> Result<&dyn FhirTemplateProcessor, ObservationError> {
        self.processors
            .get(&template.kind())
            .map(|processor| &**processor)
            .ok_or(ObservationError::ProcessorNotFound(template.kind()))
    }

    pub fn create_observation_groups(
        &self,
        template: &FhirTemplate,
        group: &MeasurementGroup,
    ) -> Result<Vec<ObservationGroup>, ObservationError> {
        self.processor(template)?.create_observation_groups(template, group)
    }

    pub fn create_observation(&self, template: &FhirTemplate, group: &ObservationGroup) -> Result<Observation, ObservationError> {
        self.processor(template)?.create_observation(template, group)
    }

    pub fn merge_observation(
        &self,
        template: &FhirTemplate,
        group: &ObservationGroup,
        existing: &Observation,
    ) -> Result<Observation, ObservationError> {
        self.processor(template)?.merge_observation(template, group, existing)
    }
}

impl Default for ObservationProcessor {
    fn default() -> Self {
        Self::new(Arc::new(FhirValueEncoderRegistry::new()))
    }
}

impl fmt::Debug for ObservationProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationProcessor")
            .field("kinds", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}
