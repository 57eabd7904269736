//! Import pipeline
//!
//! Wires normalization and FHIR conversion together: a raw device event goes
//! through the content templates, the resulting measurements are grouped by
//! identity, and every group is windowed by its FHIR template and upserted.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fhir::{ObservationError, ObservationProcessor};
use crate::measurement::{Measurement, MeasurementGroup, MeasurementGroupKey};
use crate::template::{ContentTemplate, FhirTemplate, MeasurementError, TemplateCollection, TemplateError};
use crate::upsert::{IdentityError, ObservationUpsertEngine, ResourceIdentityService, UpsertError, UpsertOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Upsert(#[from] UpsertError),
}

/// Result of importing one measurement group.
#[derive(Debug)]
pub struct GroupReport {
    pub key: MeasurementGroupKey,
    pub result: Result<Vec<UpsertOutcome>, ImportError>,
}

/// Result of importing one device event.
#[derive(Debug, Default)]
pub struct EventReport {
    /// Samples of the event that could not be normalized
    pub measurement_errors: Vec<MeasurementError>,
    pub groups: Vec<GroupReport>,
}

impl EventReport {
    pub fn is_success(&self) -> bool {
        self.measurement_errors.is_empty() && self.groups.iter().all(|group| group.result.is_ok())
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &UpsertOutcome> {
        self.groups
            .iter()
            .filter_map(|group| group.result.as_ref().ok())
            .flatten()
    }
}

pub struct FhirImportService {
    content: Arc<dyn ContentTemplate>,
    fhir_templates: Arc<TemplateCollection<FhirTemplate>>,
    processor: Arc<ObservationProcessor>,
    identities: Arc<dyn ResourceIdentityService>,
    upserts: Arc<ObservationUpsertEngine>,
}

impl FhirImportService {
    pub fn new(
        content: Arc<dyn ContentTemplate>,
        fhir_templates: Arc<TemplateCollection<FhirTemplate>>,
        processor: Arc<ObservationProcessor>,
        identities: Arc<dyn ResourceIdentityService>,
        upserts: Arc<ObservationUpsertEngine>,
    ) -> Self {
        FhirImportService {
            content,
            fhir_templates,
            processor,
            identities,
            upserts,
        }
    }

    /// Normalizes one event and imports every measurement group it yields.
    ///
    /// A failing sample or group is reported and does not stop the others.
    pub async fn process_event(&self, event: &Value) -> EventReport {
        let mut report = EventReport::default();
        let mut measurements: Vec<Measurement> = Vec::new();

        for result in self.content.get_measurements(event) {
            match result {
                Ok(measurement) => measurements.push(measurement),
                Err(err) => {
                    warn!(template = err.type_name(), error = %err, "Measurement could not be extracted");
                    report.measurement_errors.push(err);
                }
            }
        }
        debug!(count = measurements.len(), "Measurements extracted");

        for group in MeasurementGroup::group(measurements) {
            let result = self.process_group(&group).await;
            if let Err(err) = &result {
                warn!(
                    measure_type = group.measure_type(),
                    device = group.device_id(),
                    error = %err,
                    "Measurement group could not be imported"
                );
            }
            report.groups.push(GroupReport {
                key: group.key().clone(),
                result,
            });
        }

        report
    }

    /// Windows one measurement group and upserts each window's Observation.
    pub async fn process_group(&self, group: &MeasurementGroup) -> Result<Vec<UpsertOutcome>, ImportError> {
        let template = self
            .fhir_templates
            .get(group.measure_type())
            .ok_or_else(|| TemplateError::TemplateNotFound(group.measure_type().to_string()))?;

        let windows = self.processor.create_observation_groups(template, group)?;
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let identity = self.identities.resolve(group.key()).await?;

        let mut outcomes = Vec::with_capacity(windows.len());
        for window in &windows {
            outcomes.push(self.upserts.upsert(template, window, &identity).await?);
        }
        Ok(outcomes)
    }
}

impl std::fmt::Debug for FhirImportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirImportService")
            .field("content", &self.content)
            .field("fhir_templates", &self.fhir_templates.len())
            .field("upserts", &self.upserts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::DefaultExpressionEvaluatorFactory;
    use crate::template::{content_template_factory, fhir_template_factory, CollectionContentTemplate};
    use crate::upsert::{
        FhirResourceIdentityService, FhirStore, IdentityResolution, InMemoryFhirStore, ObservationCache,
    };
    use serde_json::json;

    fn create_test_service(store: Arc<InMemoryFhirStore>) -> FhirImportService {
        let content = content_template_factory(Arc::new(DefaultExpressionEvaluatorFactory::new()))
            .load_value(&json!({
                "templateType": "CollectionContent",
                "template": [{
                    "templateType": "JsonPathContent",
                    "template": {
                        "typeName": "heartrate",
                        "typeMatchExpression": "$..[?(@.heartrate)]",
                        "deviceIdExpression": "$.device",
                        "patientIdExpression": "$.patient",
                        "timestampExpression": "$.time",
                        "values": [{"valueName": "hr", "valueExpression": "$.heartrate", "required": true}]
                    }
                }, {
                    "templateType": "JsonPathContent",
                    "template": {
                        "typeName": "steps",
                        "typeMatchExpression": "$..[?(@.steps)]",
                        "deviceIdExpression": "$.device",
                        "patientIdExpression": "$.patient",
                        "timestampExpression": "$.time",
                        "values": [{"valueName": "count", "valueExpression": "$.steps", "required": true}]
                    }
                }]
            }))
            .unwrap();
        let fhir_templates = fhir_template_factory()
            .load_value(&json!({
                "templateType": "CodeValueFhir",
                "template": {
                    "typeName": "heartrate",
                    "codes": [{"code": "8867-4", "system": "http://loinc.org"}],
                    "value": {"valueName": "hr", "valueType": "Quantity", "unit": "bpm"}
                }
            }))
            .unwrap();

        let processor = Arc::new(ObservationProcessor::default());
        let fhir_store: Arc<dyn FhirStore> = store;
        FhirImportService::new(
            Arc::new(CollectionContentTemplate::new(content)),
            Arc::new(fhir_templates),
            processor.clone(),
            Arc::new(FhirResourceIdentityService::new(fhir_store.clone(), IdentityResolution::Create)),
            Arc::new(ObservationUpsertEngine::new(fhir_store, processor, ObservationCache::default())),
        )
    }

    #[tokio::test]
    async fn test_process_event_imports_each_sample() {
        let store = Arc::new(InMemoryFhirStore::new());
        let service = create_test_service(store.clone());

        let event = json!({"readings": [
            {"device": "abc", "patient": "p1", "time": "2024-03-01T10:00:00Z", "heartrate": 60},
            {"device": "abc", "patient": "p1", "time": "2024-03-01T10:01:00Z", "heartrate": 61}
        ]});
        let report = service.process_event(&event).await;

        assert!(report.is_success());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.outcomes().count(), 2);
        assert_eq!(store.count("Observation").await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_sample_merges_without_change() {
        let store = Arc::new(InMemoryFhirStore::new());
        let service = create_test_service(store.clone());

        let reading = json!({"device": "abc", "patient": "p1", "time": "2024-03-01T10:00:00Z", "heartrate": 60});
        let report = service.process_event(&json!({"readings": [reading.clone(), reading]})).await;

        assert!(report.is_success(), "{:?}", report);
        let outcomes: Vec<&str> = report.outcomes().map(UpsertOutcome::as_str).collect();
        assert_eq!(outcomes, vec!["created", "no-change"]);
        assert_eq!(store.count("Observation").await, 1);
    }

    #[tokio::test]
    async fn test_missing_fhir_template_fails_only_its_group() {
        let store = Arc::new(InMemoryFhirStore::new());
        let service = create_test_service(store.clone());

        let event = json!({"readings": [
            {"device": "abc", "patient": "p1", "time": "2024-03-01T10:00:00Z", "heartrate": 60},
            {"device": "abc", "patient": "p1", "time": "2024-03-01T10:00:00Z", "steps": 12},
            {"device": "abc", "patient": "p1", "time": "not a time", "heartrate": 61}
        ]});
        let report = service.process_event(&event).await;

        assert!(!report.is_success());
        assert_eq!(report.measurement_errors.len(), 1);

        let steps = report
            .groups
            .iter()
            .find(|group| group.key.measure_type == "steps")
            .unwrap();
        assert!(matches!(
            steps.result,
            Err(ImportError::Template(TemplateError::TemplateNotFound(ref name))) if name == "steps"
        ));
        assert_eq!(report.outcomes().count(), 1);
        assert_eq!(store.count("Observation").await, 1);
    }
}
