//! Observation identity and resource identity resolution
//!
//! Every Observation the connector writes carries one business identifier derived
//! from the resolved Device and Patient and from the window it covers. Resolution
//! maps the device and patient ids found in telemetry to FHIR resource ids.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::store::{FhirStore, FhirStoreError};
use crate::fhir::{Device, Identifier, Patient, Reference};
use crate::measurement::MeasurementGroupKey;
use crate::observation::{escape_identity_part, ObservationGroup};

pub const OBSERVATION_IDENTIFIER_SYSTEM: &str = "https://emberlink.dev/fhir/observation";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Device with identifier '{0}' not found")]
    DeviceNotFound(String),

    #[error("No patient found for device '{0}'")]
    PatientNotFound(String),

    #[error("Device '{device_id}' is not linked to patient '{patient_id}'")]
    PatientDeviceMismatch { device_id: String, patient_id: String },

    #[error("{count} {resource_type} resources match identifier '{identifier}'")]
    MultipleResourcesFound {
        resource_type: String,
        identifier: String,
        count: usize,
    },

    #[error("Invalid {resource_type} resource: {source}")]
    InvalidResource {
        resource_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] FhirStoreError),
}

/// FHIR ids of the resources an Observation refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    pub device_id: String,
    pub patient_id: String,
    pub encounter_id: Option<String>,
}

impl ResourceIdentity {
    pub fn new(device_id: impl Into<String>, patient_id: impl Into<String>) -> Self {
        ResourceIdentity {
            device_id: device_id.into(),
            patient_id: patient_id.into(),
            encounter_id: None,
        }
    }

    pub fn with_encounter(mut self, encounter_id: Option<String>) -> Self {
        self.encounter_id = encounter_id;
        self
    }
}

/// Identifier of the Observation covering `group`.
///
/// The value is `{device}.{patient}.{type}.{segment}`; dots and percent signs
/// inside the parts are percent-escaped.
pub fn observation_identifier(group: &ObservationGroup, identity: &ResourceIdentity) -> Identifier {
    Identifier::new(
        OBSERVATION_IDENTIFIER_SYSTEM,
        format!(
            "{}.{}.{}.{}",
            escape_identity_part(&identity.device_id),
            escape_identity_part(&identity.patient_id),
            escape_identity_part(group.name()),
            group.identity_segment()
        ),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityResolution {
    /// Devices must exist and be linked to their patient.
    #[default]
    Lookup,
    /// Missing patients and devices are created and linked.
    Create,
}

#[async_trait]
pub trait ResourceIdentityService: Send + Sync {
    async fn resolve(&self, key: &MeasurementGroupKey) -> Result<ResourceIdentity, IdentityError>;
}

/// Resolves identities against a [`FhirStore`].
pub struct FhirResourceIdentityService {
    store: Arc<dyn FhirStore>,
    mode: IdentityResolution,
    device_system: Option<String>,
}

impl FhirResourceIdentityService {
    pub fn new(store: Arc<dyn FhirStore>, mode: IdentityResolution) -> Self {
        FhirResourceIdentityService {
            store,
            mode,
            device_system: None,
        }
    }

    /// Qualifies device identifiers with `system`.
    pub fn with_device_system(mut self, system: Option<String>) -> Self {
        self.device_system = system;
        self
    }

    fn device_identifier(&self, device_id: &str) -> Identifier {
        match &self.device_system {
            Some(system) => Identifier::new(system.as_str(), device_id),
            None => Identifier::value_only(device_id),
        }
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>, IdentityError> {
        find_single(self.store.as_ref(), "Device", &self.device_identifier(device_id)).await
    }

    async fn lookup(&self, key: &MeasurementGroupKey) -> Result<ResourceIdentity, IdentityError> {
        let device = self
            .find_device(&key.device_id)
            .await?
            .ok_or_else(|| IdentityError::DeviceNotFound(key.device_id.clone()))?;
        let device_id = resource_id(&device.id, "Device")?;

        let patient_id = device
            .patient
            .as_ref()
            .and_then(|patient| patient.id_of("Patient"))
            .map(str::to_string)
            .ok_or_else(|| IdentityError::PatientNotFound(key.device_id.clone()))?;

        if let Some(expected) = &key.patient_id {
            let patient = self
                .store
                .read("Patient", &patient_id)
                .await?
                .ok_or_else(|| IdentityError::PatientNotFound(key.device_id.clone()))?;
            let patient: Patient = parse_resource(patient, "Patient")?;
            let wanted = Identifier::value_only(expected.as_str());
            if !patient.identifier.iter().any(|identifier| wanted.matches(identifier)) {
                return Err(IdentityError::PatientDeviceMismatch {
                    device_id: key.device_id.clone(),
                    patient_id: expected.clone(),
                });
            }
        }

        Ok(ResourceIdentity::new(device_id, patient_id).with_encounter(key.encounter_id.clone()))
    }

    /// Finds the resource by identifier, creating it when absent.
    ///
    /// Creation is conditional on the identifier, so a writer that loses a race
    /// for the same resource reads back the winner's. The flag tells whether this
    /// call created the resource.
    async fn find_or_create<T: serde::de::DeserializeOwned>(
        &self,
        resource_type: &str,
        identifier: &Identifier,
        resource: serde_json::Value,
    ) -> Result<(T, bool), IdentityError> {
        if let Some(found) = find_single(self.store.as_ref(), resource_type, identifier).await? {
            return Ok((found, false));
        }

        match self.store.create(&resource, Some(identifier)).await {
            Ok(created) => Ok((parse_resource(created, resource_type)?, true)),
            Err(err) if err.is_conflict() => {
                debug!(resource_type, identifier = %identifier.to_token(), "Resource created concurrently, reading it back");
                match find_single(self.store.as_ref(), resource_type, identifier).await? {
                    Some(found) => Ok((found, false)),
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self, key: &MeasurementGroupKey) -> Result<ResourceIdentity, IdentityError> {
        let patient_key = key
            .patient_id
            .as_deref()
            .ok_or_else(|| IdentityError::PatientNotFound(key.device_id.clone()))?;

        let patient_identifier = Identifier::value_only(patient_key);
        let new_patient = to_resource(&Patient::new(patient_identifier.clone()), "Patient")?;
        let (patient, created): (Patient, bool) = self.find_or_create("Patient", &patient_identifier, new_patient).await?;
        if created {
            info!(patient = patient_key, "Created patient");
        }
        let patient_id = resource_id(&patient.id, "Patient")?;

        let device_identifier = self.device_identifier(&key.device_id);
        let mut new_device = Device::new(device_identifier.clone());
        new_device.patient = Some(Reference::to("Patient", &patient_id));
        let new_device = to_resource(&new_device, "Device")?;
        let (mut device, created): (Device, bool) = self.find_or_create("Device", &device_identifier, new_device).await?;
        if created {
            info!(device = %key.device_id, "Created device");
        }

        let linked = device
            .patient
            .as_ref()
            .and_then(|patient| patient.id_of("Patient"))
            .map(str::to_string);
        match linked {
            Some(linked) if linked != patient_id => {
                return Err(IdentityError::PatientDeviceMismatch {
                    device_id: key.device_id.clone(),
                    patient_id: patient_key.to_string(),
                })
            }
            Some(_) => {}
            None => {
                device.patient = Some(Reference::to("Patient", &patient_id));
                let version = device
                    .extra
                    .get("meta")
                    .and_then(|meta| meta.get("versionId"))
                    .and_then(|version| version.as_str())
                    .map(str::to_string);
                self.store
                    .update(&to_resource(&device, "Device")?, version.as_deref())
                    .await?;
                debug!(device = %key.device_id, "Linked device to patient");
            }
        }
        let device_id = resource_id(&device.id, "Device")?;

        Ok(ResourceIdentity::new(device_id, patient_id).with_encounter(key.encounter_id.clone()))
    }
}

#[async_trait]
impl ResourceIdentityService for FhirResourceIdentityService {
    async fn resolve(&self, key: &MeasurementGroupKey) -> Result<ResourceIdentity, IdentityError> {
        match self.mode {
            IdentityResolution::Lookup => self.lookup(key).await,
            IdentityResolution::Create => self.create(key).await,
        }
    }
}

impl std::fmt::Debug for FhirResourceIdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirResourceIdentityService")
            .field("mode", &self.mode)
            .field("device_system", &self.device_system)
            .finish()
    }
}

async fn find_single<T: serde::de::DeserializeOwned>(
    store: &dyn FhirStore,
    resource_type: &str,
    identifier: &Identifier,
) -> Result<Option<T>, IdentityError> {
    let mut found = store.search_by_identifier(resource_type, identifier).await?;
    match found.len() {
        0 => Ok(None),
        1 => parse_resource(found.remove(0), resource_type).map(Some),
        count => Err(IdentityError::MultipleResourcesFound {
            resource_type: resource_type.to_string(),
            identifier: identifier.to_token(),
            count,
        }),
    }
}

fn parse_resource<T: serde::de::DeserializeOwned>(resource: serde_json::Value, resource_type: &str) -> Result<T, IdentityError> {
    serde_json::from_value(resource).map_err(|source| IdentityError::InvalidResource {
        resource_type: resource_type.to_string(),
        source,
    })
}

fn to_resource<T: Serialize>(resource: &T, resource_type: &str) -> Result<serde_json::Value, IdentityError> {
    serde_json::to_value(resource).map_err(|source| IdentityError::InvalidResource {
        resource_type: resource_type.to_string(),
        source,
    })
}

fn resource_id(id: &Option<String>, resource_type: &str) -> Result<String, IdentityError> {
    id.clone().ok_or_else(|| {
        IdentityError::Store(FhirStoreError::invalid_resource(format!(
            "{} returned by the store has no id",
            resource_type
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use crate::observation::Boundary;
    use crate::upsert::store::testing::RacingStore;
    use crate::upsert::InMemoryFhirStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn create_test_key(patient_id: Option<&str>) -> MeasurementGroupKey {
        MeasurementGroupKey {
            measure_type: "heartrate".to_string(),
            device_id: "abc".to_string(),
            patient_id: patient_id.map(str::to_string),
            encounter_id: Some("enc-1".to_string()),
            correlation_id: None,
        }
    }

    async fn seed_linked_device(store: &InMemoryFhirStore) -> (String, String) {
        let patient = store
            .create(&json!({"resourceType": "Patient", "identifier": [{"value": "p1"}]}), None)
            .await
            .unwrap();
        let patient_id = patient["id"].as_str().unwrap().to_string();
        let device = store
            .create(
                &json!({
                    "resourceType": "Device",
                    "identifier": [{"value": "abc"}],
                    "patient": {"reference": format!("Patient/{}", patient_id)}
                }),
                None,
            )
            .await
            .unwrap();
        (device["id"].as_str().unwrap().to_string(), patient_id)
    }

    #[test]
    fn test_observation_identifier_format() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let key = Measurement::new("heartrate", "abc", time).group_key();
        let group = ObservationGroup::new(&key, Boundary::instant(time));

        let identifier = observation_identifier(&group, &ResourceIdentity::new("d1", "p1"));
        assert_eq!(identifier.system.as_deref(), Some(OBSERVATION_IDENTIFIER_SYSTEM));
        assert_eq!(
            identifier.value.as_deref(),
            Some("d1.p1.heartrate.20240301100000000Z.20240301100000000Z")
        );
    }

    #[test]
    fn test_observation_identifier_escapes_separators() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let key = Measurement::new("heartrate", "abc", time).group_key();
        let group = ObservationGroup::new(&key, Boundary::instant(time));

        let left = observation_identifier(&group, &ResourceIdentity::new("a.b", "c"));
        let right = observation_identifier(&group, &ResourceIdentity::new("a", "b.c"));
        assert_ne!(left, right);
        assert!(left.value.as_deref().unwrap().starts_with("a%2Eb.c.heartrate."));
        assert!(observation_identifier(&group, &ResourceIdentity::new("50%", "p"))
            .value
            .as_deref()
            .unwrap()
            .starts_with("50%25.p."));
    }

    #[tokio::test]
    async fn test_lookup_uses_device_patient() {
        let store = Arc::new(InMemoryFhirStore::new());
        let (device_id, patient_id) = seed_linked_device(&store).await;
        let service = FhirResourceIdentityService::new(store, IdentityResolution::Lookup);

        let identity = service.resolve(&create_test_key(None)).await.unwrap();
        assert_eq!(identity.device_id, device_id);
        assert_eq!(identity.patient_id, patient_id);
        assert_eq!(identity.encounter_id.as_deref(), Some("enc-1"));

        assert!(service.resolve(&create_test_key(Some("p1"))).await.is_ok());
        assert!(matches!(
            service.resolve(&create_test_key(Some("p2"))).await,
            Err(IdentityError::PatientDeviceMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookup_requires_device_and_patient() {
        let store = Arc::new(InMemoryFhirStore::new());
        let service = FhirResourceIdentityService::new(store.clone(), IdentityResolution::Lookup);
        assert!(matches!(
            service.resolve(&create_test_key(None)).await,
            Err(IdentityError::DeviceNotFound(device)) if device == "abc"
        ));

        store
            .create(&json!({"resourceType": "Device", "identifier": [{"value": "abc"}]}), None)
            .await
            .unwrap();
        assert!(matches!(
            service.resolve(&create_test_key(None)).await,
            Err(IdentityError::PatientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_with_device_system() {
        let store = Arc::new(InMemoryFhirStore::new());
        seed_linked_device(&store).await;

        let service = FhirResourceIdentityService::new(store, IdentityResolution::Lookup)
            .with_device_system(Some("urn:devices".to_string()));
        assert!(matches!(
            service.resolve(&create_test_key(None)).await,
            Err(IdentityError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_mode_creates_and_reuses_resources() {
        let store = Arc::new(InMemoryFhirStore::new());
        let service = FhirResourceIdentityService::new(store.clone(), IdentityResolution::Create);

        let first = service.resolve(&create_test_key(Some("p1"))).await.unwrap();
        let second = service.resolve(&create_test_key(Some("p1"))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count("Patient").await, 1);
        assert_eq!(store.count("Device").await, 1);

        let device = store.read("Device", &first.device_id).await.unwrap().unwrap();
        assert_eq!(device["patient"]["reference"], format!("Patient/{}", first.patient_id));

        assert!(matches!(
            service.resolve(&create_test_key(Some("p2"))).await,
            Err(IdentityError::PatientDeviceMismatch { .. })
        ));
        assert!(matches!(
            service.resolve(&create_test_key(None)).await,
            Err(IdentityError::PatientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_mode_links_unlinked_device() {
        let store = Arc::new(InMemoryFhirStore::new());
        store
            .create(&json!({"resourceType": "Device", "identifier": [{"value": "abc"}]}), None)
            .await
            .unwrap();
        let service = FhirResourceIdentityService::new(store.clone(), IdentityResolution::Create);

        let identity = service.resolve(&create_test_key(Some("p1"))).await.unwrap();
        let device = store.read("Device", &identity.device_id).await.unwrap().unwrap();
        assert_eq!(device["patient"]["reference"], format!("Patient/{}", identity.patient_id));
        assert_eq!(device["meta"]["versionId"], "2");
    }

    #[tokio::test]
    async fn test_concurrent_create_mode_converges_on_one_patient_and_device() {
        let store = Arc::new(RacingStore::new());
        let service = FhirResourceIdentityService::new(store.clone(), IdentityResolution::Create);
        let key = create_test_key(Some("p1"));

        let (first, second) = tokio::join!(service.resolve(&key), service.resolve(&key));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first, second);
        assert_eq!(store.count("Patient").await, 1);
        assert_eq!(store.count("Device").await, 1);
        assert!(service.resolve(&key).await.is_ok());
    }
}
