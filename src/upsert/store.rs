//! FHIR store access
//!
//! The connector talks to a FHIR server through [`FhirStore`]. Writes are
//! conditional: creates carry an `If-None-Exist` identifier and updates an
//! `If-Match` version, so concurrent writers surface as 409/412 conflicts instead
//! of silently overwriting each other.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::fhir::Identifier;

pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_PRECONDITION_FAILED: u16 = 412;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FhirStoreError {
    #[error("Conflict ({status}): {message}")]
    Conflict { status: u16, message: String },

    #[error("{resource_type}/{id} not found")]
    NotFound { resource_type: String, id: String },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("FHIR store error: {0}")]
    Internal(String),
}

impl FhirStoreError {
    pub fn conflict(status: u16, message: impl Into<String>) -> Self {
        FhirStoreError::Conflict {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(resource_type: &str, id: &str) -> Self {
        FhirStoreError::NotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_resource(message: impl Into<String>) -> Self {
        FhirStoreError::InvalidResource(message.into())
    }

    /// Version conflict or failed precondition: another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            FhirStoreError::Conflict { status, .. }
                if *status == STATUS_CONFLICT || *status == STATUS_PRECONDITION_FAILED
        )
    }

    /// The HTTP status a FHIR server would answer with.
    pub fn status(&self) -> u16 {
        match self {
            FhirStoreError::Conflict { status, .. } => *status,
            FhirStoreError::NotFound { .. } => 404,
            FhirStoreError::InvalidResource(_) => 400,
            FhirStoreError::Internal(_) => 500,
        }
    }
}

/// FHIR server operations the connector needs, on JSON resources.
#[async_trait]
pub trait FhirStore: Send + Sync {
    /// Resources of `resource_type` carrying `identifier`.
    async fn search_by_identifier(
        &self,
        resource_type: &str,
        identifier: &Identifier,
    ) -> Result<Vec<Value>, FhirStoreError>;

    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Value>, FhirStoreError>;

    /// Creates the resource; with `if_none_exist`, fails with 412 when a resource
    /// with that identifier already exists.
    async fn create(&self, resource: &Value, if_none_exist: Option<&Identifier>) -> Result<Value, FhirStoreError>;

    /// Replaces the resource; with `if_match`, fails with 412 when the stored
    /// version differs and 409 when the resource was deleted.
    async fn update(&self, resource: &Value, if_match: Option<&str>) -> Result<Value, FhirStoreError>;
}

#[derive(Debug, Clone)]
struct StoredResource {
    resource: Value,
    version: u64,
    deleted: bool,
}

/// Versioned in-process FHIR store.
#[derive(Debug, Default)]
pub struct InMemoryFhirStore {
    resources: RwLock<HashMap<(String, String), StoredResource>>,
    next_id: AtomicU64,
}

impl InMemoryFhirStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a resource deleted; later reads and searches no longer see it.
    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<(), FhirStoreError> {
        let mut resources = self.resources.write().await;
        let stored = resources
            .get_mut(&(resource_type.to_string(), id.to_string()))
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| FhirStoreError::not_found(resource_type, id))?;

        stored.deleted = true;
        stored.version += 1;
        Ok(())
    }

    /// Number of live resources of one type.
    pub async fn count(&self, resource_type: &str) -> usize {
        self.resources
            .read()
            .await
            .iter()
            .filter(|((stored_type, _), stored)| stored_type == resource_type && !stored.deleted)
            .count()
    }

    fn allocate_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl FhirStore for InMemoryFhirStore {
    async fn search_by_identifier(
        &self,
        resource_type: &str,
        identifier: &Identifier,
    ) -> Result<Vec<Value>, FhirStoreError> {
        let resources = self.resources.read().await;
        Ok(find_by_identifier(&resources, resource_type, identifier)
            .into_iter()
            .map(|stored| stored.resource.clone())
            .collect())
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Value>, FhirStoreError> {
        let resources = self.resources.read().await;
        Ok(resources
            .get(&(resource_type.to_string(), id.to_string()))
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.resource.clone()))
    }

    async fn create(&self, resource: &Value, if_none_exist: Option<&Identifier>) -> Result<Value, FhirStoreError> {
        let resource_type = resource_type_of(resource)?;
        let mut resources = self.resources.write().await;

        if let Some(identifier) = if_none_exist {
            if !find_by_identifier(&resources, &resource_type, identifier).is_empty() {
                return Err(FhirStoreError::conflict(
                    STATUS_PRECONDITION_FAILED,
                    format!("{} with identifier '{}' already exists", resource_type, identifier.to_token()),
                ));
            }
        }

        let id = self.allocate_id();
        let stored = stamp(resource.clone(), &id, 1)?;
        debug!(%resource_type, %id, "Created resource");
        resources.insert(
            (resource_type, id),
            StoredResource {
                resource: stored.clone(),
                version: 1,
                deleted: false,
            },
        );
        Ok(stored)
    }

    async fn update(&self, resource: &Value, if_match: Option<&str>) -> Result<Value, FhirStoreError> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FhirStoreError::invalid_resource("update requires a resource id"))?
            .to_string();
        let expected = if_match.map(parse_version).transpose()?;

        let mut resources = self.resources.write().await;
        let key = (resource_type.clone(), id.clone());

        let version = match (resources.get(&key), expected) {
            (None, Some(_)) => {
                return Err(FhirStoreError::conflict(
                    STATUS_PRECONDITION_FAILED,
                    format!("{}/{} does not exist", resource_type, id),
                ))
            }
            (None, None) => 1,
            (Some(stored), Some(_)) if stored.deleted => {
                return Err(FhirStoreError::conflict(
                    STATUS_CONFLICT,
                    format!("{}/{} was deleted", resource_type, id),
                ))
            }
            (Some(stored), Some(expected)) if stored.version != expected => {
                return Err(FhirStoreError::conflict(
                    STATUS_PRECONDITION_FAILED,
                    format!(
                        "{}/{} is at version {}, not {}",
                        resource_type, id, stored.version, expected
                    ),
                ))
            }
            (Some(stored), _) => stored.version + 1,
        };

        let stored = stamp(resource.clone(), &id, version)?;
        debug!(%resource_type, %id, version, "Updated resource");
        resources.insert(
            key,
            StoredResource {
                resource: stored.clone(),
                version,
                deleted: false,
            },
        );
        Ok(stored)
    }
}

fn find_by_identifier<'a>(
    resources: &'a HashMap<(String, String), StoredResource>,
    resource_type: &str,
    identifier: &Identifier,
) -> Vec<&'a StoredResource> {
    let mut matches: Vec<(&'a String, &'a StoredResource)> = resources
        .iter()
        .filter(|((stored_type, _), stored)| {
            stored_type == resource_type && !stored.deleted && has_identifier(&stored.resource, identifier)
        })
        .map(|((_, id), stored)| (id, stored))
        .collect();
    matches.sort_by(|(a, _), (b, _)| a.cmp(b));
    matches.into_iter().map(|(_, stored)| stored).collect()
}

fn has_identifier(resource: &Value, identifier: &Identifier) -> bool {
    resource
        .get("identifier")
        .and_then(Value::as_array)
        .map(|candidates| {
            candidates.iter().any(|candidate| {
                serde_json::from_value::<Identifier>(candidate.clone())
                    .map(|candidate| identifier.matches(&candidate))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn resource_type_of(resource: &Value) -> Result<String, FhirStoreError> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FhirStoreError::invalid_resource("resourceType is missing"))
}

/// Accepts `3`, `"3"` and `W/"3"`.
fn parse_version(raw: &str) -> Result<u64, FhirStoreError> {
    let trimmed = raw.trim();
    let unquoted = trimmed.strip_prefix("W/").unwrap_or(trimmed).trim_matches('"');
    unquoted
        .parse()
        .map_err(|_| FhirStoreError::invalid_resource(format!("'{}' is not a resource version", raw)))
}

fn stamp(mut resource: Value, id: &str, version: u64) -> Result<Value, FhirStoreError> {
    let object = resource
        .as_object_mut()
        .ok_or_else(|| FhirStoreError::invalid_resource("resource must be a JSON object"))?;
    object.insert("id".to_string(), Value::String(id.to_string()));
    object.insert(
        "meta".to_string(),
        json!({
            "versionId": version.to_string(),
            "lastUpdated": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    );
    Ok(resource)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    /// Holds the first two searches until both have run, so both writers miss.
    pub(crate) struct RacingStore {
        inner: InMemoryFhirStore,
        barrier: Barrier,
        searches: AtomicUsize,
    }

    impl RacingStore {
        pub(crate) fn new() -> Self {
            RacingStore {
                inner: InMemoryFhirStore::new(),
                barrier: Barrier::new(2),
                searches: AtomicUsize::new(0),
            }
        }

        pub(crate) async fn count(&self, resource_type: &str) -> usize {
            self.inner.count(resource_type).await
        }
    }

    #[async_trait]
    impl FhirStore for RacingStore {
        async fn search_by_identifier(&self, resource_type: &str, identifier: &Identifier) -> Result<Vec<Value>, FhirStoreError> {
            let found = self.inner.search_by_identifier(resource_type, identifier).await;
            if self.searches.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            found
        }

        async fn read(&self, resource_type: &str, id: &str) -> Result<Option<Value>, FhirStoreError> {
            self.inner.read(resource_type, id).await
        }

        async fn create(&self, resource: &Value, if_none_exist: Option<&Identifier>) -> Result<Value, FhirStoreError> {
            self.inner.create(resource, if_none_exist).await
        }

        async fn update(&self, resource: &Value, if_match: Option<&str>) -> Result<Value, FhirStoreError> {
            self.inner.update(resource, if_match).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(identifier: &Identifier) -> Value {
        json!({
            "resourceType": "Observation",
            "status": "final",
            "code": {"text": "heartrate"},
            "identifier": [identifier]
        })
    }

    fn create_test_identifier() -> Identifier {
        Identifier::new("https://emberlink.dev/fhir/observation", "abc.p1.heartrate.x")
    }

    #[tokio::test]
    async fn test_create_read_and_search() {
        let store = InMemoryFhirStore::new();
        let identifier = create_test_identifier();

        let created = store.create(&observation(&identifier), None).await.unwrap();
        let id = created["id"].as_str().unwrap();
        assert_eq!(created["meta"]["versionId"], "1");

        let read = store.read("Observation", id).await.unwrap().unwrap();
        assert_eq!(read, created);

        let found = store.search_by_identifier("Observation", &identifier).await.unwrap();
        assert_eq!(found, vec![created.clone()]);

        let by_value = Identifier::value_only("abc.p1.heartrate.x");
        assert_eq!(store.search_by_identifier("Observation", &by_value).await.unwrap().len(), 1);
        assert!(store.search_by_identifier("Device", &identifier).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_if_none_exist_rejects_second_create() {
        let store = InMemoryFhirStore::new();
        let identifier = create_test_identifier();

        store.create(&observation(&identifier), Some(&identifier)).await.unwrap();
        let err = store
            .create(&observation(&identifier), Some(&identifier))
            .await
            .unwrap_err();

        assert_eq!(err.status(), STATUS_PRECONDITION_FAILED);
        assert!(err.is_conflict());
        assert_eq!(store.count("Observation").await, 1);
    }

    #[tokio::test]
    async fn test_if_match_detects_stale_version() {
        let store = InMemoryFhirStore::new();
        let created = store.create(&observation(&create_test_identifier()), None).await.unwrap();

        let updated = store.update(&created, Some("1")).await.unwrap();
        assert_eq!(updated["meta"]["versionId"], "2");

        let err = store.update(&created, Some("W/\"1\"")).await.unwrap_err();
        assert_eq!(err.status(), STATUS_PRECONDITION_FAILED);

        assert!(store.update(&created, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_of_deleted_resource_conflicts() {
        let store = InMemoryFhirStore::new();
        let identifier = create_test_identifier();
        let created = store.create(&observation(&identifier), None).await.unwrap();
        let id = created["id"].as_str().unwrap();

        store.delete("Observation", id).await.unwrap();
        assert_eq!(store.read("Observation", id).await.unwrap(), None);
        assert!(store.search_by_identifier("Observation", &identifier).await.unwrap().is_empty());

        let err = store.update(&created, Some("1")).await.unwrap_err();
        assert_eq!(err.status(), STATUS_CONFLICT);
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_invalid_resources_are_rejected() {
        let store = InMemoryFhirStore::new();

        let err = store.create(&json!({"status": "final"}), None).await.unwrap_err();
        assert!(matches!(err, FhirStoreError::InvalidResource(_)));
        assert!(!err.is_conflict());

        let err = store
            .update(&json!({"resourceType": "Observation"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
