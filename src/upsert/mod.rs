//! Observation persistence
//!
//! Observations are written through a [`FhirStore`], keyed by a business
//! identifier derived from the window they cover. [`ObservationUpsertEngine`]
//! creates the Observation of a window the first time and merges later windows
//! with the same identifier into it.

mod cache;
mod engine;
mod identity;
mod store;

pub use cache::{ObservationCache, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use engine::{ObservationUpsertEngine, UpsertOutcome, DEFAULT_MAX_CONFLICT_RETRIES};
pub use identity::{
    observation_identifier, FhirResourceIdentityService, IdentityError, IdentityResolution, ResourceIdentity,
    ResourceIdentityService, OBSERVATION_IDENTIFIER_SYSTEM,
};
pub use store::{FhirStore, FhirStoreError, InMemoryFhirStore, STATUS_CONFLICT, STATUS_PRECONDITION_FAILED};

use crate::fhir::ObservationError;

#[derive(Debug, thiserror::Error)]
pub enum UpsertError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),

    #[error("{count} observations match identifier '{identifier}'")]
    MultipleResourcesFound { identifier: String, count: usize },

    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error("Observation could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UpsertError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, UpsertError::Store(err) if err.is_conflict())
    }
}
