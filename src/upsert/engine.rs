use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::ObservationCache;
use super::identity::{observation_identifier, ResourceIdentity};
use super::store::FhirStore;
use super::UpsertError;
use crate::fhir::{Identifier, Observation, ObservationProcessor, Reference};
use crate::observation::ObservationGroup;
use crate::template::FhirTemplate;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 2;

/// What an upsert did, with the Observation as persisted afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Observation),
    Updated(Observation),
    NoChange(Observation),
}

impl UpsertOutcome {
    pub fn observation(&self) -> &Observation {
        match self {
            UpsertOutcome::Created(observation)
            | UpsertOutcome::Updated(observation)
            | UpsertOutcome::NoChange(observation) => observation,
        }
    }

    pub fn into_observation(self) -> Observation {
        match self {
            UpsertOutcome::Created(observation)
            | UpsertOutcome::Updated(observation)
            | UpsertOutcome::NoChange(observation) => observation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created(_) => "created",
            UpsertOutcome::Updated(_) => "updated",
            UpsertOutcome::NoChange(_) => "no-change",
        }
    }
}

/// Creates or merges the Observation of one window.
///
/// The last persisted Observation per identifier is cached. When the store
/// reports a version conflict the cache entry is dropped and the upsert is
/// retried against fresh store state, up to `max_conflict_retries` times.
pub struct ObservationUpsertEngine {
    store: Arc<dyn FhirStore>,
    processor: Arc<ObservationProcessor>,
    cache: ObservationCache,
    max_conflict_retries: u32,
}

impl ObservationUpsertEngine {
    pub fn new(store: Arc<dyn FhirStore>, processor: Arc<ObservationProcessor>, cache: ObservationCache) -> Self {
        ObservationUpsertEngine {
            store,
            processor,
            cache,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn cache(&self) -> &ObservationCache {
        &self.cache
    }

    pub async fn upsert(
        &self,
        template: &FhirTemplate,
        group: &ObservationGroup,
        identity: &ResourceIdentity,
    ) -> Result<UpsertOutcome, UpsertError> {
        let identifier = observation_identifier(group, identity);
        let key = identifier.to_token();
        let mut use_cache = true;
        let mut attempt = 0;

        loop {
            match self.try_upsert(template, group, identity, &identifier, &key, use_cache).await {
                Err(UpsertError::Store(err)) if err.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    warn!(identifier = %key, attempt, status = err.status(), "Conflict writing observation, retrying");
                    self.cache.invalidate(&key).await;
                    use_cache = false;
                }
                Ok(outcome) => {
                    info!(identifier = %key, outcome = outcome.as_str(), "Observation upserted");
                    return Ok(outcome);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_upsert(
        &self,
        template: &FhirTemplate,
        group: &ObservationGroup,
        identity: &ResourceIdentity,
        identifier: &Identifier,
        key: &str,
        use_cache: bool,
    ) -> Result<UpsertOutcome, UpsertError> {
        let existing = self.find_existing(identifier, key, use_cache).await?;
        let cached = existing.as_ref().map_or(false, |(_, cached)| *cached);
        let outcome = match existing.map(|(observation, _)| observation) {
            None => {
                let mut observation = self.processor.create_observation(template, group)?;
                observation.identifier = vec![identifier.clone()];
                observation.subject = Some(Reference::to("Patient", &identity.patient_id));
                observation.device = Some(Reference::to("Device", &identity.device_id));
                observation.encounter = identity
                    .encounter_id
                    .as_deref()
                    .map(|encounter| Reference::to("Encounter", encounter));

                let created = self
                    .store
                    .create(&serde_json::to_value(&observation)?, Some(identifier))
                    .await?;
                UpsertOutcome::Created(serde_json::from_value(created)?)
            }
            Some(existing) => {
                let merged = self.processor.merge_observation(template, group, &existing)?;
                if merged == *existing {
                    UpsertOutcome::NoChange(existing.as_ref().clone())
                } else {
                    let updated = self
                        .store
                        .update(&serde_json::to_value(&merged)?, existing.version_id())
                        .await?;
                    UpsertOutcome::Updated(serde_json::from_value(updated)?)
                }
            }
        };

        // re-inserting an unchanged cached entry would restart its time to live
        if !(cached && matches!(outcome, UpsertOutcome::NoChange(_))) {
            self.cache
                .insert(key, Arc::new(outcome.observation().clone()))
                .await;
        }
        Ok(outcome)
    }

    /// The stored observation, and whether it came from the cache.
    async fn find_existing(
        &self,
        identifier: &Identifier,
        key: &str,
        use_cache: bool,
    ) -> Result<Option<(Arc<Observation>, bool)>, UpsertError> {
        if use_cache {
            if let Some(cached) = self.cache.get(key).await {
                debug!(identifier = %key, "Observation cache hit");
                return Ok(Some((cached, true)));
            }
            debug!(identifier = %key, "Observation cache miss");
        }

        let mut found = self.store.search_by_identifier("Observation", identifier).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some((Arc::new(serde_json::from_value(found.remove(0))?), false))),
            count => Err(UpsertError::MultipleResourcesFound {
                identifier: key.to_string(),
                count,
            }),
        }
    }
}

impl std::fmt::Debug for ObservationUpsertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationUpsertEngine")
            .field("processor", &self.processor)
            .field("cache", &self.cache)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish()
    }
}
