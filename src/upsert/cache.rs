use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::fhir::Observation;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Last persisted Observation per identifier token.
///
/// Entries expire after their time to live. Values are shared, so callers merge
/// into a clone and never mutate what the cache holds.
#[derive(Clone)]
pub struct ObservationCache {
    entries: Cache<String, Arc<Observation>>,
}

impl ObservationCache {
    pub fn new(time_to_live: Duration, max_capacity: u64) -> Self {
        ObservationCache {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(time_to_live)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Observation>> {
        self.entries.get(key).await
    }

    pub async fn insert(&self, key: impl Into<String>, observation: Arc<Observation>) {
        self.entries.insert(key.into(), observation).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

impl Default for ObservationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for ObservationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::CodeableConcept;

    fn observation() -> Arc<Observation> {
        Arc::new(Observation::new(CodeableConcept {
            text: Some("heartrate".to_string()),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_insert_get_invalidate() {
        let cache = ObservationCache::default();
        assert!(cache.get("a").await.is_none());

        cache.insert("a", observation()).await;
        assert_eq!(cache.get("a").await, Some(observation()));
        assert_eq!(cache.entry_count().await, 1);

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = ObservationCache::new(Duration::from_millis(50), 10);
        cache.insert("a", observation()).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get("a").await.is_none());
    }
}
