use std::sync::Arc;

use tracing::{debug, error};

use super::error::CacheError;
use super::key::ResourceIdentity;
use super::stats::CacheStats;
use super::store::VariantStore;

/// Removes every cached variant of a resource when a mutating request
/// targets it.
#[derive(Clone)]
pub struct InvalidationCoordinator {
    store: Arc<VariantStore>,
    stats: Arc<CacheStats>,
}

impl InvalidationCoordinator {
    pub fn new(store: Arc<VariantStore>, stats: Arc<CacheStats>) -> Self {
        Self { store, stats }
    }

    /// Returns the number of variants removed.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidationFailed`] when the backend could not remove
    /// them. The resource is then bypassed until a removal succeeds.
    pub async fn on_mutating_request(&self, identity: &ResourceIdentity) -> Result<usize, CacheError> {
        match self.store.remove_all(identity).await {
            Ok(removed) => {
                self.stats.record_invalidation();
                debug!(identity = %identity, removed, "invalidated cached variants");
                Ok(removed)
            }
            Err(source) => {
                self.stats.record_invalidation_failure();
                error!(identity = %identity, error = %source, "cache invalidation failed");
                Err(CacheError::InvalidationFailed {
                    identity: identity.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use bytes::Bytes;

    use super::*;
    use crate::cache::backend::InMemoryBackend;
    use crate::cache::key::{VariantKey, VaryVector};
    use crate::cache::record::VariantRecord;
    use crate::negotiate::MediaType;

    #[tokio::test]
    async fn removes_every_variant_and_counts() {
        let store = Arc::new(VariantStore::new(Arc::new(InMemoryBackend::new())));
        let stats = Arc::new(CacheStats::default());
        let coordinator = InvalidationCoordinator::new(store.clone(), stats.clone());
        let id = ResourceIdentity::new("/cache");

        for media_type in [MediaType::text_plain(), MediaType::text_html()] {
            let key = VariantKey::new(media_type.clone(), None, VaryVector::default());
            let record = VariantRecord::new(Bytes::new(), media_type, UNIX_EPOCH, Duration::from_secs(5));
            store.put(&id, &key, record, store.generation(&id)).await.unwrap();
        }

        assert_eq!(coordinator.on_mutating_request(&id).await.unwrap(), 2);
        assert_eq!(coordinator.on_mutating_request(&id).await.unwrap(), 0);
        assert_eq!(stats.snapshot().invalidations, 2);
    }
}
