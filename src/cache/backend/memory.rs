use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;

use super::{BackendFuture, CacheBackend, is_evictable};
use crate::cache::key::{ResourceIdentity, VariantKey};
use crate::cache::record::VariantRecord;

/// Volatile backend keeping every record in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    resources: DashMap<ResourceIdentity, HashMap<VariantKey, VariantRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored variants across all resources.
    pub fn len(&self) -> usize {
        self.resources.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
    ) -> BackendFuture<'a, Option<VariantRecord>> {
        let found = self
            .resources
            .get(identity)
            .and_then(|variants| variants.get(key).cloned());
        Box::pin(async move { Ok(found) })
    }

    fn put<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
        record: VariantRecord,
    ) -> BackendFuture<'a, ()> {
        self.resources
            .entry(identity.clone())
            .or_default()
            .insert(key.clone(), record);
        Box::pin(async { Ok(()) })
    }

    fn remove_all<'a>(&'a self, identity: &'a ResourceIdentity) -> BackendFuture<'a, usize> {
        let removed = self
            .resources
            .remove(identity)
            .map_or(0, |(_, variants)| variants.len());
        Box::pin(async move { Ok(removed) })
    }

    fn remove_expired(&self, now: SystemTime, retention: Duration) -> BackendFuture<'_, usize> {
        let mut removed = 0;
        self.resources.retain(|_, variants| {
            let before = variants.len();
            variants.retain(|_, record| !is_evictable(record, now, retention));
            removed += before - variants.len();
            !variants.is_empty()
        });
        Box::pin(async move { Ok(removed) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use bytes::Bytes;

    use super::*;
    use crate::cache::key::VaryVector;
    use crate::negotiate::MediaType;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn key(media_type: MediaType) -> VariantKey {
        VariantKey::new(media_type, None, VaryVector::default())
    }

    fn record(body: &'static [u8], created: u64, max_age: u64) -> VariantRecord {
        VariantRecord::new(
            Bytes::from_static(body),
            MediaType::text_plain(),
            at(created),
            Duration::from_secs(max_age),
        )
    }

    #[tokio::test]
    async fn put_get_replace() {
        let backend = InMemoryBackend::new();
        let id = ResourceIdentity::new("/cache");
        let plain = key(MediaType::text_plain());

        assert_eq!(backend.get(&id, &plain).await.unwrap(), None);
        backend.put(&id, &plain, record(b"one", 0, 2)).await.unwrap();
        backend.put(&id, &plain, record(b"two", 0, 2)).await.unwrap();

        let got = backend.get(&id, &plain).await.unwrap().unwrap();
        assert_eq!(got.body().as_ref(), b"two");
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn remove_all_drops_every_variant_of_one_identity() {
        let backend = InMemoryBackend::new();
        let id = ResourceIdentity::new("/cache");
        let other = ResourceIdentity::new("/other");
        backend
            .put(&id, &key(MediaType::text_plain()), record(b"p", 0, 2))
            .await
            .unwrap();
        backend
            .put(&id, &key(MediaType::text_html()), record(b"h", 0, 2))
            .await
            .unwrap();
        backend
            .put(&other, &key(MediaType::text_plain()), record(b"o", 0, 2))
            .await
            .unwrap();

        assert_eq!(backend.remove_all(&id).await.unwrap(), 2);
        assert_eq!(backend.remove_all(&id).await.unwrap(), 0);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn remove_expired_honours_retention() {
        let backend = InMemoryBackend::new();
        let id = ResourceIdentity::new("/cache");
        backend
            .put(&id, &key(MediaType::text_plain()), record(b"old", 0, 2))
            .await
            .unwrap();
        backend
            .put(&id, &key(MediaType::text_html()), record(b"new", 10, 2))
            .await
            .unwrap();

        // Expired at 2, retained until 7.
        assert_eq!(
            backend.remove_expired(at(6), Duration::from_secs(5)).await.unwrap(),
            0
        );
        assert_eq!(
            backend.remove_expired(at(7), Duration::from_secs(5)).await.unwrap(),
            1
        );
        assert_eq!(backend.len(), 1);
        assert_eq!(
            backend.remove_expired(at(100), Duration::ZERO).await.unwrap(),
            1
        );
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn overflowing_deadlines_are_kept() {
        let backend = InMemoryBackend::new();
        let id = ResourceIdentity::new("/cache");
        backend
            .put(&id, &key(MediaType::text_plain()), record(b"forever", 0, u64::MAX))
            .await
            .unwrap();
        backend
            .put(&id, &key(MediaType::text_html()), record(b"short", 0, 2))
            .await
            .unwrap();

        assert_eq!(backend.remove_expired(at(100), Duration::MAX).await.unwrap(), 0);
        assert_eq!(backend.remove_expired(at(100), Duration::ZERO).await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }
}
