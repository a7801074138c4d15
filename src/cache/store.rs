//! The variant store: a [`CacheBackend`] plus per-resource write ordering.
//!
//! Every resource identity owns a writer lock and a generation counter.
//! `remove_all` bumps the generation under the lock; a `put` carries the
//! generation observed when its lookup started and is discarded if the
//! counter has moved since. That keeps a recompute which began before an
//! invalidation from re-inserting content the invalidation removed.
//!
//! Generations are drawn from one store-wide epoch, so a state pruned while
//! idle and recreated later never repeats a value an in-flight `put` saw.
//!
//! When a backend removal fails the identity is marked tainted: lookups miss
//! and puts are discarded until a later `remove_all` succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::error::BackendError;
use super::key::{ResourceIdentity, VariantKey};
use super::record::VariantRecord;

/// The invalidation epoch of one resource, as seen at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// An invalidation ran after the lookup; the record was dropped.
    Superseded,
}

#[derive(Debug)]
struct IdentityState {
    writer: Mutex<()>,
    generation: AtomicU64,
    tainted: AtomicBool,
}

impl IdentityState {
    fn new(generation: u64) -> Self {
        Self {
            writer: Mutex::new(()),
            generation: AtomicU64::new(generation),
            tainted: AtomicBool::new(false),
        }
    }
}

pub struct VariantStore {
    backend: Arc<dyn CacheBackend>,
    identities: DashMap<ResourceIdentity, Arc<IdentityState>>,
    epoch: AtomicU64,
}

impl VariantStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            identities: DashMap::new(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    fn state(&self, identity: &ResourceIdentity) -> Arc<IdentityState> {
        if let Some(state) = self.identities.get(identity) {
            return Arc::clone(state.value());
        }
        let state = self
            .identities
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(IdentityState::new(self.epoch.load(Ordering::SeqCst))));
        Arc::clone(state.value())
    }

    /// The current generation of `identity`. Read it before [`lookup`](Self::lookup)
    /// and hand it back to [`put`](Self::put).
    pub fn generation(&self, identity: &ResourceIdentity) -> Generation {
        Generation(self.state(identity).generation.load(Ordering::SeqCst))
    }

    pub fn is_tainted(&self, identity: &ResourceIdentity) -> bool {
        self.identities
            .get(identity)
            .is_some_and(|state| state.tainted.load(Ordering::SeqCst))
    }

    pub async fn lookup(
        &self,
        identity: &ResourceIdentity,
        key: &VariantKey,
    ) -> Result<Option<VariantRecord>, BackendError> {
        if self.is_tainted(identity) {
            debug!(identity = %identity, "lookup skipped for tainted resource");
            return Ok(None);
        }
        self.backend.get(identity, key).await
    }

    /// Stores `record` unless `identity` was invalidated after `observed`.
    pub async fn put(
        &self,
        identity: &ResourceIdentity,
        key: &VariantKey,
        record: VariantRecord,
        observed: Generation,
    ) -> Result<PutOutcome, BackendError> {
        let state = self.state(identity);
        let _writer = state.writer.lock().await;
        if state.generation.load(Ordering::SeqCst) != observed.0
            || state.tainted.load(Ordering::SeqCst)
        {
            debug!(identity = %identity, "discarding put superseded by invalidation");
            return Ok(PutOutcome::Superseded);
        }
        self.backend.put(identity, key, record).await?;
        Ok(PutOutcome::Stored)
    }

    /// Removes every variant of `identity`.
    ///
    /// The generation moves even when the backend fails, so in-flight puts
    /// are still discarded.
    pub async fn remove_all(&self, identity: &ResourceIdentity) -> Result<usize, BackendError> {
        let state = self.state(identity);
        let _writer = state.writer.lock().await;
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        state.generation.store(next, Ordering::SeqCst);
        match self.backend.remove_all(identity).await {
            Ok(removed) => {
                state.tainted.store(false, Ordering::SeqCst);
                Ok(removed)
            }
            Err(err) => {
                state.tainted.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Retries removal for every tainted identity. Returns how many were
    /// cleared.
    pub async fn retry_tainted(&self) -> usize {
        let tainted: Vec<ResourceIdentity> = self
            .identities
            .iter()
            .filter(|entry| entry.value().tainted.load(Ordering::SeqCst))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = 0;
        for identity in tainted {
            match self.remove_all(&identity).await {
                Ok(_) => cleared += 1,
                Err(err) => warn!(identity = %identity, error = %err, "invalidation retry failed"),
            }
        }
        cleared
    }

    /// Forgets the state of identities nobody is using and that are not
    /// tainted. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let before = self.identities.len();
        self.identities.retain(|_, state| {
            Arc::strong_count(state) > 1 || state.tainted.load(Ordering::SeqCst)
        });
        before.saturating_sub(self.identities.len())
    }

    /// Number of identities with tracked write state.
    pub fn tracked(&self) -> usize {
        self.identities.len()
    }

    pub async fn remove_expired(&self, now: SystemTime, retention: Duration) -> Result<usize, BackendError> {
        self.backend.remove_expired(now, retention).await
    }

    pub async fn flush(&self) -> Result<(), BackendError> {
        self.backend.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use bytes::Bytes;

    use super::*;
    use crate::cache::backend::{BackendFuture, InMemoryBackend};
    use crate::cache::key::VaryVector;
    use crate::negotiate::MediaType;

    fn key() -> VariantKey {
        VariantKey::new(MediaType::text_plain(), None, VaryVector::default())
    }

    fn record(body: &'static [u8]) -> VariantRecord {
        VariantRecord::new(
            Bytes::from_static(body),
            MediaType::text_plain(),
            UNIX_EPOCH,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn put_after_invalidation_is_discarded() {
        let store = VariantStore::new(Arc::new(InMemoryBackend::new()));
        let id = ResourceIdentity::new("/cache");

        let observed = store.generation(&id);
        store.remove_all(&id).await.unwrap();
        let outcome = store.put(&id, &key(), record(b"old"), observed).await.unwrap();

        assert_eq!(outcome, PutOutcome::Superseded);
        assert_eq!(store.lookup(&id, &key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_with_current_generation_is_stored() {
        let store = VariantStore::new(Arc::new(InMemoryBackend::new()));
        let id = ResourceIdentity::new("/cache");

        store.remove_all(&id).await.unwrap();
        let observed = store.generation(&id);
        let outcome = store.put(&id, &key(), record(b"new"), observed).await.unwrap();

        assert_eq!(outcome, PutOutcome::Stored);
        assert!(store.lookup(&id, &key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn generations_are_per_identity() {
        let store = VariantStore::new(Arc::new(InMemoryBackend::new()));
        let a = ResourceIdentity::new("/a");
        let b = ResourceIdentity::new("/b");

        let observed_b = store.generation(&b);
        store.remove_all(&a).await.unwrap();
        assert_eq!(store.generation(&b), observed_b);
        assert!(store.generation(&a) > observed_b);
    }

    #[tokio::test]
    async fn idle_states_are_pruned() {
        let store = VariantStore::new(Arc::new(InMemoryBackend::new()));
        for i in 0..100 {
            let id = ResourceIdentity::new(&format!("/items/{i}"));
            let observed = store.generation(&id);
            store.put(&id, &key(), record(b"x"), observed).await.unwrap();
            store.remove_all(&id).await.unwrap();
        }
        assert_eq!(store.tracked(), 100);

        let busy = ResourceIdentity::new("/items/7");
        let held = store.state(&busy);
        assert_eq!(store.prune_idle(), 99);
        assert_eq!(store.tracked(), 1);
        drop(held);
        assert_eq!(store.prune_idle(), 1);
        assert_eq!(store.tracked(), 0);
    }

    #[tokio::test]
    async fn pruning_never_reuses_a_generation() {
        let store = VariantStore::new(Arc::new(InMemoryBackend::new()));
        let id = ResourceIdentity::new("/cache");

        let observed = store.generation(&id);
        store.remove_all(&id).await.unwrap();
        store.prune_idle();
        assert_eq!(store.tracked(), 0);

        let outcome = store.put(&id, &key(), record(b"old"), observed).await.unwrap();
        assert_eq!(outcome, PutOutcome::Superseded);
        assert!(store.generation(&id) > observed);
    }

    // Fails removals until told otherwise.
    #[derive(Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        failing: AtomicBool,
    }

    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn get<'a>(
            &'a self,
            identity: &'a ResourceIdentity,
            key: &'a VariantKey,
        ) -> BackendFuture<'a, Option<VariantRecord>> {
            self.inner.get(identity, key)
        }

        fn put<'a>(
            &'a self,
            identity: &'a ResourceIdentity,
            key: &'a VariantKey,
            record: VariantRecord,
        ) -> BackendFuture<'a, ()> {
            self.inner.put(identity, key, record)
        }

        fn remove_all<'a>(&'a self, identity: &'a ResourceIdentity) -> BackendFuture<'a, usize> {
            if self.failing.load(Ordering::SeqCst) {
                return Box::pin(async { Err(BackendError::Io(std::io::Error::other("read-only"))) });
            }
            self.inner.remove_all(identity)
        }

        fn remove_expired(&self, now: SystemTime, retention: Duration) -> BackendFuture<'_, usize> {
            self.inner.remove_expired(now, retention)
        }
    }

    #[tokio::test]
    async fn failed_removal_taints_until_retry_succeeds() {
        let backend = Arc::new(FlakyBackend::default());
        let store = VariantStore::new(backend.clone());
        let id = ResourceIdentity::new("/cache");

        store
            .put(&id, &key(), record(b"v1"), store.generation(&id))
            .await
            .unwrap();

        backend.failing.store(true, Ordering::SeqCst);
        assert!(store.remove_all(&id).await.is_err());
        assert!(store.is_tainted(&id));
        // The stale record is still in the backend but never served.
        assert_eq!(store.lookup(&id, &key()).await.unwrap(), None);
        assert_eq!(
            store
                .put(&id, &key(), record(b"v2"), store.generation(&id))
                .await
                .unwrap(),
            PutOutcome::Superseded
        );

        assert_eq!(store.retry_tainted().await, 0);
        assert_eq!(store.prune_idle(), 0);
        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(store.retry_tainted().await, 1);
        assert!(!store.is_tainted(&id));
        assert_eq!(store.lookup(&id, &key()).await.unwrap(), None);
    }
}
