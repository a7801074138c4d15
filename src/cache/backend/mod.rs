//! Storage backends for variant records.
//!
//! A [`CacheBackend`] holds records keyed by `(ResourceIdentity, VariantKey)`.
//! Backends only store; locking, generations and expiry decisions live in
//! [`VariantStore`](super::VariantStore). Each call must be atomic with respect
//! to concurrent calls: a reader sees a record either entirely before or
//! entirely after a concurrent write.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use super::error::BackendError;
use super::key::{ResourceIdentity, VariantKey};
use super::record::VariantRecord;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

/// A boxed, `Send` future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

pub trait CacheBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn get<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
    ) -> BackendFuture<'a, Option<VariantRecord>>;

    /// Inserts or replaces the record for `key`.
    fn put<'a>(
        &'a self,
        identity: &'a ResourceIdentity,
        key: &'a VariantKey,
        record: VariantRecord,
    ) -> BackendFuture<'a, ()>;

    /// Removes every variant of `identity`, returning how many were removed.
    fn remove_all<'a>(&'a self, identity: &'a ResourceIdentity) -> BackendFuture<'a, usize>;

    /// Drops records that expired more than `retention` before `now`.
    fn remove_expired(&self, now: SystemTime, retention: Duration) -> BackendFuture<'_, usize>;

    /// Makes completed writes durable. No-op for volatile backends.
    fn flush(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Whether a record is past its expiry plus the retention window. Records
/// whose deadline overflows `SystemTime` are never evictable.
pub(crate) fn is_evictable(record: &VariantRecord, now: SystemTime, retention: Duration) -> bool {
    record
        .expires_at()
        .and_then(|expires_at| expires_at.checked_add(retention))
        .is_some_and(|deadline| deadline <= now)
}
