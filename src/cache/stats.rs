use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::validate::Outcome;

/// Running cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    fresh_hits: AtomicU64,
    validator_hits: AtomicU64,
    stale_misses: AtomicU64,
    no_variant_misses: AtomicU64,
    not_acceptable: AtomicU64,
    recomputes: AtomicU64,
    stores: AtomicU64,
    superseded_stores: AtomicU64,
    backend_errors: AtomicU64,
    invalidations: AtomicU64,
    invalidation_failures: AtomicU64,
    swept: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fresh_hits: u64,
    pub validator_hits: u64,
    pub stale_misses: u64,
    pub no_variant_misses: u64,
    pub not_acceptable: u64,
    pub recomputes: u64,
    pub stores: u64,
    pub superseded_stores: u64,
    pub backend_errors: u64,
    pub invalidations: u64,
    pub invalidation_failures: u64,
    pub swept: u64,
}

impl StatsSnapshot {
    pub fn hits(&self) -> u64 {
        self.fresh_hits + self.validator_hits
    }

    pub fn misses(&self) -> u64 {
        self.stale_misses + self.no_variant_misses
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheStats {
    pub fn record_outcome(&self, outcome: Outcome) {
        bump(match outcome {
            Outcome::FreshHit => &self.fresh_hits,
            Outcome::ValidatorHit => &self.validator_hits,
            Outcome::StaleMiss => &self.stale_misses,
            Outcome::NoVariant => &self.no_variant_misses,
        });
    }

    pub fn record_not_acceptable(&self) {
        bump(&self.not_acceptable);
    }

    pub fn record_recompute(&self) {
        bump(&self.recomputes);
    }

    pub fn record_store(&self) {
        bump(&self.stores);
    }

    pub fn record_superseded(&self) {
        bump(&self.superseded_stores);
    }

    pub fn record_backend_error(&self) {
        bump(&self.backend_errors);
    }

    pub fn record_invalidation(&self) {
        bump(&self.invalidations);
    }

    pub fn record_invalidation_failure(&self) {
        bump(&self.invalidation_failures);
    }

    pub fn record_swept(&self, removed: usize) {
        self.swept
            .fetch_add(u64::try_from(removed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            fresh_hits: load(&self.fresh_hits),
            validator_hits: load(&self.validator_hits),
            stale_misses: load(&self.stale_misses),
            no_variant_misses: load(&self.no_variant_misses),
            not_acceptable: load(&self.not_acceptable),
            recomputes: load(&self.recomputes),
            stores: load(&self.stores),
            superseded_stores: load(&self.superseded_stores),
            backend_errors: load(&self.backend_errors),
            invalidations: load(&self.invalidations),
            invalidation_failures: load(&self.invalidation_failures),
            swept: load(&self.swept),
        }
    }
}
