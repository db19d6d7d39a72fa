//! Fault-injecting store wrapper for deterministic failure testing.
//!
//! Wraps any [`NodeStore`] and fails loads, saves, and commits with
//! [`StoreError::InjectedFault`] at configurable rates. The random source is
//! seeded, so the same seed reproduces the same fault sequence.

use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::Contents;
use crate::storage::store::{NodeId, NodeStore, Snapshot, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a load error (0.0 - 1.0).
    pub load_error_rate: f64,
    /// Probability of a save error (0.0 - 1.0).
    pub save_error_rate: f64,
    /// Probability of a commit error (0.0 - 1.0).
    pub commit_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail every load.
    #[must_use]
    pub const fn failing_loads() -> Self {
        Self {
            load_error_rate: 1.0,
            save_error_rate: 0.0,
            commit_error_rate: 0.0,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            load_error_rate: 0.05,
            save_error_rate: 0.05,
            commit_error_rate: 0.05,
        }
    }
}

/// Statistics about injected faults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultStats {
    pub loads: u64,
    pub saves: u64,
    pub commits: u64,
    pub injected_load_errors: u64,
    pub injected_save_errors: u64,
    pub injected_commit_errors: u64,
}

/// A node store that forwards to `S` but fails on demand.
pub struct FaultyStore<S> {
    inner: S,
    state: Mutex<FaultState>,
}

struct FaultState {
    config: FaultConfig,
    rng: StdRng,
    stats: FaultStats,
}

impl FaultState {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

impl<S> FaultyStore<S> {
    /// Wrap `inner` with faults disabled.
    #[must_use]
    pub fn new(inner: S, seed: u64) -> Self {
        Self::with_config(inner, seed, FaultConfig::default())
    }

    #[must_use]
    pub fn with_config(inner: S, seed: u64, config: FaultConfig) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState {
                config,
                rng: StdRng::seed_from_u64(seed),
                stats: FaultStats::default(),
            }),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().expect("lock poisoned")
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.lock().config = config;
    }

    #[must_use]
    pub fn stats(&self) -> FaultStats {
        self.lock().stats
    }
}

impl<K, V, S: NodeStore<K, V>> NodeStore<K, V> for FaultyStore<S> {
    fn load(&self, id: NodeId) -> Result<Contents<K, V>, StoreError> {
        {
            let mut state = self.lock();
            state.stats.loads += 1;
            let rate = state.config.load_error_rate;
            if state.should_inject_fault(rate) {
                state.stats.injected_load_errors += 1;
                tracing::trace!(id, "injecting load fault");
                return Err(StoreError::InjectedFault(format!("simulated load error for node {id}")));
            }
        }
        self.inner.load(id)
    }

    fn new_reference(&self, contents: &Contents<K, V>) -> NodeId {
        self.inner.new_reference(contents)
    }

    fn mark_dirty(&self, id: NodeId) {
        self.inner.mark_dirty(id);
    }

    fn is_dirty(&self, id: NodeId) -> bool {
        self.inner.is_dirty(id)
    }

    fn discard(&self, id: NodeId) {
        self.inner.discard(id);
    }

    fn save(&self, id: NodeId, contents: &Contents<K, V>) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            state.stats.saves += 1;
            let rate = state.config.save_error_rate;
            if state.should_inject_fault(rate) {
                state.stats.injected_save_errors += 1;
                return Err(StoreError::InjectedFault(format!("simulated save error for node {id}")));
            }
        }
        self.inner.save(id, contents)
    }

    fn commit(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            state.stats.commits += 1;
            let rate = state.config.commit_error_rate;
            if state.should_inject_fault(rate) {
                state.stats.injected_commit_errors += 1;
                return Err(StoreError::InjectedFault("simulated commit error".to_string()));
            }
        }
        self.inner.commit(snapshot)
    }

    fn last_commit(&self) -> Option<Snapshot> {
        self.inner.last_commit()
    }
}
