//! # Stampede Guard
//!
//! Ensures at most one producer computes a missing cache entry at a time.
//! Everyone else either reads the cached value or blocks on the key's signal
//! channel and retries. The lock sentinel carries its own expiry, so a
//! crashed producer heals itself after `lock_ttl` at the cost of one round of
//! duplicate work.

use crate::metrics::EngineMetrics;
use crate::model::signal_key;
use crate::remote::{RemoteStore, RemoteValue};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// What a reader got back from [`StampedeGuard::get_or_acquire`].
#[derive(Debug)]
pub enum LockOutcome {
    /// The cached payload, with its remaining time to live.
    Value {
        payload: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// This caller is now the sole producer and must call
    /// [`StampedeGuard::release`] when done, success or failure.
    Acquired,
}

pub struct StampedeGuard {
    store: Arc<dyn RemoteStore>,
    metrics: Arc<EngineMetrics>,
    lock_ttl: Duration,
}

impl StampedeGuard {
    pub fn new(store: Arc<dyn RemoteStore>, metrics: Arc<EngineMetrics>, lock_ttl: Duration) -> Self {
        Self {
            store,
            metrics,
            lock_ttl,
        }
    }

    /// Read the value for `key` or become its sole producer.
    ///
    /// A signal wake does not guarantee the value is present (a competing
    /// waiter's timeout also rotates the token), so the retry loop is
    /// mandatory, not an optimization. Callers needing a bounded wait
    /// compose their own timeout around this call.
    pub fn get_or_acquire(&self, key: &str) -> Result<LockOutcome> {
        let signal = signal_key(key);
        loop {
            match self.store.get(key)? {
                RemoteValue::Value { payload, ttl } => {
                    return Ok(LockOutcome::Value { payload, ttl });
                }
                RemoteValue::Missing => {
                    if self.store.acquire_lock(key, &signal, self.lock_ttl)? {
                        EngineMetrics::incr(&self.metrics.locks_acquired);
                        return Ok(LockOutcome::Acquired);
                    }
                    // Lost the race; fall through and wait with the others.
                }
                RemoteValue::Locked => {}
            }
            EngineMetrics::incr(&self.metrics.lock_waits);
            self.store.wait_signal(&signal, self.lock_ttl)?;
        }
    }

    /// Release the lock and wake waiters. Safe to call even if the sentinel
    /// already expired or was overwritten by the produced value.
    pub fn release(&self, key: &str) -> Result<()> {
        self.store.release_lock(key, &signal_key(key))
    }
}
