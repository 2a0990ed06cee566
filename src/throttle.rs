//! Concurrency gate: caps the number of storage migrations running at once
//! in this process. Grounded on the teacher's habit of wrapping shared
//! counters in a small manager struct around `Arc<Mutex<_>>` (see
//! `migration.rs`'s `Arc<Mutex<HashMap<String, MigrationJob>>>`).

use crate::error::MigrateError;
use crate::Result;
use std::sync::{Arc, Mutex};

/// Process-wide migration counter, capped at `limit`. One instance is
/// shared (via `Arc`) across every call the orchestrator serves.
#[derive(Clone)]
pub struct MigrationThrottle {
    inner: Arc<Mutex<u32>>,
    limit: u32,
}

impl MigrationThrottle {
    pub fn new(limit: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(0)),
            limit,
        }
    }

    /// Reserves a slot, or fails with `too_many_storage_migrates` if the
    /// process is already at `limit`. The returned guard releases the slot
    /// on drop, so it is held for the entire migration call including every
    /// early-return error path.
    pub fn enter(&self) -> Result<ThrottlePermit> {
        let mut count = self.inner.lock().unwrap();
        if *count >= self.limit {
            return Err(MigrateError::TooManyStorageMigrates(self.limit));
        }
        *count += 1;
        Ok(ThrottlePermit {
            inner: self.inner.clone(),
        })
    }

    pub fn active(&self) -> u32 {
        *self.inner.lock().unwrap()
    }
}

/// RAII guard for one reserved throttle slot. Drops decrement
/// unconditionally, so the slot is released on every exit path — normal
/// return, early `?`, or panic unwind.
pub struct ThrottlePermit {
    inner: Arc<Mutex<u32>>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        let mut count = self.inner.lock().unwrap();
        *count = count.saturating_sub(1);
    }
}
