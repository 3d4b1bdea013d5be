//! Cooperative lock protocol for shared backends
//!
//! Mutual exclusion between independent processes sharing one storage
//! backend, built on a sentinel record under a reserved key:
//!
//! 1. Acquire attempts to atomically create the sentinel (test-and-set);
//!    success means the lock is held.
//! 2. While the sentinel exists, waiters poll at `lock_wait_time`.
//! 3. A sentinel older than `max_lock_time` is presumed abandoned by a
//!    crashed holder: the waiter clears it and re-enters test-and-set, so
//!    two recoverers race through the atomic create and exactly one wins.
//! 4. Release deletes the sentinel unconditionally.
//!
//! This is timestamp-based deadlock recovery, not a fencing token: a holder
//! paused past `max_lock_time` can resume after a takeover. Callers keep the
//! guarded section minimal to bound both contention and that window.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{DEFAULT_LOCK_KEY, DEFAULT_LOCK_WAIT_MICROS, DEFAULT_MAX_LOCK_SECS};

/// Reserved key and timing knobs for the cooperative lock protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Key the sentinel record is stored under
    pub lock_key: String,
    /// Poll interval while waiting for a held lock
    pub lock_wait_time: Duration,
    /// Age after which a sentinel is presumed abandoned
    pub max_lock_time: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock_wait_time: Duration::from_micros(DEFAULT_LOCK_WAIT_MICROS),
            max_lock_time: Duration::from_secs(DEFAULT_MAX_LOCK_SECS),
        }
    }
}

impl LockOptions {
    /// Check every field against its domain.
    pub fn validate(&self) -> Result<()> {
        if self.lock_key.is_empty() {
            return Err(Error::Configuration {
                option: "lockKey".to_string(),
                value: self.lock_key.clone(),
                expected: "a non-empty reserved key".to_string(),
            });
        }
        if self.lock_wait_time.is_zero() {
            return Err(Error::Configuration {
                option: "lockWaitTime".to_string(),
                value: "0".to_string(),
                expected: "a positive interval in microseconds".to_string(),
            });
        }
        if self.max_lock_time.is_zero() {
            return Err(Error::Configuration {
                option: "maxLockTime".to_string(),
                value: "0".to_string(),
                expected: "a positive number of seconds".to_string(),
            });
        }
        Ok(())
    }
}

/// Sentinel record held under the lock key while a caller owns the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// When the holder acquired the lock
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// Record stamped with the current time.
    pub fn now() -> Self {
        Self {
            acquired_at: Utc::now(),
        }
    }

    /// Encode for storage under the lock key.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::MetaDataEncoding(format!("lock sentinel: {e}")))
    }

    /// Decode a stored sentinel. `None` means the bytes are not a sentinel;
    /// callers treat that as an abandoned record.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

/// Report of a forcible takeover of an abandoned lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLock {
    /// Key the stale sentinel was held under
    pub lock_key: String,
    /// How long the sentinel had been in place when it was broken
    pub held_for: Duration,
}

/// Raw sentinel primitives a backend exposes to the lock protocol
#[async_trait]
pub trait LockTarget: Send + Sync {
    /// Atomically create the sentinel if absent. Returns true when this
    /// caller created it, i.e. the lock was acquired.
    async fn try_create_sentinel(&self, key: &str, record: &LockRecord) -> Result<bool>;

    /// Read the current sentinel, if any.
    async fn read_sentinel(&self, key: &str) -> Result<Option<LockRecord>>;

    /// Remove the sentinel unconditionally.
    async fn clear_sentinel(&self, key: &str) -> Result<()>;
}

/// Runs the acquire/release protocol over a [`LockTarget`]
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    options: LockOptions,
}

impl LockCoordinator {
    /// Create a coordinator. Callers validate `options` at their own
    /// configuration surface.
    pub fn new(options: LockOptions) -> Self {
        Self { options }
    }

    /// Protocol knobs in effect.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire the lock, waiting on a live holder and breaking a stale one.
    ///
    /// Returns the takeover report when an abandoned sentinel was forcibly
    /// cleared on the way in.
    pub async fn acquire(&self, target: &dyn LockTarget) -> Result<Option<RecoveredLock>> {
        let key = &self.options.lock_key;
        let mut recovered: Option<RecoveredLock> = None;

        loop {
            if target.try_create_sentinel(key, &LockRecord::now()).await? {
                debug!(lock_key = %key, "lock acquired");
                return Ok(recovered);
            }

            match target.read_sentinel(key).await? {
                Some(held) => {
                    let age = Utc::now()
                        .signed_duration_since(held.acquired_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if age >= self.options.max_lock_time {
                        warn!(
                            lock_key = %key,
                            held_for_ms = age.as_millis() as u64,
                            "breaking abandoned lock"
                        );
                        target.clear_sentinel(key).await?;
                        recovered = Some(RecoveredLock {
                            lock_key: key.clone(),
                            held_for: age,
                        });
                        // Re-enter test-and-set; a racing waiter may win instead.
                        continue;
                    }
                    sleep(self.options.lock_wait_time).await;
                }
                // Released between the create attempt and the read.
                None => continue,
            }
        }
    }

    /// Release the lock by deleting the sentinel unconditionally.
    pub async fn release(&self, target: &dyn LockTarget) -> Result<()> {
        target.clear_sentinel(&self.options.lock_key).await
    }
}

// =============================================================================
// Tests
// =============================================================================
