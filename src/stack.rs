//! Cache stack orchestration
//!
//! A [`CacheStack`] drives an ordered list of tiers behind the same
//! store/restore/delete surface a single storage offers. Writes go through
//! every tier, reads scan tiers in priority order and stop at the first
//! hit, deletes run everywhere and report the union of removed IDs.
//!
//! Every operation runs under the meta data storage's cooperative lock and
//! re-reads the meta data blob fresh inside it, so several stacks sharing
//! one backend interleave whole operations, never halves. The lock is
//! released on error paths too; an unlock failure is logged and never
//! masks the operation's own outcome.
//!
//! Swapping the replacement strategy or the meta data storage of a live
//! stack parks it in an invalid state: persisted bookkeeping no longer
//! matches the configuration, and only [`reset`](CacheStack::reset) brings
//! the stack back.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::{StackOptions, TierConfiguration};
use crate::error::{Error, Result, TierFault};
use crate::lock::RecoveredLock;
use crate::meta_data::StackMetaData;
use crate::storage::{Attributes, MetaDataStorage, Restored};
use crate::strategy::{ReplacementStrategy, StrategyKind};

/// Non-fatal incidents reported on the side-channel
///
/// Events accumulate until [`CacheStack::drain_events`] collects them.
/// At most [`EVENT_BUFFER_LIMIT`] are kept; beyond that each new event
/// displaces the oldest one and the displacement is counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// An abandoned lock sentinel was forcibly broken during acquire
    LockTimeoutRecovered {
        /// Key the sentinel was held under
        lock_key: String,
        /// How long the sentinel had been in place
        held_for: std::time::Duration,
    },
    /// Copying a restore hit into a higher tier failed; the restore itself
    /// succeeded
    BubbleUpFailed {
        /// Tier the copy was headed for
        tier: String,
        /// Resolved ID of the item
        id: String,
        /// What went wrong
        reason: String,
    },
}

/// Most events retained for [`CacheStack::drain_events`]. A full buffer
/// sheds its oldest event for each new one.
pub const EVENT_BUFFER_LIMIT: usize = 256;

/// Bounded FIFO behind the event side-channel
#[derive(Debug, Default)]
struct EventBuffer {
    events: VecDeque<StackEvent>,
    dropped: u64,
}

impl EventBuffer {
    fn push(&mut self, event: StackEvent) {
        if self.events.len() >= EVENT_BUFFER_LIMIT {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    fn drain(&mut self) -> Vec<StackEvent> {
        self.events.drain(..).collect()
    }
}

/// One-shot initializer that populates a stack while it is assembled
pub trait StackConfigurator: Send + Sync {
    /// Push tiers into the builder. Invoked exactly once per build.
    fn configure(&self, builder: &mut CacheStackBuilder) -> Result<()>;
}

/// Lifecycle state; only `Active` accepts cache operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackState {
    Active,
    Invalid,
}

/// Assembles a [`CacheStack`]: the unconfigured phase of the lifecycle
pub struct CacheStackBuilder {
    options: StackOptions,
    tiers: Vec<TierConfiguration>,
}

impl CacheStackBuilder {
    /// Start assembling a stack with the given options.
    pub fn new(options: StackOptions) -> Self {
        Self {
            options,
            tiers: Vec::new(),
        }
    }

    /// Append a tier below every tier pushed so far.
    pub fn push_tier(&mut self, tier: TierConfiguration) -> Result<&mut Self> {
        if self.tiers.iter().any(|t| t.name() == tier.name()) {
            return Err(Error::Configuration {
                option: "name".to_string(),
                value: tier.name().to_string(),
                expected: "a tier name unique within the stack".to_string(),
            });
        }
        self.tiers.push(tier);
        Ok(self)
    }

    /// Number of tiers pushed so far.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Run the configurator, if any, then activate the stack and
    /// materialize its meta data.
    pub async fn build(mut self) -> Result<CacheStack> {
        if let Some(configurator) = self.options.configurator.clone() {
            configurator.configure(&mut self)?;
        }
        if self.tiers.is_empty() {
            return Err(Error::Configuration {
                option: "tiers".to_string(),
                value: "[]".to_string(),
                expected: "at least one configured tier".to_string(),
            });
        }
        CacheStack::activate(self.options, self.tiers).await
    }
}

impl fmt::Debug for CacheStackBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStackBuilder")
            .field("options", &self.options)
            .field("tiers", &self.tiers)
            .finish()
    }
}

/// Ordered cache tiers behind a single storage-like surface
pub struct CacheStack {
    tiers: Vec<TierConfiguration>,
    bubble_up_on_restore: bool,
    strategy: RwLock<Arc<dyn ReplacementStrategy>>,
    meta_storage: RwLock<Arc<dyn MetaDataStorage>>,
    state: RwLock<StackState>,
    events: Mutex<EventBuffer>,
}

impl CacheStack {
    async fn activate(options: StackOptions, tiers: Vec<TierConfiguration>) -> Result<Self> {
        let strategy = options.replacement_strategy.instantiate();
        let meta_storage = options
            .meta_storage
            .clone()
            .unwrap_or_else(|| tiers[0].meta_storage_handle());

        let stack = Self {
            tiers,
            bubble_up_on_restore: options.bubble_up_on_restore,
            strategy: RwLock::new(strategy),
            meta_storage: RwLock::new(meta_storage),
            state: RwLock::new(StackState::Active),
            events: Mutex::new(EventBuffer::default()),
        };
        stack.materialize_meta_data().await?;

        info!(
            tiers = stack.tiers.len(),
            strategy = %options.replacement_strategy,
            bubble_up = options.bubble_up_on_restore,
            "cache stack ready"
        );
        Ok(stack)
    }

    /// Ensure a meta data blob of the configured kind exists. A persisted
    /// blob of a foreign kind is left untouched and parks the stack in the
    /// invalid state, so its owner can still recover it; a reset clears
    /// the conflict.
    async fn materialize_meta_data(&self) -> Result<()> {
        let strategy = self.strategy.read().clone();
        let meta_storage = self.meta_storage.read().clone();

        let recovered = meta_storage.lock().await?;
        self.note_recovered(recovered);
        let outcome = self
            .materialize_locked(meta_storage.as_ref(), strategy.as_ref())
            .await;
        self.release_lock(meta_storage.as_ref()).await;
        outcome
    }

    async fn materialize_locked(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
    ) -> Result<()> {
        match meta_storage.restore_meta_data().await {
            Ok(Some(meta)) if meta.kind() == strategy.kind() => Ok(()),
            Ok(Some(meta)) => {
                warn!(
                    expected = %strategy.kind(),
                    found = %meta.kind(),
                    "persisted meta data belongs to a different strategy; stack starts invalid"
                );
                *self.state.write() = StackState::Invalid;
                Ok(())
            }
            Ok(None) => meta_storage.store_meta_data(&strategy.create_meta_data()).await,
            Err(Error::MetaDataEncoding(reason)) => {
                warn!(%reason, "persisted meta data is undecodable; stack starts invalid");
                *self.state.write() = StackState::Invalid;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Store an item into every tier, evicting per tier as needed.
    ///
    /// Per-tier I/O failures do not stop the fan-out; they are collected
    /// and raised together as [`Error::TierStoreFailed`] once every tier
    /// has been attempted. A meta data kind conflict aborts immediately.
    #[instrument(skip(self, data, attributes))]
    pub async fn store(&self, id: &str, data: Bytes, attributes: &Attributes) -> Result<()> {
        self.ensure_active()?;
        let strategy = self.strategy.read().clone();
        let meta_storage = self.meta_storage.read().clone();

        let recovered = meta_storage.lock().await?;
        self.note_recovered(recovered);
        let outcome = self
            .store_locked(meta_storage.as_ref(), strategy.as_ref(), id, data, attributes)
            .await;
        self.release_lock(meta_storage.as_ref()).await;
        outcome
    }

    async fn store_locked(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
        id: &str,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<()> {
        let mut meta = self.load_meta(meta_storage, strategy).await?;
        let mut faults: Vec<TierFault> = Vec::new();

        for tier in &self.tiers {
            match strategy
                .store(tier, &mut meta, id, data.clone(), attributes)
                .await
            {
                Ok(()) => debug!(tier = %tier.name(), "stored"),
                Err(err @ Error::InvalidMetaDataKind { .. }) => return Err(err),
                Err(err) => {
                    warn!(tier = %tier.name(), error = %err, "tier store failed");
                    faults.push(TierFault {
                        tier: tier.name().to_string(),
                        error: Box::new(err),
                    });
                }
            }
        }

        meta_storage.store_meta_data(&meta).await?;
        if faults.is_empty() {
            Ok(())
        } else {
            Err(Error::TierStoreFailed { faults })
        }
    }

    /// Restore an item, scanning tiers in priority order and stopping at
    /// the first hit.
    ///
    /// With `bubble_up_on_restore` set, a hit below the top is copied into
    /// every tier above it under the attributes of this call. A failed
    /// copy is reported as [`StackEvent::BubbleUpFailed`] and never turns
    /// the successful restore into an error.
    #[instrument(skip(self, attributes))]
    pub async fn restore(
        &self,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>> {
        self.ensure_active()?;
        let strategy = self.strategy.read().clone();
        let meta_storage = self.meta_storage.read().clone();

        let recovered = meta_storage.lock().await?;
        self.note_recovered(recovered);
        let outcome = self
            .restore_locked(meta_storage.as_ref(), strategy.as_ref(), id, attributes, search)
            .await;
        self.release_lock(meta_storage.as_ref()).await;
        outcome
    }

    async fn restore_locked(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Option<Restored>> {
        let mut meta = self.load_meta(meta_storage, strategy).await?;

        let mut hit: Option<(usize, Restored)> = None;
        for (index, tier) in self.tiers.iter().enumerate() {
            if let Some(found) = strategy
                .restore(tier, &mut meta, id, attributes, search)
                .await?
            {
                debug!(tier = %tier.name(), resolved = %found.id, "restore hit");
                hit = Some((index, found));
                break;
            }
        }

        let found = match hit {
            Some((index, found)) => {
                if self.bubble_up_on_restore && index > 0 {
                    self.bubble_up(strategy, &mut meta, &found, attributes, index)
                        .await?;
                }
                Some(found)
            }
            None => {
                debug!("restore miss");
                None
            }
        };

        // A miss leaves the bookkeeping untouched, so skip the write-back.
        if found.is_some() {
            meta_storage.store_meta_data(&meta).await?;
        }
        Ok(found)
    }

    /// Copy a hit into every tier above the one that produced it. The copy
    /// carries the attributes of the restore call, not the ones stored
    /// originally.
    async fn bubble_up(
        &self,
        strategy: &dyn ReplacementStrategy,
        meta: &mut StackMetaData,
        found: &Restored,
        attributes: &Attributes,
        hit_index: usize,
    ) -> Result<()> {
        for tier in &self.tiers[..hit_index] {
            match strategy
                .store(tier, meta, &found.id, found.data.clone(), attributes)
                .await
            {
                Ok(()) => debug!(tier = %tier.name(), id = %found.id, "bubbled up"),
                Err(err @ Error::InvalidMetaDataKind { .. }) => return Err(err),
                Err(err) => {
                    warn!(tier = %tier.name(), id = %found.id, error = %err, "bubble-up failed");
                    self.events.lock().push(StackEvent::BubbleUpFailed {
                        tier: tier.name().to_string(),
                        id: found.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete matching items from every tier.
    ///
    /// Returns the union of removed IDs without duplicates, ordered by
    /// first removal.
    #[instrument(skip(self, attributes))]
    pub async fn delete(
        &self,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Vec<String>> {
        self.ensure_active()?;
        let strategy = self.strategy.read().clone();
        let meta_storage = self.meta_storage.read().clone();

        let recovered = meta_storage.lock().await?;
        self.note_recovered(recovered);
        let outcome = self
            .delete_locked(meta_storage.as_ref(), strategy.as_ref(), id, attributes, search)
            .await;
        self.release_lock(meta_storage.as_ref()).await;
        outcome
    }

    async fn delete_locked(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
        id: &str,
        attributes: &Attributes,
        search: bool,
    ) -> Result<Vec<String>> {
        let mut meta = self.load_meta(meta_storage, strategy).await?;

        let mut union: Vec<String> = Vec::new();
        for tier in &self.tiers {
            let deleted = strategy
                .delete(tier, &mut meta, id, attributes, search)
                .await?;
            debug!(tier = %tier.name(), deleted = deleted.len(), "tier delete");
            for removed in deleted {
                if !union.contains(&removed) {
                    union.push(removed);
                }
            }
        }

        if !union.is_empty() {
            meta_storage.store_meta_data(&meta).await?;
        }
        Ok(union)
    }

    /// Clear every tier and recreate the meta data with the active
    /// strategy. This is the one transition out of the invalid state.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        let strategy = self.strategy.read().clone();
        let meta_storage = self.meta_storage.read().clone();

        let recovered = meta_storage.lock().await?;
        self.note_recovered(recovered);
        let outcome = self
            .reset_locked(meta_storage.as_ref(), strategy.as_ref())
            .await;
        self.release_lock(meta_storage.as_ref()).await;

        if outcome.is_ok() {
            *self.state.write() = StackState::Active;
            info!("cache stack reset");
        }
        outcome
    }

    async fn reset_locked(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
    ) -> Result<()> {
        for tier in &self.tiers {
            tier.storage().reset().await?;
            debug!(tier = %tier.name(), "tier cleared");
        }
        meta_storage.store_meta_data(&strategy.create_meta_data()).await
    }

    /// Switch the replacement strategy. The persisted bookkeeping no
    /// longer matches, so the stack is invalid until [`reset`](Self::reset).
    pub fn set_replacement_strategy(&self, kind: StrategyKind) {
        *self.strategy.write() = kind.instantiate();
        *self.state.write() = StackState::Invalid;
        warn!(strategy = %kind, "replacement strategy changed; stack invalid until reset");
    }

    /// Point the stack at a different meta data storage. The blob over
    /// there cannot be assumed to match, so the stack is invalid until
    /// [`reset`](Self::reset).
    pub fn set_meta_storage(&self, meta_storage: Arc<dyn MetaDataStorage>) {
        *self.meta_storage.write() = meta_storage;
        *self.state.write() = StackState::Invalid;
        warn!("meta data storage changed; stack invalid until reset");
    }

    /// Drain the non-fatal incidents accumulated since the last call.
    ///
    /// The buffer keeps at most [`EVENT_BUFFER_LIMIT`] events between
    /// drains; a caller that never drains pays a bounded amount of memory
    /// and loses the oldest events first. Every incident is also logged
    /// when it happens, whether or not its event survives to the drain.
    pub fn drain_events(&self) -> Vec<StackEvent> {
        self.events.lock().drain()
    }

    /// Number of events shed so far because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.events.lock().dropped
    }

    /// Number of configured tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    fn ensure_active(&self) -> Result<()> {
        match *self.state.read() {
            StackState::Active => Ok(()),
            StackState::Invalid => Err(Error::StackInvalidState {
                state: "invalid".to_string(),
            }),
        }
    }

    /// Read the blob fresh under the lock. A missing blob yields a fresh
    /// one; a blob of a foreign kind, or one that does not decode, is a
    /// kind conflict.
    async fn load_meta(
        &self,
        meta_storage: &dyn MetaDataStorage,
        strategy: &dyn ReplacementStrategy,
    ) -> Result<StackMetaData> {
        match meta_storage.restore_meta_data().await {
            Ok(Some(meta)) => {
                if meta.kind() == strategy.kind() {
                    Ok(meta)
                } else {
                    Err(Error::InvalidMetaDataKind {
                        expected: strategy.kind().to_string(),
                        actual: meta.kind().to_string(),
                    })
                }
            }
            Ok(None) => Ok(strategy.create_meta_data()),
            Err(Error::MetaDataEncoding(_)) => Err(Error::InvalidMetaDataKind {
                expected: strategy.kind().to_string(),
                actual: "unrecognized".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn note_recovered(&self, recovered: Option<RecoveredLock>) {
        if let Some(recovered) = recovered {
            warn!(
                lock_key = %recovered.lock_key,
                held_for_ms = recovered.held_for.as_millis() as u64,
                "recovered abandoned lock"
            );
            self.events.lock().push(StackEvent::LockTimeoutRecovered {
                lock_key: recovered.lock_key,
                held_for: recovered.held_for,
            });
        }
    }

    async fn release_lock(&self, meta_storage: &dyn MetaDataStorage) {
        if let Err(err) = meta_storage.unlock().await {
            warn!(error = %err, "failed to release meta data lock");
        }
    }
}

impl fmt::Debug for CacheStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStack")
            .field("tiers", &self.tiers)
            .field("state", &*self.state.read())
            .field("bubble_up_on_restore", &self.bubble_up_on_restore)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
