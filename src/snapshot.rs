//! Snapshot bookkeeping and the snapshot persistence lifecycle of a grain.
//!
//! A snapshot is the folded aggregate state plus the version metadata
//! needed to resume replay. `doing_version` runs one ahead of `version`
//! only while an event is being applied; every persistence or archive
//! step requires the two to be equal.

use std::fmt::Display;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;
use crate::error::GrainError;
use crate::event::{EventBase, now_millis};
use crate::grain::Grain;

/// Version bookkeeping shared by every aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBase<K> {
    pub state_id: K,
    /// Highest applied event version.
    pub version: i64,
    /// Version currently being applied. Equals `version` when quiescent.
    pub doing_version: i64,
    /// Smallest timestamp of any applied event.
    pub start_timestamp: i64,
    /// Lower bound on the timestamps of events newer than the persisted
    /// snapshot. Used as the replay read hint.
    pub latest_min_event_timestamp: i64,
    /// The persisted snapshot already covers every durable event.
    pub is_latest: bool,
    /// Terminal flag; no further events are accepted.
    pub is_over: bool,
    pub transaction_id: Option<String>,
    /// First version written by the open transaction, `-1` when none.
    pub transaction_start_version: i64,
    pub transaction_start_timestamp: i64,
}

impl<K> SnapshotBase<K> {
    pub fn new(state_id: K) -> Self {
        Self {
            state_id,
            version: 0,
            doing_version: 0,
            start_timestamp: 0,
            latest_min_event_timestamp: 0,
            is_latest: false,
            is_over: false,
            transaction_id: None,
            transaction_start_version: -1,
            transaction_start_timestamp: 0,
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.doing_version == self.version
    }

    pub(crate) fn clear_transaction(&mut self) {
        self.transaction_id = None;
        self.transaction_start_version = -1;
        self.transaction_start_timestamp = 0;
    }
}

impl<K: Display> SnapshotBase<K> {
    /// Fail with [`GrainError::StateInsecurity`] unless quiescent.
    pub fn ensure_quiescent(&self) -> Result<(), GrainError> {
        if self.is_quiescent() {
            Ok(())
        } else {
            Err(GrainError::StateInsecurity {
                state_id: self.state_id.to_string(),
                version: self.version,
                doing_version: self.doing_version,
            })
        }
    }

    /// Mark the next event as in flight.
    pub fn increment_doing_version(&mut self) -> Result<(), GrainError> {
        self.ensure_quiescent()?;
        self.doing_version += 1;
        Ok(())
    }

    /// Undo [`increment_doing_version`](Self::increment_doing_version)
    /// after a rejected append.
    pub fn decrement_doing_version(&mut self) {
        self.doing_version = self.version;
    }

    /// Record `base` as applied, restoring quiescence.
    ///
    /// # Errors
    ///
    /// Returns [`GrainError::EventVersionUnordered`] unless
    /// `base.version == version + 1`.
    pub fn update_version(&mut self, base: &EventBase) -> Result<(), GrainError> {
        if self.version + 1 != base.version {
            return Err(GrainError::EventVersionUnordered {
                state_id: self.state_id.to_string(),
                expected: self.version + 1,
                actual: base.version,
            });
        }
        self.version = base.version;
        self.doing_version = base.version;
        if self.start_timestamp == 0 || base.timestamp < self.start_timestamp {
            self.start_timestamp = base.timestamp;
        }
        Ok(())
    }
}

/// Aggregate state plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, S: Serialize",
    deserialize = "K: DeserializeOwned, S: DeserializeOwned"
))]
pub struct Snapshot<K, S> {
    pub base: SnapshotBase<K>,
    pub state: S,
}

impl<K, S: Default> Snapshot<K, S> {
    /// Zero-version snapshot with default state.
    pub fn new(state_id: K) -> Self {
        Self {
            base: SnapshotBase::new(state_id),
            state: S::default(),
        }
    }
}

/// Lightweight checkpoint of one observer for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSnapshot<K> {
    pub state_id: K,
    pub version: i64,
    pub doing_version: i64,
    pub start_timestamp: i64,
}

impl<K> ObserverSnapshot<K> {
    pub fn new(state_id: K) -> Self {
        Self {
            state_id,
            version: 0,
            doing_version: 0,
            start_timestamp: 0,
        }
    }

    /// Advance to `base` unconditionally, as observers may skip events
    /// they have no decoder for.
    pub fn full_update_version(&mut self, base: &EventBase) {
        self.version = base.version;
        self.doing_version = base.version;
        if self.start_timestamp == 0 || base.timestamp < self.start_timestamp {
            self.start_timestamp = base.timestamp;
        }
    }
}

impl<A: Aggregate> Grain<A> {
    /// Persist the live snapshot when forced or when at least
    /// `snapshot.version_interval` events are unsaved.
    ///
    /// Inserts on the first-ever save and updates afterwards. On failure
    /// the in-memory watermark and latest flag are restored before the
    /// error propagates.
    pub(crate) async fn save_snapshot(
        &mut self,
        force: bool,
        is_latest: bool,
    ) -> Result<(), GrainError> {
        self.snapshot.base.ensure_quiescent()?;
        let unsaved = self.snapshot.base.version - self.saved_version;
        if !force && unsaved < self.options.snapshot.version_interval {
            return Ok(());
        }

        let previous_min = self.snapshot.base.latest_min_event_timestamp;
        let previous_latest = self.snapshot.base.is_latest;
        self.snapshot.base.latest_min_event_timestamp = now_millis();
        self.snapshot.base.is_latest = is_latest;

        let result = if self.snapshot_persisted {
            self.ports.snapshots.update(&self.snapshot).await
        } else {
            self.ports.snapshots.insert(&self.snapshot).await
        };

        match result {
            Ok(()) => {
                self.saved_version = self.snapshot.base.version;
                self.snapshot_persisted = true;
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.snapshot.base.state_id,
                    version = self.saved_version,
                    is_latest,
                    "snapshot saved"
                );
                Ok(())
            }
            Err(e) => {
                self.snapshot.base.latest_min_event_timestamp = previous_min;
                self.snapshot.base.is_latest = previous_latest;
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.snapshot.base.state_id,
                    version = self.snapshot.base.version,
                    error = %e,
                    "save_snapshot failed"
                );
                Err(e.into())
            }
        }
    }

    /// Version covered by the last persisted snapshot.
    pub fn saved_version(&self) -> i64 {
        self.saved_version
    }
}
