//! Storage and bus ports the engine depends on.
//!
//! Every port is an object-safe async trait so grains can hold
//! `Arc<dyn ...>` handles shared across all aggregates of a process.
//! Implementations must be thread-safe; the engine never holds a port
//! lock across its own state mutation.
//!
//! Reference implementations live in [`memory`](crate::memory) (all
//! ports) and [`storage`](crate::storage) (file-backed snapshot stores).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::aggregate::{Aggregate, AggregateId};
use crate::archive::ArchiveBrief;
use crate::error::StoreError;
use crate::event::EventRecord;
use crate::snapshot::{ObserverSnapshot, Snapshot};

/// Append-only event log keyed by `(state_id, version)`.
#[async_trait]
pub trait EventStore<K: AggregateId>: Send + Sync {
    /// Append one event, keyed for idempotency by `record.unique_id`.
    ///
    /// Returns `Ok(false)` when an event with the same unique id already
    /// exists for the aggregate. That is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the version slot is taken by a
    /// different event.
    async fn append(&self, record: &EventRecord<K>) -> Result<bool, StoreError>;

    /// Append a batch atomically: either every record becomes durable or
    /// none does. Duplicate unique ids fail the whole batch.
    async fn append_transactional(&self, records: &[EventRecord<K>]) -> Result<(), StoreError>;

    /// Events with `from_version <= version <= to_version`, ascending.
    ///
    /// `from_timestamp` is a lower bound on the timestamps of every event
    /// in the range; backends partitioned by time may use it to skip
    /// partitions.
    async fn get_range(
        &self,
        state_id: &K,
        from_timestamp: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<EventRecord<K>>, StoreError>;

    /// Physically delete every event with `version <= to_version`.
    async fn delete_range(
        &self,
        state_id: &K,
        to_version: i64,
        start_timestamp: i64,
    ) -> Result<(), StoreError>;

    /// Move every event with `version <= to_version` to archive storage.
    async fn archive_range(
        &self,
        state_id: &K,
        to_version: i64,
        start_timestamp: i64,
    ) -> Result<(), StoreError>;

    /// Delete every event with `version >= from_version`. Used to discard
    /// the durable tail of a rolled-back transaction.
    async fn delete_after(
        &self,
        state_id: &K,
        from_version: i64,
        start_timestamp: i64,
    ) -> Result<(), StoreError>;
}

/// Latest checkpoint per aggregate.
#[async_trait]
pub trait SnapshotStore<K: AggregateId, S>: Send + Sync {
    async fn get(&self, state_id: &K) -> Result<Option<Snapshot<K, S>>, StoreError>;

    async fn insert(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError>;

    async fn update(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError>;

    async fn delete(&self, state_id: &K) -> Result<(), StoreError>;

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StoreError>;

    async fn update_is_latest(&self, state_id: &K, is_latest: bool) -> Result<(), StoreError>;

    async fn update_latest_min_event_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError>;

    async fn update_start_timestamp(&self, state_id: &K, timestamp: i64)
    -> Result<(), StoreError>;
}

/// Archive briefs and the full snapshot captured with each.
#[async_trait]
pub trait ArchiveStore<K: AggregateId, S>: Send + Sync {
    /// All briefs of an aggregate, in any order.
    async fn get_brief_list(&self, state_id: &K) -> Result<Vec<ArchiveBrief>, StoreError>;

    /// The brief with the highest index.
    async fn get_latest_brief(&self, state_id: &K) -> Result<Option<ArchiveBrief>, StoreError>;

    /// The snapshot stored with a brief.
    async fn get_by_id(&self, brief_id: &str) -> Result<Option<Snapshot<K, S>>, StoreError>;

    async fn insert(&self, brief: &ArchiveBrief, snapshot: &Snapshot<K, S>)
    -> Result<(), StoreError>;

    async fn delete(&self, state_id: &K, brief_id: &str) -> Result<(), StoreError>;

    async fn delete_all(&self, state_id: &K) -> Result<(), StoreError>;

    /// Mark the brief's event range as cleared.
    async fn event_is_clear(&self, state_id: &K, brief_id: &str) -> Result<(), StoreError>;

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StoreError>;
}

/// Checkpoints of observers, keyed by `(observer name, state_id)`.
#[async_trait]
pub trait ObserverSnapshotStore<K: AggregateId>: Send + Sync {
    async fn get(&self, name: &str, state_id: &K)
    -> Result<Option<ObserverSnapshot<K>>, StoreError>;

    async fn insert(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError>;

    async fn update(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError>;

    async fn update_start_timestamp(
        &self,
        name: &str,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError>;

    async fn delete(&self, name: &str, state_id: &K) -> Result<(), StoreError>;
}

/// Best-effort publication of wire envelopes to downstream consumers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one encoded envelope. `hash_key` keeps events of the same
    /// aggregate on the same partition.
    async fn publish(&self, bytes: Bytes, hash_key: &str) -> Result<(), StoreError>;
}

/// The port handles one grain needs, shared by every grain of a type.
pub struct GrainPorts<A: Aggregate> {
    pub events: Arc<dyn EventStore<A::Id>>,
    pub snapshots: Arc<dyn SnapshotStore<A::Id, A>>,
    pub archives: Arc<dyn ArchiveStore<A::Id, A>>,
    pub bus: Option<Arc<dyn EventBus>>,
}

impl<A: Aggregate> GrainPorts<A> {
    pub fn new(
        events: Arc<dyn EventStore<A::Id>>,
        snapshots: Arc<dyn SnapshotStore<A::Id, A>>,
        archives: Arc<dyn ArchiveStore<A::Id, A>>,
    ) -> Self {
        Self {
            events,
            snapshots,
            archives,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

// Manual `Clone`: only the `Arc`s are cloned, `A` need not be `Clone`-cheap.
impl<A: Aggregate> Clone for GrainPorts<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
            snapshots: Arc::clone(&self.snapshots),
            archives: Arc::clone(&self.archives),
            bus: self.bus.clone(),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for GrainPorts<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrainPorts")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}
