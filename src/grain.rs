//! The aggregate grain: one aggregate's live snapshot plus everything that
//! mutates it.
//!
//! A `Grain` is owned by exactly one actor task (see [`actor`](crate::actor)).
//! Snapshot persistence lives in [`snapshot`](crate::snapshot), archive and
//! compaction in [`archive`](crate::archive), transactions in
//! [`transaction`](crate::transaction) and the concurrent batcher in
//! [`batch`](crate::batch); each adds its own `impl Grain` block.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::archive::ArchiveState;
use crate::codec::WireEnvelope;
use crate::command::CommandContext;
use crate::config::GrainOptions;
use crate::error::{ExecuteError, GrainError};
use crate::event::{
    EventBase, EventRecord, EventUid, decode_event, default_unique_id, encode_event, now_millis,
};
use crate::follow::FollowUnit;
use crate::ports::GrainPorts;
use crate::snapshot::Snapshot;
use crate::transaction::TransactionState;

/// How [`Grain::over`] disposes of the aggregate's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverType {
    /// Close the aggregate, keep events and archives.
    #[default]
    None,
    /// Close and move every event to archive storage.
    ArchivingEvent,
    /// Close and delete every event.
    DeleteEvent,
    /// Close and delete events, archives and the snapshot.
    DeleteAll,
}

/// Single-writer owner of one aggregate's state.
pub struct Grain<A: Aggregate> {
    pub(crate) state_id: A::Id,
    pub(crate) snapshot: Snapshot<A::Id, A>,
    /// Deep copy used to undo transactions without replaying.
    pub(crate) backup: Snapshot<A::Id, A>,
    pub(crate) saved_version: i64,
    pub(crate) snapshot_persisted: bool,
    pub(crate) archive: ArchiveState,
    pub(crate) ports: GrainPorts<A>,
    pub(crate) follow: FollowUnit<A::Id>,
    pub(crate) options: Arc<GrainOptions>,
    pub(crate) write_permit: Arc<Semaphore>,
    pub(crate) transaction: Option<TransactionState<A>>,
}

impl<A: Aggregate> Grain<A> {
    /// Load and replay the aggregate.
    ///
    /// Reads archive briefs (reopening an interrupted tail brief), then the
    /// latest snapshot, falling back to the newest archive snapshot and
    /// finally a fresh one, and replays events until caught up.
    ///
    /// # Errors
    ///
    /// Any storage or decode failure aborts activation.
    pub async fn activate(
        state_id: A::Id,
        ports: GrainPorts<A>,
        follow: FollowUnit<A::Id>,
        options: Arc<GrainOptions>,
    ) -> Result<Self, GrainError> {
        let fresh = Snapshot::new(state_id.clone());
        let mut grain = Self {
            state_id,
            backup: fresh.clone(),
            snapshot: fresh,
            saved_version: 0,
            snapshot_persisted: false,
            archive: ArchiveState::default(),
            ports,
            follow,
            options,
            write_permit: Arc::new(Semaphore::new(1)),
            transaction: None,
        };

        if let Err(e) = grain.activate_inner().await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %grain.state_id,
                error = %e,
                "activation failed"
            );
            return Err(e);
        }

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %grain.state_id,
            version = grain.snapshot.base.version,
            "grain activated"
        );
        Ok(grain)
    }

    async fn activate_inner(&mut self) -> Result<(), GrainError> {
        self.load_archive_briefs().await?;
        self.recover().await?;
        self.backup = self.snapshot.clone();
        self.rebuild_pending_archive().await
    }

    /// Reload the snapshot from storage and replay newer events.
    pub(crate) async fn recover(&mut self) -> Result<(), GrainError> {
        self.read_snapshot().await?;
        self.replay().await
    }

    async fn read_snapshot(&mut self) -> Result<(), GrainError> {
        if let Some(mut snapshot) = self.ports.snapshots.get(&self.state_id).await? {
            snapshot.base.clear_transaction();
            self.saved_version = snapshot.base.version;
            self.snapshot_persisted = true;
            self.snapshot = snapshot;
            return Ok(());
        }

        self.saved_version = 0;
        self.snapshot_persisted = false;

        if self.options.archive.enabled
            && let Some(last) = self.archive.last()
            && let Some(mut snapshot) = self.ports.archives.get_by_id(&last.id).await?
        {
            tracing::info!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                version = snapshot.base.version,
                "snapshot restored from archive"
            );
            snapshot.base.is_latest = false;
            snapshot.base.latest_min_event_timestamp = 0;
            snapshot.base.clear_transaction();
            self.snapshot = snapshot;
            return Ok(());
        }

        self.snapshot = Snapshot::new(self.state_id.clone());
        Ok(())
    }

    /// Apply stored events in pages until a short page is returned.
    async fn replay(&mut self) -> Result<(), GrainError> {
        let page = self.options.snapshot.events_per_read.max(1);
        while !self.snapshot.base.is_latest {
            let from = self.snapshot.base.version + 1;
            let records = self
                .ports
                .events
                .get_range(
                    &self.state_id,
                    self.snapshot.base.latest_min_event_timestamp,
                    from,
                    from.saturating_add(page - 1),
                )
                .await?;
            for record in &records {
                let event: A::DomainEvent = decode_event(&record.payload)?;
                self.snapshot.base.increment_doing_version()?;
                self.apply_in_flight(&record.base, &event)?;
            }
            if (records.len() as i64) < page {
                break;
            }
        }
        Ok(())
    }

    /// Fold `event` into the live state; `doing_version` is already bumped.
    pub(crate) fn apply_in_flight(
        &mut self,
        base: &EventBase,
        event: &A::DomainEvent,
    ) -> Result<(), GrainError> {
        self.snapshot.state = std::mem::take(&mut self.snapshot.state).apply(event);
        self.snapshot.base.update_version(base)
    }

    /// Apply a freshly decoded copy of `record` to the backup snapshot, if
    /// the backup is exactly one version behind it.
    pub(crate) fn apply_to_backup(&mut self, record: &EventRecord<A::Id>) -> Result<(), GrainError> {
        if self.backup.base.version + 1 != record.base.version {
            return Ok(());
        }
        let event: A::DomainEvent = decode_event(&record.payload)?;
        self.backup.base.increment_doing_version()?;
        self.backup.state = std::mem::take(&mut self.backup.state).apply(&event);
        self.backup.base.update_version(&record.base)
    }

    /// Raise one event.
    ///
    /// Returns `Ok(true)` when appended and applied, `Ok(false)` when the
    /// unique id was already used (the event was raised before). Without a
    /// `uid`, the token is `"{state_id}_{version}"` and the timestamp is the
    /// wall clock.
    ///
    /// On any error the grain reloads its state from storage and forces a
    /// snapshot save before returning the error.
    pub async fn raise_event(
        &mut self,
        event: A::DomainEvent,
        uid: Option<EventUid>,
    ) -> Result<bool, GrainError> {
        if self.snapshot.base.is_over {
            return Err(GrainError::StateIsOver {
                state_id: self.state_id.to_string(),
            });
        }
        if let Some(tx) = &self.transaction {
            return Err(GrainError::TransactionPending(tx.id.clone()));
        }

        let version = self.snapshot.base.version + 1;
        let (unique_id, timestamp) = match uid {
            Some(uid) => (uid.uid, uid.timestamp),
            None => (default_unique_id(&self.state_id, version), now_millis()),
        };
        let base = EventBase::new(version, timestamp);

        match self.try_raise(&event, base, unique_id).await {
            Ok(appended) => Ok(appended),
            Err(e) => {
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    version,
                    error = %e,
                    "raise_event failed, recovering"
                );
                self.recover_after_failure().await;
                Err(e)
            }
        }
    }

    async fn try_raise(
        &mut self,
        event: &A::DomainEvent,
        base: EventBase,
        unique_id: String,
    ) -> Result<bool, GrainError> {
        let encoded = encode_event(event)?;
        self.before_raise(base.timestamp).await?;
        self.snapshot.base.increment_doing_version()?;

        let record = EventRecord {
            state_id: self.state_id.clone(),
            base,
            type_code: encoded.type_code,
            payload: encoded.payload,
            unique_id,
        };

        if !self.ports.events.append(&record).await? {
            self.snapshot.base.decrement_doing_version();
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                unique_id = %record.unique_id,
                "duplicate unique id, event already raised"
            );
            self.archive(false).await?;
            return Ok(false);
        }

        self.apply_in_flight(&base, event)?;
        self.apply_to_backup(&record)?;
        self.event_archive(&base).await?;
        self.save_snapshot(false, false).await?;
        self.publish(&record).await;

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            version = base.version,
            type_code = %record.type_code,
            "event raised"
        );
        Ok(true)
    }

    /// Reload from storage and force a snapshot save. Failures are logged;
    /// the caller propagates the original error.
    pub(crate) async fn recover_after_failure(&mut self) {
        if let Err(e) = self.recover().await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                error = %e,
                "recovery failed"
            );
            return;
        }
        if let Err(e) = self.save_snapshot(true, false).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                error = %e,
                "snapshot save after recovery failed"
            );
        }
    }

    /// Pre-raise hook for an event stamped `timestamp`.
    ///
    /// Clears the persisted latest flag, applies archive checks and lowers
    /// the persisted timestamp watermarks so replay still finds the event.
    pub(crate) async fn before_raise(&mut self, timestamp: i64) -> Result<(), GrainError> {
        if self.snapshot.base.is_latest {
            if self.snapshot_persisted {
                self.ports
                    .snapshots
                    .update_is_latest(&self.state_id, false)
                    .await?;
            }
            self.snapshot.base.is_latest = false;
        }

        self.archive_before_raise(timestamp).await?;

        if timestamp < self.snapshot.base.latest_min_event_timestamp {
            if self.snapshot_persisted {
                self.ports
                    .snapshots
                    .update_latest_min_event_timestamp(&self.state_id, timestamp)
                    .await?;
            }
            self.snapshot.base.latest_min_event_timestamp = timestamp;
        }
        if self.snapshot_persisted && timestamp < self.snapshot.base.start_timestamp {
            self.ports
                .snapshots
                .update_start_timestamp(&self.state_id, timestamp)
                .await?;
        }
        Ok(())
    }

    /// Best-effort fan-out to the bus and registered observers.
    pub(crate) async fn publish(&self, record: &EventRecord<A::Id>) {
        let bytes = match WireEnvelope::from_record(record).and_then(|env| env.encode()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    version = record.base.version,
                    error = %e,
                    "failed to encode wire envelope"
                );
                return;
            }
        };

        if let Some(bus) = &self.ports.bus
            && let Err(e) = bus.publish(bytes.clone(), &self.hash_key()).await
        {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                version = record.base.version,
                error = %e,
                "event bus publish failed"
            );
        }
        self.follow.tell_all(&self.state_id, &bytes).await;
    }

    /// Partition key for bus publication.
    pub fn hash_key(&self) -> String {
        format!("{}:{}", A::AGGREGATE_TYPE, self.state_id)
    }

    /// Run `cmd` against the current state and raise every produced event.
    ///
    /// Returns the events that were appended; events whose unique id was
    /// already used are left out.
    pub async fn execute(
        &mut self,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<A::DomainEvent>, ExecuteError<A::Error>> {
        let span = ctx.span(A::AGGREGATE_TYPE);
        async {
            let events = self.snapshot.state.handle(cmd).map_err(ExecuteError::Domain)?;
            let mut appended = Vec::with_capacity(events.len());
            for (index, event) in events.into_iter().enumerate() {
                if self.raise_event(event.clone(), ctx.event_uid(index)).await? {
                    appended.push(event);
                }
            }
            Ok::<_, ExecuteError<A::Error>>(appended)
        }
        .instrument(span)
        .await
    }

    /// Terminally close the aggregate.
    ///
    /// Any `over_type` other than [`OverType::None`] first requires every
    /// observer to have consumed the current version.
    pub async fn over(&mut self, over_type: OverType) -> Result<(), GrainError> {
        if self.snapshot.base.is_over {
            return Err(GrainError::StateIsOver {
                state_id: self.state_id.to_string(),
            });
        }
        if let Some(tx) = &self.transaction {
            return Err(GrainError::TransactionPending(tx.id.clone()));
        }
        self.snapshot.base.ensure_quiescent()?;

        let version = self.snapshot.base.version;
        if over_type != OverType::None {
            let versions = self
                .follow
                .get_and_save_versions(&self.state_id, version)
                .await?;
            if versions.iter().any(|v| *v < version) {
                return Err(GrainError::ObserverNotCompleted {
                    state_id: self.state_id.to_string(),
                    version,
                });
            }
        }

        self.snapshot.base.is_over = true;
        let persisted = if self.snapshot_persisted && self.saved_version == version {
            self.persist_over_flags().await
        } else {
            self.save_snapshot(true, true).await
        };
        if let Err(e) = persisted {
            self.snapshot.base.is_over = false;
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                version,
                error = %e,
                "over failed"
            );
            return Err(e);
        }
        self.snapshot.base.is_latest = true;

        let start_timestamp = self.snapshot.base.start_timestamp;
        let archive_enabled = self.options.archive.enabled;
        match over_type {
            OverType::None => {
                if archive_enabled && !self.archive.briefs.is_empty() {
                    self.ports.archives.over(&self.state_id, true).await?;
                }
            }
            OverType::ArchivingEvent => {
                if archive_enabled {
                    self.delete_all_archives().await?;
                }
                self.ports
                    .events
                    .archive_range(&self.state_id, version, start_timestamp)
                    .await?;
            }
            OverType::DeleteEvent => {
                if archive_enabled {
                    self.delete_all_archives().await?;
                }
                self.ports
                    .events
                    .delete_range(&self.state_id, version, start_timestamp)
                    .await?;
            }
            OverType::DeleteAll => {
                if archive_enabled {
                    self.delete_all_archives().await?;
                }
                self.ports
                    .events
                    .delete_range(&self.state_id, version, start_timestamp)
                    .await?;
                if self.snapshot_persisted {
                    self.ports.snapshots.delete(&self.state_id).await?;
                    self.snapshot_persisted = false;
                    self.saved_version = 0;
                }
            }
        }

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            version,
            ?over_type,
            "aggregate closed"
        );
        Ok(())
    }

    /// Mark the already saved snapshot as closed and caught up.
    async fn persist_over_flags(&self) -> Result<(), GrainError> {
        self.ports.snapshots.over(&self.state_id, true).await?;
        self.ports
            .snapshots
            .update_is_latest(&self.state_id, true)
            .await?;
        Ok(())
    }

    /// Flush state before the grain is dropped.
    ///
    /// Rolls back an open transaction, saves the snapshot as latest when at
    /// least `snapshot.min_save_interval` events are unsaved, and commits the
    /// in-progress archive brief.
    pub async fn deactivate(&mut self) -> Result<(), GrainError> {
        if let Some(tx_id) = self.transaction.as_ref().map(|tx| tx.id.clone()) {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                transaction_id = %tx_id,
                "rolling back open transaction on deactivation"
            );
            self.rollback_transaction(&tx_id).await?;
        }

        let unsaved = self.snapshot.base.version - self.saved_version;
        if unsaved > 0 && unsaved >= self.options.snapshot.min_save_interval {
            self.save_snapshot(true, true).await?;
        } else if unsaved == 0 && self.snapshot_persisted && !self.snapshot.base.is_latest {
            self.ports
                .snapshots
                .update_is_latest(&self.state_id, true)
                .await?;
            self.snapshot.base.is_latest = true;
        }
        self.archive(true).await?;

        tracing::info!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            version = self.snapshot.base.version,
            "grain deactivated"
        );
        Ok(())
    }

    pub fn state_id(&self) -> &A::Id {
        &self.state_id
    }

    pub fn snapshot(&self) -> &Snapshot<A::Id, A> {
        &self.snapshot
    }

    /// The snapshot transactions roll back to.
    pub fn backup_snapshot(&self) -> &Snapshot<A::Id, A> {
        &self.backup
    }

    pub fn state(&self) -> &A {
        &self.snapshot.state
    }

    pub fn version(&self) -> i64 {
        self.snapshot.base.version
    }

    pub fn options(&self) -> &GrainOptions {
        &self.options
    }

    /// The binary semaphore guarding transactions.
    pub fn write_permit(&self) -> Arc<Semaphore> {
        Arc::clone(&self.write_permit)
    }

    #[cfg(test)]
    pub(crate) fn snapshot_mut(&mut self) -> &mut Snapshot<A::Id, A> {
        &mut self.snapshot
    }
}

impl<A: Aggregate> std::fmt::Debug for Grain<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grain")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("state_id", &self.state_id)
            .field("version", &self.snapshot.base.version)
            .field("saved_version", &self.saved_version)
            .field(
                "transaction",
                &self.transaction.as_ref().map(|tx| tx.id.as_str()),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{CounterCommand, CounterError, CounterEvent};
    use crate::codec::WireEnvelope;
    use crate::follow::test_support::StubObserver;
    use crate::memory::test_support::TestPorts;

    fn id() -> String {
        "c-1".to_string()
    }

    #[tokio::test]
    async fn raise_event_appends_contiguous_versions() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;

        for _ in 0..3 {
            let appended = grain
                .raise_event(CounterEvent::Incremented, None)
                .await
                .expect("raise should succeed");
            assert!(appended);
        }

        assert_eq!(grain.version(), 3);
        assert_eq!(grain.state().value, 3);
        let versions: Vec<i64> = ports
            .events
            .records(&id())
            .await
            .iter()
            .map(|r| r.base.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(ports.events.records(&id()).await[1].unique_id, "c-1_2");
    }

    #[tokio::test]
    async fn duplicate_unique_id_is_not_applied_twice() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        let uid = EventUid::new("order-42", 1_000);

        assert!(grain
            .raise_event(CounterEvent::Added { amount: 5 }, Some(uid.clone()))
            .await
            .expect("first raise"));
        let second = grain
            .raise_event(CounterEvent::Added { amount: 5 }, Some(uid))
            .await
            .expect("second raise");

        assert!(!second);
        assert_eq!(grain.state().value, 5);
        assert_eq!(grain.version(), 1);
        assert!(grain.snapshot().base.is_quiescent());
        assert_eq!(ports.events.records(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn caller_timestamp_is_used_with_uid() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, Some(EventUid::new("u", 1234)))
            .await
            .expect("raise");
        let records = ports.events.records(&id()).await;
        assert_eq!(records[0].base.timestamp, 1234);
        assert_eq!(grain.snapshot().base.start_timestamp, 1234);
    }

    #[tokio::test]
    async fn reactivation_replays_to_equal_state() {
        let ports = TestPorts::new();
        let options = GrainOptions::default();
        let mut grain = ports.activate("c-1", options.clone()).await;
        for amount in [3, 4, 5] {
            grain
                .raise_event(CounterEvent::Added { amount }, None)
                .await
                .expect("raise");
        }
        grain
            .raise_event(CounterEvent::Decremented, None)
            .await
            .expect("raise");
        let live = grain.snapshot().state.clone();
        drop(grain);

        let replayed = ports.activate("c-1", options).await;
        assert_eq!(replayed.state(), &live);
        assert_eq!(replayed.version(), 4);
        assert_eq!(replayed.backup_snapshot().state, live);
    }

    #[tokio::test]
    async fn replay_pages_through_long_logs() {
        let ports = TestPorts::new();
        let mut options = GrainOptions::default();
        options.snapshot.events_per_read = 2;
        let mut grain = ports.activate("c-1", options.clone()).await;
        for _ in 0..5 {
            grain
                .raise_event(CounterEvent::Incremented, None)
                .await
                .expect("raise");
        }
        drop(grain);

        let replayed = ports.activate("c-1", options).await;
        assert_eq!(replayed.version(), 5);
        assert_eq!(replayed.state().value, 5);
    }

    #[tokio::test]
    async fn oversized_read_page_replays_in_one_pass() {
        let ports = TestPorts::new();
        let mut options = GrainOptions::default();
        options.snapshot.events_per_read = i64::MAX;
        let mut grain = ports.activate("c-1", options.clone()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        drop(grain);

        let replayed = ports.activate("c-1", options).await;
        assert_eq!(replayed.version(), 1);
        assert_eq!(replayed.state().value, 1);
    }

    #[tokio::test]
    async fn failed_append_recovers_and_forces_snapshot() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");

        ports.events.fail_next_appends(1).await;
        let err = grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrainError::Store(_)));

        assert_eq!(grain.version(), 1);
        assert!(grain.snapshot().base.is_quiescent());
        assert_eq!(grain.saved_version(), 1);
        let stored = ports.snapshots.stored(&id()).await.expect("forced save");
        assert_eq!(stored.base.version, 1);

        assert!(grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise after recovery"));
        assert_eq!(grain.version(), 2);
    }

    #[tokio::test]
    async fn snapshot_saved_every_interval() {
        let ports = TestPorts::new();
        let mut options = GrainOptions::default();
        options.snapshot.version_interval = 3;
        let mut grain = ports.activate("c-1", options).await;

        for _ in 0..2 {
            grain
                .raise_event(CounterEvent::Incremented, None)
                .await
                .expect("raise");
        }
        assert!(ports.snapshots.stored(&id()).await.is_none());

        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        let stored = ports.snapshots.stored(&id()).await.expect("saved at 3");
        assert_eq!(stored.base.version, 3);
        assert_eq!(stored.state.value, 3);
    }

    #[tokio::test]
    async fn old_timestamp_lowers_persisted_watermark() {
        let ports = TestPorts::new();
        let mut options = GrainOptions::default();
        options.snapshot.version_interval = 1;
        let mut grain = ports.activate("c-1", options.clone()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");

        let mut stale = options.clone();
        stale.snapshot.version_interval = 100;
        drop(grain);
        let mut grain = ports.activate("c-1", stale.clone()).await;
        grain
            .raise_event(CounterEvent::Incremented, Some(EventUid::new("late", 10)))
            .await
            .expect("raise");

        let stored = ports.snapshots.stored(&id()).await.expect("stored");
        assert_eq!(stored.base.latest_min_event_timestamp, 10);
        assert_eq!(stored.base.start_timestamp, 10);
        drop(grain);

        let replayed = ports.activate("c-1", stale).await;
        assert_eq!(replayed.version(), 2);
    }

    #[tokio::test]
    async fn execute_returns_domain_errors_without_raising() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        let err = grain
            .execute(CounterCommand::Decrement, &CommandContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Domain(CounterError::AlreadyZero)));
        assert_eq!(grain.version(), 0);
    }

    #[tokio::test]
    async fn execute_with_unique_id_is_idempotent() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        let ctx = CommandContext::default().with_unique(EventUid::new("cmd-1", 50));

        let first = grain
            .execute(CounterCommand::Add(2), &ctx)
            .await
            .expect("execute");
        let second = grain
            .execute(CounterCommand::Add(2), &ctx)
            .await
            .expect("execute");

        assert_eq!(first, vec![CounterEvent::Added { amount: 2 }]);
        assert!(second.is_empty());
        assert_eq!(grain.state().value, 2);
    }

    #[tokio::test]
    async fn publish_reaches_bus_and_observers() {
        let ports = TestPorts::new();
        let observer = StubObserver::at(0);
        let follow = FollowUnit::new().with_observer(observer.clone());
        let mut grain = ports
            .activate_with_follow("c-1", GrainOptions::default(), follow)
            .await;
        grain
            .raise_event(CounterEvent::Added { amount: 9 }, None)
            .await
            .expect("raise");

        let published = ports.bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, "counter:c-1");
        let envelope = WireEnvelope::decode(published[0].0.clone()).expect("decode");
        assert_eq!(envelope.type_code, "Added");
        assert_eq!(envelope.base.version, 1);
        assert_eq!(observer.told.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn bus_failure_does_not_fail_raise() {
        let ports = TestPorts::new();
        ports.bus.fail_next(1).await;
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        assert!(grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise"));
        assert_eq!(grain.version(), 1);
    }

    #[tokio::test]
    async fn over_rejects_further_events() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        grain.over(OverType::None).await.expect("over");

        let err = grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrainError::StateIsOver { .. }));
        let stored = ports.snapshots.stored(&id()).await.expect("stored");
        assert!(stored.base.is_over);
        assert_eq!(ports.events.records(&id()).await.len(), 1);

        let err = grain.over(OverType::None).await.unwrap_err();
        assert!(matches!(err, GrainError::StateIsOver { .. }));
    }

    #[tokio::test]
    async fn over_on_saved_snapshot_persists_latest_flag() {
        let ports = TestPorts::new();
        let mut options = GrainOptions::default();
        options.snapshot.version_interval = 1;
        let mut grain = ports.activate("c-1", options.clone()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        let saved = ports.snapshots.stored(&id()).await.expect("saved at 1");
        assert!(!saved.base.is_latest);

        grain.over(OverType::None).await.expect("over");
        let stored = ports.snapshots.stored(&id()).await.expect("stored");
        assert!(stored.base.is_over);
        assert!(stored.base.is_latest);
        assert_eq!(ports.snapshots.insert_count().await, 1);
    }

    #[tokio::test]
    async fn over_with_deletion_waits_for_observers() {
        let ports = TestPorts::new();
        let observer = StubObserver::at(0);
        let follow = FollowUnit::new().with_observer(observer.clone());
        let mut grain = ports
            .activate_with_follow("c-1", GrainOptions::default(), follow)
            .await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");

        let err = grain.over(OverType::DeleteEvent).await.unwrap_err();
        assert!(matches!(
            err,
            GrainError::ObserverNotCompleted { version: 1, .. }
        ));
        assert!(!grain.snapshot().base.is_over);

        observer.set_version(1);
        grain.over(OverType::DeleteEvent).await.expect("over");
        assert!(ports.events.records(&id()).await.is_empty());
    }

    #[tokio::test]
    async fn over_delete_all_removes_snapshot() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        grain.over(OverType::DeleteAll).await.expect("over");
        assert!(ports.snapshots.stored(&id()).await.is_none());
        assert!(ports.events.records(&id()).await.is_empty());
    }

    #[tokio::test]
    async fn over_archiving_moves_events() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        grain.over(OverType::ArchivingEvent).await.expect("over");
        assert!(ports.events.records(&id()).await.is_empty());
        assert_eq!(ports.events.archived(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn deactivate_saves_latest_snapshot() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        grain.deactivate().await.expect("deactivate");

        let stored = ports.snapshots.stored(&id()).await.expect("stored");
        assert_eq!(stored.base.version, 1);
        assert!(stored.base.is_latest);

        let reactivated = ports.activate("c-1", GrainOptions::default()).await;
        assert_eq!(reactivated.version(), 1);
        assert_eq!(reactivated.saved_version(), 1);
    }

    #[tokio::test]
    async fn raise_after_latest_save_clears_flag() {
        let ports = TestPorts::new();
        let mut grain = ports.activate("c-1", GrainOptions::default()).await;
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        grain.deactivate().await.expect("deactivate");
        grain
            .raise_event(CounterEvent::Incremented, None)
            .await
            .expect("raise");

        let stored = ports.snapshots.stored(&id()).await.expect("stored");
        assert!(!stored.base.is_latest);
        drop(grain);
        let reactivated = ports.activate("c-1", GrainOptions::default()).await;
        assert_eq!(reactivated.version(), 2);
    }
}
