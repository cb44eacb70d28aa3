//! In-memory implementations of every storage and bus port.
//!
//! Useful for tests and single-process deployments that do not need
//! durability. Each store also exposes inspection helpers and fault
//! injection so failure paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::aggregate::AggregateId;
use crate::archive::ArchiveBrief;
use crate::error::StoreError;
use crate::event::EventRecord;
use crate::ports::{ArchiveStore, EventBus, EventStore, ObserverSnapshotStore, SnapshotStore};
use crate::snapshot::{ObserverSnapshot, Snapshot};

fn injected(what: &str) -> StoreError {
    StoreError::backend(format!("injected {what} failure"))
}

/// Decrement a pending fault counter; `true` when a fault fires.
fn take_fault(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

struct EventLog<K> {
    streams: HashMap<K, BTreeMap<i64, EventRecord<K>>>,
    archived: HashMap<K, Vec<EventRecord<K>>>,
    fail_appends: usize,
    fail_transactional: usize,
    fail_deletes: usize,
    transactional_appends: usize,
}

/// Event log held in a `HashMap` of version-ordered maps.
pub struct InMemoryEventStore<K: AggregateId> {
    inner: Mutex<EventLog<K>>,
}

impl<K: AggregateId> InMemoryEventStore<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventLog {
                streams: HashMap::new(),
                archived: HashMap::new(),
                fail_appends: 0,
                fail_transactional: 0,
                fail_deletes: 0,
                transactional_appends: 0,
            }),
        }
    }

    /// Every live event of `state_id`, ascending by version.
    pub async fn records(&self, state_id: &K) -> Vec<EventRecord<K>> {
        let log = self.inner.lock().await;
        log.streams
            .get(state_id)
            .map(|stream| stream.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Events moved out of the live log by `archive_range`.
    pub async fn archived(&self, state_id: &K) -> Vec<EventRecord<K>> {
        let log = self.inner.lock().await;
        log.archived.get(state_id).cloned().unwrap_or_default()
    }

    /// Number of successful batch appends.
    pub async fn transactional_appends(&self) -> usize {
        self.inner.lock().await.transactional_appends
    }

    /// Fail the next `n` single-event appends.
    pub async fn fail_next_appends(&self, n: usize) {
        self.inner.lock().await.fail_appends = n;
    }

    /// Fail the next `n` batch appends.
    pub async fn fail_next_transactional(&self, n: usize) {
        self.inner.lock().await.fail_transactional = n;
    }

    /// Fail the next `n` tail deletions.
    pub async fn fail_next_deletes(&self, n: usize) {
        self.inner.lock().await.fail_deletes = n;
    }
}

impl<K: AggregateId> Default for InMemoryEventStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId> std::fmt::Debug for InMemoryEventStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId> EventStore<K> for InMemoryEventStore<K> {
    async fn append(&self, record: &EventRecord<K>) -> Result<bool, StoreError> {
        let mut log = self.inner.lock().await;
        if take_fault(&mut log.fail_appends) {
            return Err(injected("append"));
        }
        let stream = log.streams.entry(record.state_id.clone()).or_default();
        if stream.values().any(|r| r.unique_id == record.unique_id) {
            return Ok(false);
        }
        if stream.contains_key(&record.base.version) {
            return Err(StoreError::Conflict(format!(
                "version {} of `{}` already written",
                record.base.version, record.state_id
            )));
        }
        stream.insert(record.base.version, record.clone());
        Ok(true)
    }

    async fn append_transactional(&self, records: &[EventRecord<K>]) -> Result<(), StoreError> {
        let mut log = self.inner.lock().await;
        if take_fault(&mut log.fail_transactional) {
            return Err(injected("transactional append"));
        }

        // Validate the whole batch before touching the log.
        let mut seen_versions: HashMap<&K, Vec<i64>> = HashMap::new();
        let mut seen_uids: HashMap<&K, Vec<&str>> = HashMap::new();
        for record in records {
            let versions = seen_versions.entry(&record.state_id).or_default();
            let uids = seen_uids.entry(&record.state_id).or_default();
            let existing = log.streams.get(&record.state_id);
            let version_taken = versions.contains(&record.base.version)
                || existing.is_some_and(|s| s.contains_key(&record.base.version));
            if version_taken {
                return Err(StoreError::Conflict(format!(
                    "version {} of `{}` already written",
                    record.base.version, record.state_id
                )));
            }
            let uid_taken = uids.contains(&record.unique_id.as_str())
                || existing.is_some_and(|s| s.values().any(|r| r.unique_id == record.unique_id));
            if uid_taken {
                return Err(StoreError::Conflict(format!(
                    "unique id `{}` of `{}` already written",
                    record.unique_id, record.state_id
                )));
            }
            versions.push(record.base.version);
            uids.push(&record.unique_id);
        }

        for record in records {
            log.streams
                .entry(record.state_id.clone())
                .or_default()
                .insert(record.base.version, record.clone());
        }
        log.transactional_appends += 1;
        Ok(())
    }

    async fn get_range(
        &self,
        state_id: &K,
        from_timestamp: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<EventRecord<K>>, StoreError> {
        let log = self.inner.lock().await;
        let Some(stream) = log.streams.get(state_id) else {
            return Ok(Vec::new());
        };
        if from_version > to_version {
            return Ok(Vec::new());
        }
        Ok(stream
            .range(from_version..=to_version)
            .map(|(_, r)| r)
            .filter(|r| r.base.timestamp >= from_timestamp)
            .cloned()
            .collect())
    }

    async fn delete_range(
        &self,
        state_id: &K,
        to_version: i64,
        _start_timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut log = self.inner.lock().await;
        if let Some(stream) = log.streams.get_mut(state_id) {
            stream.retain(|version, _| *version > to_version);
        }
        Ok(())
    }

    async fn archive_range(
        &self,
        state_id: &K,
        to_version: i64,
        _start_timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut log = self.inner.lock().await;
        let Some(stream) = log.streams.get_mut(state_id) else {
            return Ok(());
        };
        let kept = stream.split_off(&(to_version + 1));
        let moved = std::mem::replace(stream, kept);
        log.archived
            .entry(state_id.clone())
            .or_default()
            .extend(moved.into_values());
        Ok(())
    }

    async fn delete_after(
        &self,
        state_id: &K,
        from_version: i64,
        _start_timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut log = self.inner.lock().await;
        if take_fault(&mut log.fail_deletes) {
            return Err(injected("delete"));
        }
        if let Some(stream) = log.streams.get_mut(state_id) {
            stream.retain(|version, _| *version < from_version);
        }
        Ok(())
    }
}

struct SnapshotTable<K, S> {
    rows: HashMap<K, Snapshot<K, S>>,
    inserts: usize,
    updates: usize,
    fail_writes: usize,
}

/// Snapshot store keeping one row per aggregate.
pub struct InMemorySnapshotStore<K: AggregateId, S> {
    inner: Mutex<SnapshotTable<K, S>>,
}

impl<K: AggregateId, S: Clone + Send + Sync> InMemorySnapshotStore<K, S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SnapshotTable {
                rows: HashMap::new(),
                inserts: 0,
                updates: 0,
                fail_writes: 0,
            }),
        }
    }

    /// The stored snapshot of `state_id`.
    pub async fn stored(&self, state_id: &K) -> Option<Snapshot<K, S>> {
        self.inner.lock().await.rows.get(state_id).cloned()
    }

    pub async fn insert_count(&self) -> usize {
        self.inner.lock().await.inserts
    }

    pub async fn update_count(&self) -> usize {
        self.inner.lock().await.updates
    }

    /// Fail the next `n` inserts or full updates.
    pub async fn fail_next_writes(&self, n: usize) {
        self.inner.lock().await.fail_writes = n;
    }

    async fn modify(&self, state_id: &K, f: impl FnOnce(&mut Snapshot<K, S>) + Send) {
        if let Some(row) = self.inner.lock().await.rows.get_mut(state_id) {
            f(row);
        }
    }
}

impl<K: AggregateId, S: Clone + Send + Sync> Default for InMemorySnapshotStore<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId, S> std::fmt::Debug for InMemorySnapshotStore<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySnapshotStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId, S: Clone + Send + Sync + 'static> SnapshotStore<K, S>
    for InMemorySnapshotStore<K, S>
{
    async fn get(&self, state_id: &K) -> Result<Option<Snapshot<K, S>>, StoreError> {
        Ok(self.stored(state_id).await)
    }

    async fn insert(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        if take_fault(&mut table.fail_writes) {
            return Err(injected("snapshot insert"));
        }
        table
            .rows
            .insert(snapshot.base.state_id.clone(), snapshot.clone());
        table.inserts += 1;
        Ok(())
    }

    async fn update(&self, snapshot: &Snapshot<K, S>) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        if take_fault(&mut table.fail_writes) {
            return Err(injected("snapshot update"));
        }
        table
            .rows
            .insert(snapshot.base.state_id.clone(), snapshot.clone());
        table.updates += 1;
        Ok(())
    }

    async fn delete(&self, state_id: &K) -> Result<(), StoreError> {
        self.inner.lock().await.rows.remove(state_id);
        Ok(())
    }

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StoreError> {
        self.modify(state_id, |row| row.base.is_over = is_over).await;
        Ok(())
    }

    async fn update_is_latest(&self, state_id: &K, is_latest: bool) -> Result<(), StoreError> {
        self.modify(state_id, |row| row.base.is_latest = is_latest)
            .await;
        Ok(())
    }

    async fn update_latest_min_event_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        self.modify(state_id, |row| {
            row.base.latest_min_event_timestamp = timestamp
        })
        .await;
        Ok(())
    }

    async fn update_start_timestamp(
        &self,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        self.modify(state_id, |row| row.base.start_timestamp = timestamp)
            .await;
        Ok(())
    }
}

struct ArchiveTable<K, S> {
    briefs: HashMap<K, Vec<ArchiveBrief>>,
    snapshots: HashMap<String, Snapshot<K, S>>,
    over: HashMap<K, bool>,
}

/// Archive store keyed by brief id.
pub struct InMemoryArchiveStore<K: AggregateId, S> {
    inner: Mutex<ArchiveTable<K, S>>,
}

impl<K: AggregateId, S: Clone + Send + Sync> InMemoryArchiveStore<K, S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArchiveTable {
                briefs: HashMap::new(),
                snapshots: HashMap::new(),
                over: HashMap::new(),
            }),
        }
    }

    /// Whether `over` was recorded for `state_id`.
    pub async fn is_over(&self, state_id: &K) -> bool {
        self.inner
            .lock()
            .await
            .over
            .get(state_id)
            .copied()
            .unwrap_or(false)
    }
}

impl<K: AggregateId, S: Clone + Send + Sync> Default for InMemoryArchiveStore<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId, S> std::fmt::Debug for InMemoryArchiveStore<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryArchiveStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId, S: Clone + Send + Sync + 'static> ArchiveStore<K, S>
    for InMemoryArchiveStore<K, S>
{
    async fn get_brief_list(&self, state_id: &K) -> Result<Vec<ArchiveBrief>, StoreError> {
        let table = self.inner.lock().await;
        Ok(table.briefs.get(state_id).cloned().unwrap_or_default())
    }

    async fn get_latest_brief(&self, state_id: &K) -> Result<Option<ArchiveBrief>, StoreError> {
        let table = self.inner.lock().await;
        Ok(table
            .briefs
            .get(state_id)
            .and_then(|briefs| briefs.iter().max_by_key(|b| b.index))
            .cloned())
    }

    async fn get_by_id(&self, brief_id: &str) -> Result<Option<Snapshot<K, S>>, StoreError> {
        Ok(self.inner.lock().await.snapshots.get(brief_id).cloned())
    }

    async fn insert(
        &self,
        brief: &ArchiveBrief,
        snapshot: &Snapshot<K, S>,
    ) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        let briefs = table
            .briefs
            .entry(snapshot.base.state_id.clone())
            .or_default();
        briefs.retain(|b| b.id != brief.id);
        briefs.push(brief.clone());
        table.snapshots.insert(brief.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, state_id: &K, brief_id: &str) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        if let Some(briefs) = table.briefs.get_mut(state_id) {
            briefs.retain(|b| b.id != brief_id);
        }
        table.snapshots.remove(brief_id);
        Ok(())
    }

    async fn delete_all(&self, state_id: &K) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        if let Some(briefs) = table.briefs.remove(state_id) {
            for brief in briefs {
                table.snapshots.remove(&brief.id);
            }
        }
        Ok(())
    }

    async fn event_is_clear(&self, state_id: &K, brief_id: &str) -> Result<(), StoreError> {
        let mut table = self.inner.lock().await;
        let brief = table
            .briefs
            .get_mut(state_id)
            .and_then(|briefs| briefs.iter_mut().find(|b| b.id == brief_id))
            .ok_or_else(|| StoreError::NotFound(format!("archive brief `{brief_id}`")))?;
        brief.event_is_cleared = true;
        Ok(())
    }

    async fn over(&self, state_id: &K, is_over: bool) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .over
            .insert(state_id.clone(), is_over);
        Ok(())
    }
}

/// Observer checkpoints keyed by `(observer name, state_id)`.
pub struct InMemoryObserverSnapshotStore<K: AggregateId> {
    rows: Mutex<HashMap<(String, K), ObserverSnapshot<K>>>,
}

impl<K: AggregateId> InMemoryObserverSnapshotStore<K> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn stored(&self, name: &str, state_id: &K) -> Option<ObserverSnapshot<K>> {
        self.rows
            .lock()
            .await
            .get(&(name.to_owned(), state_id.clone()))
            .cloned()
    }
}

impl<K: AggregateId> Default for InMemoryObserverSnapshotStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId> std::fmt::Debug for InMemoryObserverSnapshotStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObserverSnapshotStore")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId> ObserverSnapshotStore<K> for InMemoryObserverSnapshotStore<K> {
    async fn get(
        &self,
        name: &str,
        state_id: &K,
    ) -> Result<Option<ObserverSnapshot<K>>, StoreError> {
        Ok(self.stored(name, state_id).await)
    }

    async fn insert(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .insert((name.to_owned(), snapshot.state_id.clone()), snapshot.clone());
        Ok(())
    }

    async fn update(&self, name: &str, snapshot: &ObserverSnapshot<K>) -> Result<(), StoreError> {
        self.insert(name, snapshot).await
    }

    async fn update_start_timestamp(
        &self,
        name: &str,
        state_id: &K,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        if let Some(row) = self
            .rows
            .lock()
            .await
            .get_mut(&(name.to_owned(), state_id.clone()))
        {
            row.start_timestamp = timestamp;
        }
        Ok(())
    }

    async fn delete(&self, name: &str, state_id: &K) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .remove(&(name.to_owned(), state_id.clone()));
        Ok(())
    }
}

/// Bus that records every published envelope.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    published: Mutex<Vec<(Bytes, String)>>,
    fail_next: Mutex<usize>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every published `(envelope, hash_key)` pair, in order.
    pub async fn published(&self) -> Vec<(Bytes, String)> {
        self.published.lock().await.clone()
    }

    /// Fail the next `n` publishes.
    pub async fn fail_next(&self, n: usize) {
        *self.fail_next.lock().await = n;
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, bytes: Bytes, hash_key: &str) -> Result<(), StoreError> {
        if take_fault(&mut *self.fail_next.lock().await) {
            return Err(injected("publish"));
        }
        self.published
            .lock()
            .await
            .push((bytes, hash_key.to_owned()));
        Ok(())
    }
}

/// Ties the type parameters of a full in-memory port set together.
#[derive(Debug)]
pub struct InMemoryPorts<K: AggregateId, S> {
    pub events: std::sync::Arc<InMemoryEventStore<K>>,
    pub snapshots: std::sync::Arc<InMemorySnapshotStore<K, S>>,
    pub archives: std::sync::Arc<InMemoryArchiveStore<K, S>>,
    pub observer_snapshots: std::sync::Arc<InMemoryObserverSnapshotStore<K>>,
    pub bus: std::sync::Arc<InMemoryEventBus>,
    _state: PhantomData<fn() -> S>,
}

impl<K: AggregateId, S: Clone + Send + Sync + 'static> InMemoryPorts<K, S> {
    pub fn new() -> Self {
        Self {
            events: Default::default(),
            snapshots: Default::default(),
            archives: Default::default(),
            observer_snapshots: Default::default(),
            bus: Default::default(),
            _state: PhantomData,
        }
    }
}

impl<K: AggregateId, S: Clone + Send + Sync + 'static> Default for InMemoryPorts<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId, S> Clone for InMemoryPorts<K, S> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
            archives: self.archives.clone(),
            observer_snapshots: self.observer_snapshots.clone(),
            bus: self.bus.clone(),
            _state: PhantomData,
        }
    }
}

impl<A: crate::aggregate::Aggregate> InMemoryPorts<A::Id, A> {
    /// Port handles for grains of `A`, publishing to the in-memory bus.
    pub fn grain_ports(&self) -> crate::ports::GrainPorts<A> {
        crate::ports::GrainPorts::new(
            self.events.clone(),
            self.snapshots.clone(),
            self.archives.clone(),
        )
        .with_bus(self.bus.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::ops::Deref;
    use std::sync::Arc;

    use super::InMemoryPorts;
    use crate::aggregate::test_fixtures::Counter;
    use crate::config::GrainOptions;
    use crate::follow::FollowUnit;
    use crate::grain::Grain;

    /// In-memory ports wired for the `Counter` fixture.
    pub(crate) struct TestPorts(InMemoryPorts<String, Counter>);

    impl TestPorts {
        pub(crate) fn new() -> Self {
            Self(InMemoryPorts::new())
        }

        pub(crate) async fn activate(&self, id: &str, options: GrainOptions) -> Grain<Counter> {
            self.activate_with_follow(id, options, FollowUnit::new())
                .await
        }

        pub(crate) async fn activate_with_follow(
            &self,
            id: &str,
            options: GrainOptions,
            follow: FollowUnit<String>,
        ) -> Grain<Counter> {
            Grain::activate(
                id.to_string(),
                self.0.grain_ports(),
                follow,
                Arc::new(options),
            )
            .await
            .expect("activation should succeed")
        }
    }

    impl Deref for TestPorts {
        type Target = InMemoryPorts<String, Counter>;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }
}
