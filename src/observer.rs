//! Observers: downstream consumers of one aggregate type's events, each
//! tracking its own version per aggregate.
//!
//! An [`ObserverGroup`] owns one actor per aggregate key. Every actor holds
//! an [`ObserverGrain`], which applies delivered envelopes in version
//! order, backfills gaps from the event store, and checkpoints its
//! [`ObserverSnapshot`] through the [`ObserverSnapshotStore`] port.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::Instrument;

use crate::aggregate::AggregateId;
use crate::codec::{EventRegistry, WireEnvelope};
use crate::config::ObserverOptions;
use crate::error::{BoxError, GrainError};
use crate::event::{EventBase, FullyEvent};
use crate::follow::ObserverUnit;
use crate::ports::{EventStore, ObserverSnapshotStore};
use crate::snapshot::ObserverSnapshot;

/// Mailbox capacity of one observer actor.
const MAILBOX_CAPACITY: usize = 32;

/// User-supplied reaction to an aggregate type's events.
///
/// # Contract
///
/// - Events arrive in version order per aggregate, each at most once per
///   successful delivery. After a failure the same event may be delivered
///   again, so side effects should be idempotent.
/// - Event types without a decoder in the [`EventRegistry`] are skipped;
///   the observer's version still advances past them.
#[async_trait]
pub trait ObserverHandler<K: AggregateId>: Send + Sync + 'static {
    /// Observer name, the checkpoint key in the snapshot store.
    const NAME: &'static str;

    type Event: Send + Sync + 'static;

    async fn on_event(&mut self, event: &FullyEvent<K, Self::Event>) -> Result<(), BoxError>;
}

/// Everything an observer grain shares with its siblings.
pub struct ObserverPorts<K: AggregateId, E> {
    pub registry: Arc<EventRegistry<E>>,
    pub events: Arc<dyn EventStore<K>>,
    pub snapshots: Arc<dyn ObserverSnapshotStore<K>>,
    pub options: Arc<ObserverOptions>,
}

impl<K: AggregateId, E> Clone for ObserverPorts<K, E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            snapshots: Arc::clone(&self.snapshots),
            options: Arc::clone(&self.options),
        }
    }
}

impl<K: AggregateId, E> std::fmt::Debug for ObserverPorts<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverPorts")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// One observer's view of one aggregate.
pub struct ObserverGrain<K: AggregateId, H: ObserverHandler<K>> {
    state_id: K,
    snapshot: ObserverSnapshot<K>,
    saved_version: i64,
    persisted: bool,
    handler: H,
    ports: ObserverPorts<K, H::Event>,
}

impl<K: AggregateId, H: ObserverHandler<K>> ObserverGrain<K, H> {
    /// Load the checkpoint of `state_id`, or start at version 0.
    pub async fn activate(
        state_id: K,
        handler: H,
        ports: ObserverPorts<K, H::Event>,
    ) -> Result<Self, GrainError> {
        let stored = ports.snapshots.get(H::NAME, &state_id).await?;
        let persisted = stored.is_some();
        let mut snapshot = stored.unwrap_or_else(|| ObserverSnapshot::new(state_id.clone()));
        snapshot.doing_version = snapshot.version;

        tracing::debug!(
            observer = H::NAME,
            state_id = %state_id,
            version = snapshot.version,
            "observer activated"
        );
        Ok(Self {
            state_id,
            saved_version: snapshot.version,
            snapshot,
            persisted,
            handler,
            ports,
        })
    }

    /// Deliver one envelope.
    ///
    /// Versions at or below the current one are ignored. A version further
    /// ahead first backfills the gap from the event store.
    ///
    /// # Errors
    ///
    /// [`GrainError::EventVersionUnordered`] if the gap cannot be closed.
    pub async fn tell(&mut self, envelope: &WireEnvelope) -> Result<(), GrainError> {
        let version = envelope.base.version;
        if version <= self.snapshot.version {
            return Ok(());
        }
        if version > self.snapshot.version + 1 {
            self.backfill(version - 1).await?;
        }

        let expected = self.snapshot.version + 1;
        if version != expected {
            tracing::error!(
                observer = H::NAME,
                state_id = %self.state_id,
                expected,
                actual = version,
                "observer gap could not be backfilled"
            );
            return Err(GrainError::EventVersionUnordered {
                state_id: self.state_id.to_string(),
                expected,
                actual: version,
            });
        }

        self.apply(&envelope.type_code, &envelope.event_bytes, envelope.base)
            .await?;
        self.save_if_due().await
    }

    /// Apply everything the event store holds up to `to_version`.
    async fn backfill(&mut self, to_version: i64) -> Result<(), GrainError> {
        let page = self.ports.options.events_per_read.max(1);
        let from_version = self.snapshot.version + 1;
        while self.snapshot.version < to_version {
            let from = self.snapshot.version + 1;
            let to = from.saturating_add(page - 1).min(to_version);
            let records = self
                .ports
                .events
                .get_range(&self.state_id, 0, from, to)
                .await?;
            if records.is_empty() {
                break;
            }
            for record in &records {
                let expected = self.snapshot.version + 1;
                if record.base.version != expected {
                    return Err(GrainError::EventVersionUnordered {
                        state_id: self.state_id.to_string(),
                        expected,
                        actual: record.base.version,
                    });
                }
                self.apply(&record.type_code, &record.payload, record.base)
                    .await?;
            }
        }
        tracing::debug!(
            observer = H::NAME,
            state_id = %self.state_id,
            from_version,
            to_version = self.snapshot.version,
            "observer backfilled"
        );
        Ok(())
    }

    async fn apply(
        &mut self,
        type_code: &str,
        payload: &[u8],
        base: EventBase,
    ) -> Result<(), GrainError> {
        let start_timestamp = self.snapshot.start_timestamp;
        if !self.ports.registry.contains(type_code) {
            tracing::trace!(
                observer = H::NAME,
                state_id = %self.state_id,
                type_code,
                version = base.version,
                "no decoder registered, skipping"
            );
            self.snapshot.full_update_version(&base);
            return Ok(());
        }

        let event = self.ports.registry.decode(type_code, payload)?;
        let fully = FullyEvent {
            state_id: self.state_id.clone(),
            base,
            event,
        };
        self.snapshot.doing_version = base.version;
        if let Err(e) = self.handler.on_event(&fully).await {
            self.snapshot.doing_version = self.snapshot.version;
            tracing::error!(
                observer = H::NAME,
                state_id = %self.state_id,
                version = base.version,
                error = %e,
                "observer handler failed"
            );
            return Err(GrainError::Handler(e));
        }
        self.snapshot.full_update_version(&base);

        if self.persisted && start_timestamp != 0 && self.snapshot.start_timestamp < start_timestamp {
            self.ports
                .snapshots
                .update_start_timestamp(H::NAME, &self.state_id, self.snapshot.start_timestamp)
                .await?;
        }
        Ok(())
    }

    async fn save_if_due(&mut self) -> Result<(), GrainError> {
        let interval = self.ports.options.snapshot_version_interval.max(1);
        if self.snapshot.version - self.saved_version >= interval {
            self.save().await?;
        }
        Ok(())
    }

    async fn save(&mut self) -> Result<(), GrainError> {
        let result = if self.persisted {
            self.ports.snapshots.update(H::NAME, &self.snapshot).await
        } else {
            self.ports.snapshots.insert(H::NAME, &self.snapshot).await
        };
        if let Err(e) = result {
            tracing::error!(
                observer = H::NAME,
                state_id = %self.state_id,
                version = self.snapshot.version,
                error = %e,
                "observer snapshot save failed"
            );
            return Err(e.into());
        }
        self.persisted = true;
        self.saved_version = self.snapshot.version;
        Ok(())
    }

    /// Durable version, saving first if anything below `compare_version`
    /// is still unsaved.
    pub async fn get_and_save_version(&mut self, compare_version: i64) -> Result<i64, GrainError> {
        if self.saved_version < self.snapshot.version && self.saved_version < compare_version {
            self.save().await?;
        }
        Ok(self.saved_version)
    }

    /// Apply a drained batch of concurrent deliveries.
    ///
    /// The highest version represents the batch and is the only request
    /// that can fail; the rest are resolved at once as covered by it. The
    /// whole run is bounded by `batch_timeout`.
    pub(crate) async fn tell_concurrent(&mut self, mut batch: Vec<PendingTell>) {
        batch.sort_by_key(|p| p.envelope.base.version);
        let Some(representative) = batch.pop() else {
            return;
        };
        let mut run: Vec<WireEnvelope> = Vec::with_capacity(batch.len() + 1);
        for pending in batch {
            let _ = pending.reply.send(Ok(()));
            run.push(pending.envelope);
        }
        run.push(representative.envelope);

        let timeout = self.ports.options.batch_timeout;
        let result = match tokio::time::timeout(timeout, self.tell_run(&run)).await {
            Ok(result) => result,
            Err(_) => {
                self.snapshot.doing_version = self.snapshot.version;
                tracing::warn!(
                    observer = H::NAME,
                    state_id = %self.state_id,
                    version = self.snapshot.version,
                    batch_size = run.len(),
                    "observer batch timed out"
                );
                Err(GrainError::BatchTimeout {
                    version: self.snapshot.version,
                })
            }
        };
        let _ = representative.reply.send(result);
    }

    async fn tell_run(&mut self, run: &[WireEnvelope]) -> Result<(), GrainError> {
        for envelope in run {
            self.tell(envelope).await?;
        }
        Ok(())
    }

    /// Persist unsaved progress before the grain is dropped.
    pub async fn deactivate(&mut self) -> Result<(), GrainError> {
        if self.snapshot.version > self.saved_version {
            self.save().await?;
        }
        Ok(())
    }

    pub fn state_id(&self) -> &K {
        &self.state_id
    }

    pub fn snapshot(&self) -> &ObserverSnapshot<K> {
        &self.snapshot
    }

    pub fn saved_version(&self) -> i64 {
        self.saved_version
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

/// A concurrent delivery waiting for its batch.
pub(crate) struct PendingTell {
    envelope: WireEnvelope,
    reply: oneshot::Sender<Result<(), GrainError>>,
}

enum ObserverMessage<K> {
    Tell {
        envelope: WireEnvelope,
        reply: oneshot::Sender<Result<(), GrainError>>,
    },
    GetAndSaveVersion {
        compare_version: i64,
        reply: oneshot::Sender<Result<i64, GrainError>>,
    },
    GetSnapshot {
        reply: oneshot::Sender<ObserverSnapshot<K>>,
    },
}

async fn run_observer<K: AggregateId, H: ObserverHandler<K>>(
    mut grain: ObserverGrain<K, H>,
    mut rx: mpsc::Receiver<ObserverMessage<K>>,
    mut batch_rx: mpsc::Receiver<PendingTell>,
) {
    let max_batch_size = grain.ports.options.max_batch_size.max(1);
    let idle_timeout = grain.ports.options.idle_timeout;
    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(ObserverMessage::Tell { envelope, reply }) => {
                    let _ = reply.send(grain.tell(&envelope).await);
                }
                Some(ObserverMessage::GetAndSaveVersion { compare_version, reply }) => {
                    let _ = reply.send(grain.get_and_save_version(compare_version).await);
                }
                Some(ObserverMessage::GetSnapshot { reply }) => {
                    let _ = reply.send(grain.snapshot().clone());
                }
                None => break,
            },

            Some(first) = batch_rx.recv() => {
                let mut batch = vec![first];
                while batch.len() < max_batch_size
                    && let Ok(next) = batch_rx.try_recv()
                {
                    batch.push(next);
                }
                grain.tell_concurrent(batch).await;
            },

            _ = tokio::time::sleep(idle_timeout) => {
                tracing::debug!(version = grain.snapshot().version, "observer idle, shutting down");
                break;
            },
        }
    }

    if let Err(e) = grain.deactivate().await {
        tracing::error!(error = %e, "observer deactivation failed");
    }
}

struct ObserverHandle<K> {
    sender: mpsc::Sender<ObserverMessage<K>>,
    batch_sender: mpsc::Sender<PendingTell>,
    concurrent: bool,
}

impl<K> Clone for ObserverHandle<K> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            batch_sender: self.batch_sender.clone(),
            concurrent: self.concurrent,
        }
    }
}

impl<K: AggregateId> ObserverHandle<K> {
    fn spawn<H: ObserverHandler<K>>(grain: ObserverGrain<K, H>) -> Self {
        let options = Arc::clone(&grain.ports.options);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(options.channel_capacity.max(1));
        let span = tracing::info_span!(
            "observer",
            observer = H::NAME,
            state_id = %grain.state_id
        );
        tokio::spawn(run_observer(grain, rx, batch_rx).instrument(span));
        Self {
            sender: tx,
            batch_sender: batch_tx,
            concurrent: options.concurrent,
        }
    }

    async fn tell(&self, envelope: WireEnvelope) -> Result<(), GrainError> {
        let (reply, rx) = oneshot::channel();
        if self.concurrent {
            self.batch_sender
                .try_send(PendingTell { envelope, reply })
                .map_err(|e| match e {
                    TrySendError::Full(_) => GrainError::ChannelUnavailable("observer batch channel full"),
                    TrySendError::Closed(_) => GrainError::ActorGone,
                })?;
        } else {
            self.sender
                .send(ObserverMessage::Tell { envelope, reply })
                .await
                .map_err(|_| GrainError::ActorGone)?;
        }
        rx.await.map_err(|_| GrainError::ActorGone)?
    }

    async fn get_and_save_version(&self, compare_version: i64) -> Result<i64, GrainError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ObserverMessage::GetAndSaveVersion {
                compare_version,
                reply,
            })
            .await
            .map_err(|_| GrainError::ActorGone)?;
        rx.await.map_err(|_| GrainError::ActorGone)?
    }

    async fn snapshot(&self) -> Result<ObserverSnapshot<K>, GrainError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ObserverMessage::GetSnapshot { reply })
            .await
            .map_err(|_| GrainError::ActorGone)?;
        rx.await.map_err(|_| GrainError::ActorGone)
    }

    fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

type HandlerFactory<K, H> = Arc<dyn Fn(&K) -> H + Send + Sync>;

/// All observer actors of one observer, keyed by aggregate id.
///
/// Register it with a grain's [`FollowUnit`](crate::follow::FollowUnit)
/// to receive every raised event.
pub struct ObserverGroup<K: AggregateId, H: ObserverHandler<K>> {
    factory: HandlerFactory<K, H>,
    ports: ObserverPorts<K, H::Event>,
    handles: RwLock<HashMap<K, ObserverHandle<K>>>,
}

impl<K: AggregateId, H: ObserverHandler<K>> ObserverGroup<K, H> {
    /// `factory` builds the handler for a newly activated aggregate key.
    pub fn new(
        factory: impl Fn(&K) -> H + Send + Sync + 'static,
        ports: ObserverPorts<K, H::Event>,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            ports,
            handles: RwLock::new(HashMap::new()),
        }
    }

    async fn handle(&self, state_id: &K) -> Result<ObserverHandle<K>, GrainError> {
        // Fast path: check cache with read lock.
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(state_id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Activation happens under the write lock so a key never gets two
        // live actors.
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(state_id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        // Actors that exited on idle leave dead handles behind.
        handles.retain(|_, handle| handle.is_alive());
        let handler = (self.factory)(state_id);
        let grain = ObserverGrain::activate(state_id.clone(), handler, self.ports.clone()).await?;
        let handle = ObserverHandle::spawn(grain);
        handles.insert(state_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Current checkpoint of the observer for `state_id`.
    pub async fn snapshot(&self, state_id: &K) -> Result<ObserverSnapshot<K>, GrainError> {
        self.handle(state_id).await?.snapshot().await
    }

    /// Drop every cached actor; each saves its progress on the way out.
    pub async fn clear(&self) {
        self.handles.write().await.clear();
    }

    /// Number of cached actors, live or not yet pruned.
    pub async fn cached(&self) -> usize {
        self.handles.read().await.len()
    }
}

impl<K: AggregateId, H: ObserverHandler<K>> std::fmt::Debug for ObserverGroup<K, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverGroup")
            .field("observer", &H::NAME)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: AggregateId, H: ObserverHandler<K>> ObserverUnit<K> for ObserverGroup<K, H> {
    fn name(&self) -> &str {
        H::NAME
    }

    async fn tell(&self, state_id: &K, envelope: Bytes) -> Result<(), GrainError> {
        let envelope = WireEnvelope::decode(envelope)?;
        match self.handle(state_id).await?.tell(envelope.clone()).await {
            // The actor went idle between lookup and send; one retry
            // reactivates it.
            Err(GrainError::ActorGone) => self.handle(state_id).await?.tell(envelope).await,
            result => result,
        }
    }

    async fn get_and_save_version(
        &self,
        state_id: &K,
        compare_version: i64,
    ) -> Result<i64, GrainError> {
        match self
            .handle(state_id)
            .await?
            .get_and_save_version(compare_version)
            .await
        {
            Err(GrainError::ActorGone) => {
                self.handle(state_id)
                    .await?
                    .get_and_save_version(compare_version)
                    .await
            }
            result => result,
        }
    }
}
