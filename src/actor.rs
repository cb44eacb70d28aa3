//! Actor loop that owns a grain and serializes every operation on it.
//!
//! Each activated aggregate runs as one tokio task that exclusively owns
//! its [`Grain`]. Commands arrive over an `mpsc` mailbox; concurrent
//! submissions arrive over a second bounded channel and are coalesced by
//! the batcher. While a transaction is open, non-transactional writes are
//! parked and replayed in arrival order once the write permit frees.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_actor`] (starts the task for an activated grain).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::batch::{ConcurrentRaise, ExecuteResult};
use crate::command::CommandContext;
use crate::error::{ExecuteError, GrainError};
use crate::event::EventUid;
use crate::grain::{Grain, OverType};
use crate::snapshot::Snapshot;

/// Mailbox capacity of one actor.
const MAILBOX_CAPACITY: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, GrainError>>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Run a command; joins the open transaction when the context is
    /// tagged with its id.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Raise a prepared event outside any transaction.
    Raise {
        event: A::DomainEvent,
        uid: Option<EventUid>,
        reply: Reply<bool>,
    },

    /// Clone of the live snapshot.
    GetSnapshot {
        reply: oneshot::Sender<Snapshot<A::Id, A>>,
    },

    /// Open a transaction with a permit acquired by the handle.
    Begin {
        tx_id: String,
        permit: OwnedSemaphorePermit,
        reply: Reply<()>,
    },

    TxRaise {
        tx_id: String,
        event: A::DomainEvent,
        uid: Option<EventUid>,
        reply: Reply<()>,
    },

    Commit {
        tx_id: String,
        reply: Reply<()>,
    },

    Finish {
        tx_id: String,
        reply: Reply<()>,
    },

    Rollback {
        tx_id: String,
        reply: Reply<()>,
    },

    Over {
        over_type: OverType,
        reply: Reply<()>,
    },

    /// Deactivate and stop the loop.
    Shutdown { reply: Reply<()> },
}

impl<A: Aggregate> ActorMessage<A> {
    /// Non-transactional writes; these wait behind an open transaction.
    fn is_parked_write(&self) -> bool {
        match self {
            Self::Execute { ctx, .. } => ctx.transaction_id.is_none(),
            Self::Raise { .. } | Self::Over { .. } => true,
            _ => false,
        }
    }
}

/// Work waiting for the write permit.
enum Deferred<A: Aggregate> {
    Message(ActorMessage<A>),
    Batch(Vec<ConcurrentRaise<A>>),
}

/// Queued request for the write permit, kept across loop iterations so
/// parked work holds its place in the semaphore queue.
type PermitRequest = Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

async fn next_permit(
    request: &mut Option<PermitRequest>,
) -> Result<OwnedSemaphorePermit, AcquireError> {
    match request {
        Some(acquire) => acquire.await,
        None => std::future::pending().await,
    }
}

/// Runs the aggregate actor loop until shutdown, idle timeout, or until
/// every handle is dropped. The grain is deactivated on the way out.
async fn run_actor<A: Aggregate>(
    mut grain: Grain<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    mut batch_rx: mpsc::Receiver<ConcurrentRaise<A>>,
) {
    let idle_timeout = grain.options().idle_timeout;
    let max_batch_size = grain.options().batch.max_batch_size.max(1);
    let mut deferred: VecDeque<Deferred<A>> = VecDeque::new();
    let mut permit_request: Option<PermitRequest> = None;

    loop {
        let deadline = grain.transaction_deadline();
        let idle_enabled = grain.transaction_id().is_none() && deferred.is_empty();
        let waiting = !deferred.is_empty();
        if !waiting {
            permit_request = None;
        } else if permit_request.is_none() {
            permit_request = Some(Box::pin(grain.write_permit().acquire_owned()));
        }

        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(ActorMessage::Shutdown { reply }) => {
                    let _ = reply.send(grain.deactivate().await);
                    return;
                }
                Some(msg) => handle_message(&mut grain, msg, &mut deferred).await,
                // All handles dropped.
                None => break,
            },

            Some(first) = batch_rx.recv() => {
                let mut batch = vec![first];
                while batch.len() < max_batch_size
                    && let Ok(next) = batch_rx.try_recv()
                {
                    batch.push(next);
                }
                let untagged = grain.dispatch_tagged(batch);
                if !untagged.is_empty() {
                    run_or_defer_batch(&mut grain, untagged, &mut deferred).await;
                }
            },

            acquired = next_permit(&mut permit_request), if waiting => {
                permit_request = None;
                if let Ok(permit) = acquired {
                    drain_deferred(&mut grain, &mut deferred, permit).await;
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Err(e) = grain.rollback_if_timed_out().await {
                    tracing::error!(error = %e, "timed-out transaction could not be rolled back");
                }
            },

            _ = tokio::time::sleep(idle_timeout), if idle_enabled => {
                tracing::info!(aggregate_type = A::AGGREGATE_TYPE, "actor idle, shutting down");
                break;
            },
        }
    }

    if let Err(e) = grain.deactivate().await {
        tracing::error!(error = %e, "deactivation failed");
    }
}

async fn handle_message<A: Aggregate>(
    grain: &mut Grain<A>,
    msg: ActorMessage<A>,
    deferred: &mut VecDeque<Deferred<A>>,
) {
    if msg.is_parked_write() && (grain.transaction_id().is_some() || !deferred.is_empty()) {
        deferred.push_back(Deferred::Message(msg));
        return;
    }

    // If the receiver was dropped, the caller no longer cares about the
    // result. Silently discard it.
    match msg {
        ActorMessage::Execute { cmd, ctx, reply } => {
            let result = match ctx.transaction_id.clone() {
                Some(tx_id) => grain.raise_in_transaction(&tx_id, cmd, &ctx),
                None => grain.execute(cmd, &ctx).await,
            };
            let _ = reply.send(result);
        }
        ActorMessage::Raise { event, uid, reply } => {
            let _ = reply.send(grain.raise_event(event, uid).await);
        }
        ActorMessage::GetSnapshot { reply } => {
            let _ = reply.send(grain.snapshot().clone());
        }
        ActorMessage::Begin {
            tx_id,
            permit,
            reply,
        } => {
            let _ = reply.send(grain.begin_transaction_with_permit(tx_id, permit).await);
        }
        ActorMessage::TxRaise {
            tx_id,
            event,
            uid,
            reply,
        } => {
            let checked = grain.check_transaction(&tx_id).map(|_| ());
            let result = checked.and_then(|()| grain.tx_raise_event(event, uid));
            let _ = reply.send(result);
        }
        ActorMessage::Commit { tx_id, reply } => {
            let _ = reply.send(grain.commit_transaction(&tx_id).await);
        }
        ActorMessage::Finish { tx_id, reply } => {
            let _ = reply.send(grain.finish_transaction(&tx_id).await);
        }
        ActorMessage::Rollback { tx_id, reply } => {
            let _ = reply.send(grain.rollback_transaction(&tx_id).await);
        }
        ActorMessage::Over { over_type, reply } => {
            let _ = reply.send(grain.over(over_type).await);
        }
        ActorMessage::Shutdown { reply } => {
            // Handled by the loop before dispatch.
            let _ = reply.send(Ok(()));
        }
    }
}

async fn run_or_defer_batch<A: Aggregate>(
    grain: &mut Grain<A>,
    group: Vec<ConcurrentRaise<A>>,
    deferred: &mut VecDeque<Deferred<A>>,
) {
    if deferred.is_empty()
        && grain.transaction_id().is_none()
        && let Ok(permit) = grain.write_permit().try_acquire_owned()
    {
        grain.run_auto_batch(group, permit).await;
        return;
    }
    deferred.push_back(Deferred::Batch(group));
}

/// Replay parked work in arrival order while holding the write permit.
async fn drain_deferred<A: Aggregate>(
    grain: &mut Grain<A>,
    deferred: &mut VecDeque<Deferred<A>>,
    mut permit: OwnedSemaphorePermit,
) {
    while let Some(item) = deferred.pop_front() {
        match item {
            Deferred::Message(msg) => {
                // The permit rules out an open transaction, so nothing parks.
                handle_message(grain, msg, &mut VecDeque::new()).await;
            }
            Deferred::Batch(group) => {
                grain.run_auto_batch(group, permit).await;
                match grain.write_permit().try_acquire_owned() {
                    Ok(next) => permit = next,
                    Err(_) => return,
                }
            }
        }
    }
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor task over bounded channels.
pub struct AggregateHandle<A: Aggregate> {
    state_id: A::Id,
    sender: mpsc::Sender<ActorMessage<A>>,
    batch_sender: mpsc::Sender<ConcurrentRaise<A>>,
    write_permit: Arc<Semaphore>,
    max_wait: Duration,
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            state_id: self.state_id.clone(),
            sender: self.sender.clone(),
            batch_sender: self.batch_sender.clone(),
            write_permit: Arc::clone(&self.write_permit),
            max_wait: self.max_wait,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("state_id", &self.state_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ActorMessage<A>,
    ) -> Result<T, GrainError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| GrainError::ActorGone)?;
        rx.await.map_err(|_| GrainError::ActorGone)?
    }

    pub fn state_id(&self) -> &A::Id {
        &self.state_id
    }

    /// Send a command to the aggregate and wait for the result.
    ///
    /// Returns the domain events that were appended. A context tagged
    /// with the open transaction's id raises into that transaction
    /// instead.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Grain`] -- persistence failed or the actor exited.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute { cmd, ctx, reply: tx })
            .await
            .map_err(|_| ExecuteError::Grain(GrainError::ActorGone))?;
        rx.await
            .map_err(|_| ExecuteError::Grain(GrainError::ActorGone))?
    }

    /// Submit a command to the concurrency batcher.
    ///
    /// Untagged submissions that arrive together are committed as one
    /// transactional append.
    ///
    /// # Errors
    ///
    /// [`GrainError::ChannelUnavailable`] when the batch channel is full or
    /// closed; the submission is not queued.
    pub async fn concurrent_execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (request, rx) = ConcurrentRaise::new(cmd, ctx);
        self.batch_sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => GrainError::ChannelUnavailable("batch channel full"),
            TrySendError::Closed(_) => GrainError::ChannelUnavailable("batch channel closed"),
        })?;
        rx.await
            .map_err(|_| ExecuteError::Grain(GrainError::ActorGone))?
    }

    /// Raise a prepared event. See [`Grain::raise_event`].
    pub async fn raise(&self, event: A::DomainEvent, uid: Option<EventUid>) -> Result<bool, GrainError> {
        self.request(|reply| ActorMessage::Raise { event, uid, reply })
            .await
    }

    /// A clone of the live snapshot.
    pub async fn snapshot(&self) -> Result<Snapshot<A::Id, A>, GrainError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetSnapshot { reply: tx })
            .await
            .map_err(|_| GrainError::ActorGone)?;
        rx.await.map_err(|_| GrainError::ActorGone)
    }

    /// A clone of the current aggregate state.
    pub async fn state(&self) -> Result<A, GrainError> {
        Ok(self.snapshot().await?.state)
    }

    /// Open a transaction.
    ///
    /// Waits up to `transaction.max_wait` for the write permit.
    ///
    /// # Errors
    ///
    /// [`GrainError::BeginTransactionTimeout`] if the permit did not free
    /// in time.
    pub async fn begin_transaction(&self, tx_id: impl Into<String>) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        let acquire = Arc::clone(&self.write_permit).acquire_owned();
        let permit = match tokio::time::timeout(self.max_wait, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GrainError::ActorGone),
            Err(_) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    transaction_id = %tx_id,
                    "timed out waiting for write permit"
                );
                return Err(GrainError::BeginTransactionTimeout);
            }
        };
        self.request(|reply| ActorMessage::Begin {
            tx_id,
            permit,
            reply,
        })
        .await
    }

    pub async fn tx_raise(
        &self,
        tx_id: impl Into<String>,
        event: A::DomainEvent,
        uid: Option<EventUid>,
    ) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        self.request(|reply| ActorMessage::TxRaise {
            tx_id,
            event,
            uid,
            reply,
        })
        .await
    }

    pub async fn commit(&self, tx_id: impl Into<String>) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        self.request(|reply| ActorMessage::Commit { tx_id, reply })
            .await
    }

    pub async fn finish(&self, tx_id: impl Into<String>) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        self.request(|reply| ActorMessage::Finish { tx_id, reply })
            .await
    }

    pub async fn rollback(&self, tx_id: impl Into<String>) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        self.request(|reply| ActorMessage::Rollback { tx_id, reply })
            .await
    }

    /// Terminally close the aggregate. See [`Grain::over`].
    pub async fn over(&self, over_type: OverType) -> Result<(), GrainError> {
        self.request(|reply| ActorMessage::Over { over_type, reply })
            .await
    }

    /// Deactivate the grain and stop its actor.
    pub async fn shutdown(&self) -> Result<(), GrainError> {
        self.request(|reply| ActorMessage::Shutdown { reply }).await
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` once the actor has exited (idle timeout or
    /// shutdown). The store uses this to evict stale handles and
    /// re-activate on the next `get`.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Start the actor task for an activated grain.
///
/// Must be called from within a tokio runtime.
pub fn spawn_actor<A: Aggregate>(grain: Grain<A>) -> AggregateHandle<A> {
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(MAILBOX_CAPACITY);
    let (batch_tx, batch_rx) = mpsc::channel(grain.options().batch.channel_capacity.max(1));
    let state_id = grain.state_id().clone();
    let handle = AggregateHandle {
        state_id: state_id.clone(),
        sender: tx,
        batch_sender: batch_tx,
        write_permit: grain.write_permit(),
        max_wait: grain.options().transaction.max_wait,
    };

    let span = tracing::info_span!(
        "grain",
        aggregate_type = A::AGGREGATE_TYPE,
        state_id = %state_id
    );
    tokio::spawn(run_actor(grain, rx, batch_rx).instrument(span));
    handle
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterError, CounterEvent};
    use crate::config::GrainOptions;
    use crate::follow::FollowUnit;
    use crate::memory::InMemoryPorts;

    type Ports = InMemoryPorts<String, Counter>;

    async fn spawn_counter(ports: &Ports, options: GrainOptions) -> AggregateHandle<Counter> {
        let grain = Grain::activate(
            "c-1".to_string(),
            ports.grain_ports(),
            FollowUnit::new(),
            Arc::new(options),
        )
        .await
        .expect("activation should succeed");
        spawn_actor(grain)
    }

    async fn versions(ports: &Ports) -> Vec<i64> {
        ports
            .events
            .records(&"c-1".to_string())
            .await
            .iter()
            .map(|r| r.base.version)
            .collect()
    }

    #[tokio::test]
    async fn execute_increment_three_times() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;

        for _ in 0..3 {
            handle
                .execute(CounterCommand::Increment, CommandContext::default())
                .await
                .expect("execute should succeed");
        }

        let state = handle.state().await.expect("state should succeed");
        assert_eq!(state.value, 3);
        assert_eq!(versions(&ports).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn execute_decrement_at_zero_returns_domain_error() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;

        let result = handle
            .execute(CounterCommand::Decrement, CommandContext::default())
            .await;

        assert!(
            matches!(result, Err(ExecuteError::Domain(CounterError::AlreadyZero))),
            "expected Domain(AlreadyZero), got: {result:?}"
        );
    }

    #[tokio::test]
    async fn state_persists_across_respawn() {
        let ports = Ports::new();
        {
            let handle = spawn_counter(&ports, GrainOptions::default()).await;
            handle
                .execute(CounterCommand::Add(2), CommandContext::default())
                .await
                .expect("execute should succeed");
            handle.shutdown().await.expect("shutdown should succeed");
        }

        let handle = spawn_counter(&ports, GrainOptions::default()).await;
        let snapshot = handle.snapshot().await.expect("snapshot should succeed");
        assert_eq!(snapshot.state.value, 2);
        assert_eq!(snapshot.base.version, 1);
    }

    #[tokio::test]
    async fn idle_timeout_shuts_down_actor() {
        let ports = Ports::new();
        let options = GrainOptions {
            idle_timeout: Duration::from_millis(200),
            ..GrainOptions::default()
        };
        let handle = spawn_counter(&ports, options).await;

        handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .expect("first execute should succeed");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_alive(), "actor should be dead after idle timeout");

        let stored = ports
            .snapshots
            .stored(&"c-1".to_string())
            .await
            .expect("deactivation saves the snapshot");
        assert!(stored.base.is_latest);
        assert_eq!(stored.state.value, 1);
    }

    #[tokio::test]
    async fn rapid_commands_prevent_idle_eviction() {
        let ports = Ports::new();
        let options = GrainOptions {
            idle_timeout: Duration::from_millis(300),
            ..GrainOptions::default()
        };
        let handle = spawn_counter(&ports, options).await;

        for _ in 0..5 {
            handle
                .execute(CounterCommand::Increment, CommandContext::default())
                .await
                .expect("execute should succeed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(handle.is_alive(), "actor should still be alive during activity");
        assert_eq!(handle.state().await.expect("state").value, 5);
    }

    #[tokio::test]
    async fn plain_writes_wait_for_open_transaction() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;
        handle.begin_transaction("tx-1").await.expect("begin");

        let parked = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .execute(CounterCommand::Increment, CommandContext::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        handle
            .tx_raise("tx-1", CounterEvent::Added { amount: 5 }, None)
            .await
            .expect("tx raise");
        handle.commit("tx-1").await.expect("commit");
        handle.finish("tx-1").await.expect("finish");

        let events = parked
            .await
            .expect("join")
            .expect("parked execute succeeds");
        assert_eq!(events, vec![CounterEvent::Incremented]);
        assert_eq!(versions(&ports).await, vec![1, 2]);
        assert_eq!(handle.state().await.expect("state").value, 6);
    }

    #[tokio::test]
    async fn parked_write_runs_before_later_transaction() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;
        handle.begin_transaction("tx-1").await.expect("begin");

        let parked = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .execute(CounterCommand::Increment, CommandContext::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.begin_transaction("tx-2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle
            .tx_raise("tx-1", CounterEvent::Added { amount: 5 }, None)
            .await
            .expect("tx raise");
        handle.commit("tx-1").await.expect("commit");
        handle.finish("tx-1").await.expect("finish");

        second.await.expect("join").expect("second begin");
        let events = tokio::time::timeout(Duration::from_millis(200), parked)
            .await
            .expect("parked write ran before tx-2")
            .expect("join")
            .expect("parked execute");
        assert_eq!(events, vec![CounterEvent::Incremented]);
        let records = ports.events.records(&"c-1".to_string()).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].type_code, "Incremented");
        handle.rollback("tx-2").await.expect("rollback");
    }

    #[tokio::test]
    async fn tagged_execute_joins_transaction() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;
        handle.begin_transaction("tx-1").await.expect("begin");

        let ctx = CommandContext::default().with_transaction_id("tx-1");
        handle
            .execute(CounterCommand::Add(3), ctx)
            .await
            .expect("tagged execute");
        handle.rollback("tx-1").await.expect("rollback");

        assert_eq!(handle.state().await.expect("state").value, 0);
        assert!(versions(&ports).await.is_empty());
    }

    #[tokio::test]
    async fn second_begin_times_out_while_permit_held() {
        let ports = Ports::new();
        let mut options = GrainOptions::default();
        options.transaction.max_wait = Duration::from_millis(50);
        let handle = spawn_counter(&ports, options).await;

        handle.begin_transaction("tx-1").await.expect("begin");
        let err = handle.begin_transaction("tx-2").await.unwrap_err();
        assert!(matches!(err, GrainError::BeginTransactionTimeout));
    }

    #[tokio::test]
    async fn abandoned_transaction_rolls_back_at_deadline() {
        let ports = Ports::new();
        let mut options = GrainOptions::default();
        options.transaction.timeout = Duration::from_millis(50);
        let handle = spawn_counter(&ports, options).await;

        handle.begin_transaction("tx-1").await.expect("begin");
        handle
            .tx_raise("tx-1", CounterEvent::Incremented, None)
            .await
            .expect("tx raise");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(handle.state().await.expect("state").value, 0);
        handle
            .execute(CounterCommand::Add(2), CommandContext::default())
            .await
            .expect("execute after rollback");
        assert_eq!(versions(&ports).await, vec![1]);
    }

    #[tokio::test]
    async fn open_transaction_without_deadline_keeps_actor_alive() {
        let ports = Ports::new();
        let mut options = GrainOptions {
            idle_timeout: Duration::from_millis(100),
            ..GrainOptions::default()
        };
        options.transaction.timeout = Duration::MAX;
        let handle = spawn_counter(&ports, options).await;

        handle.begin_transaction("tx-1").await.expect("begin");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.is_alive(), "idle timeout must not end an open transaction");

        handle
            .tx_raise("tx-1", CounterEvent::Incremented, None)
            .await
            .expect("tx raise");
        handle.commit("tx-1").await.expect("commit");
        handle.finish("tx-1").await.expect("finish");
        assert_eq!(versions(&ports).await, vec![1]);
    }

    #[tokio::test]
    async fn concurrent_submissions_keep_versions_contiguous() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .concurrent_execute(CounterCommand::Increment, CommandContext::default())
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("concurrent execute");
        }

        assert_eq!(handle.state().await.expect("state").value, 20);
        assert_eq!(versions(&ports).await, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn over_stops_further_commands() {
        let ports = Ports::new();
        let handle = spawn_counter(&ports, GrainOptions::default()).await;
        handle
            .raise(CounterEvent::Incremented, None)
            .await
            .expect("raise");
        handle.over(OverType::None).await.expect("over");

        let err = handle
            .raise(CounterEvent::Incremented, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GrainError::StateIsOver { .. }));
    }
}
