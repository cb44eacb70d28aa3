//! Concurrency batcher: coalesces concurrently submitted commands into one
//! transactional append.
//!
//! Requests arrive on a bounded channel that bypasses the actor mailbox
//! but is drained by the same actor task, so the live snapshot still has a
//! single writer. Requests tagged with a transaction id join that open
//! transaction directly. Untagged requests of one drain run as a single
//! auto-transaction; if anything in it fails, the transaction is rolled
//! back and every request is retried on its own through
//! [`Grain::execute`].

use tokio::sync::{OwnedSemaphorePermit, oneshot};

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::ExecuteError;
use crate::grain::Grain;

/// Result delivered to each concurrent caller.
pub type ExecuteResult<A> =
    Result<Vec<<A as Aggregate>::DomainEvent>, ExecuteError<<A as Aggregate>::Error>>;

/// One queued request.
pub struct ConcurrentRaise<A: Aggregate> {
    pub cmd: A::Command,
    pub ctx: CommandContext,
    pub reply: oneshot::Sender<ExecuteResult<A>>,
}

impl<A: Aggregate> ConcurrentRaise<A> {
    pub fn new(cmd: A::Command, ctx: CommandContext) -> (Self, oneshot::Receiver<ExecuteResult<A>>) {
        let (reply, rx) = oneshot::channel();
        (Self { cmd, ctx, reply }, rx)
    }

    fn respond(self, result: ExecuteResult<A>) {
        // The caller may have given up waiting.
        let _ = self.reply.send(result);
    }
}

impl<A: Aggregate> std::fmt::Debug for ConcurrentRaise<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRaise")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> Grain<A> {
    /// Run every request tagged with a transaction id against the open
    /// transaction and return the untagged remainder, in arrival order.
    pub(crate) fn dispatch_tagged(
        &mut self,
        requests: Vec<ConcurrentRaise<A>>,
    ) -> Vec<ConcurrentRaise<A>> {
        let mut untagged = Vec::with_capacity(requests.len());
        for request in requests {
            match request.ctx.transaction_id.clone() {
                Some(tx_id) => {
                    let result = self.raise_in_transaction(&tx_id, request.cmd.clone(), &request.ctx);
                    request.respond(result);
                }
                None => untagged.push(request),
            }
        }
        untagged
    }

    pub(crate) fn raise_in_transaction(
        &mut self,
        tx_id: &str,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> ExecuteResult<A> {
        let _span = ctx.span(A::AGGREGATE_TYPE).entered();
        self.check_transaction(tx_id)?;
        let events = self.snapshot.state.handle(cmd).map_err(ExecuteError::Domain)?;
        for (index, event) in events.iter().enumerate() {
            self.tx_raise_event(event.clone(), ctx.event_uid(index))?;
        }
        Ok(events)
    }

    /// Run `group` as one auto-transaction holding `permit`.
    ///
    /// Every caller gets exactly one reply.
    pub(crate) async fn run_auto_batch(
        &mut self,
        group: Vec<ConcurrentRaise<A>>,
        permit: OwnedSemaphorePermit,
    ) {
        if group.is_empty() {
            return;
        }
        let tx_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.begin_transaction_with_permit(tx_id.clone(), permit).await {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                error = %e,
                "auto transaction could not begin, raising one by one"
            );
            self.retry_individually(group).await;
            return;
        }

        let produced = match self.apply_group(&group) {
            Ok(produced) => produced,
            Err(e) => {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    batch_size = group.len(),
                    error = %e,
                    "batch apply failed, retrying per caller"
                );
                self.abandon_auto_transaction(&tx_id).await;
                self.retry_individually(group).await;
                return;
            }
        };

        if let Err(e) = self.commit_transaction(&tx_id).await {
            // Commit already rolled the transaction back.
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                batch_size = group.len(),
                error = %e,
                "batch commit failed, retrying per caller"
            );
            self.retry_individually(group).await;
            return;
        }
        if let Err(e) = self.finish_transaction(&tx_id).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                error = %e,
                "batch finish failed, retrying per caller"
            );
            self.abandon_auto_transaction(&tx_id).await;
            self.retry_individually(group).await;
            return;
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            batch_size = group.len(),
            version = self.snapshot.base.version,
            "batch committed"
        );
        for (request, events) in group.into_iter().zip(produced) {
            request.respond(Ok(events));
        }
    }

    /// Apply every request of the group inside the open transaction.
    fn apply_group(
        &mut self,
        group: &[ConcurrentRaise<A>],
    ) -> Result<Vec<Vec<A::DomainEvent>>, ExecuteError<A::Error>> {
        let mut produced = Vec::with_capacity(group.len());
        for request in group {
            let _span = request.ctx.span(A::AGGREGATE_TYPE).entered();
            let events = self
                .snapshot
                .state
                .handle(request.cmd.clone())
                .map_err(ExecuteError::Domain)?;
            for (index, event) in events.iter().enumerate() {
                self.tx_raise_event(event.clone(), request.ctx.event_uid(index))?;
            }
            produced.push(events);
        }
        Ok(produced)
    }

    async fn abandon_auto_transaction(&mut self, tx_id: &str) {
        if let Err(e) = self.rollback_transaction(tx_id).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                transaction_id = %tx_id,
                error = %e,
                "auto transaction rollback failed"
            );
        }
    }

    async fn retry_individually(&mut self, group: Vec<ConcurrentRaise<A>>) {
        for request in group {
            let result = self.execute(request.cmd.clone(), &request.ctx).await;
            request.respond(result);
        }
    }
}
