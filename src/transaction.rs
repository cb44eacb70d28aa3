//! In-aggregate transactions: buffered raises committed as one atomic
//! append, with rollback to the backup snapshot.
//!
//! State machine per grain: idle, pending, committed, then finished or
//! rolled back. The grain's binary semaphore permit is held by the open
//! transaction and released when it is dropped.

use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

use crate::aggregate::Aggregate;
use crate::error::GrainError;
use crate::event::{
    EventBase, EventRecord, EventUid, FullyEvent, default_unique_id, encode_event, now_millis,
};
use crate::grain::Grain;

/// First wait before retrying a failed timeout rollback; doubles per attempt.
const ROLLBACK_RETRY_BASE: Duration = Duration::from_millis(100);
const ROLLBACK_RETRY_MAX: Duration = Duration::from_secs(30);

/// Progress of the open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting transactional raises.
    Pending,
    /// The batch append was submitted but has not been acknowledged.
    Committing,
    /// The batch is durable; finish publishes it.
    Committed,
}

/// An event raised inside a transaction, waiting for commit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionWorkItem<K, E> {
    pub fully_event: FullyEvent<K, E>,
    pub unique_id: String,
    pub hash_key: String,
}

pub(crate) struct TransactionState<A: Aggregate> {
    pub id: String,
    pub status: TransactionStatus,
    pub started_at: Instant,
    pub start_version: i64,
    pub start_timestamp: i64,
    pub work: Vec<TransactionWorkItem<A::Id, A::DomainEvent>>,
    /// Encoded work, filled in by commit.
    pub records: Vec<EventRecord<A::Id>>,
    /// Failed timeout rollbacks so far.
    pub rollback_attempts: u32,
    /// Set after a failed timeout rollback; replaces the deadline.
    pub retry_at: Option<Instant>,
    _permit: OwnedSemaphorePermit,
}

impl<A: Aggregate> Grain<A> {
    /// Open a transaction, taking the write permit without waiting.
    ///
    /// A transaction left pending past `transaction.timeout` is rolled back
    /// first. Otherwise an open transaction fails the call with
    /// [`GrainError::RepeatedTransaction`].
    pub async fn begin_transaction(&mut self, tx_id: impl Into<String>) -> Result<(), GrainError> {
        let tx_id = tx_id.into();
        let permit = match self.write_permit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let Some(current) = self.transaction.as_ref() else {
                    // Reserved by a handle that has not delivered its begin yet.
                    return Err(GrainError::BeginTransactionTimeout);
                };
                let current_id = current.id.clone();
                if current.started_at.elapsed() < self.options.transaction.timeout {
                    return Err(GrainError::RepeatedTransaction {
                        current: current_id,
                        requested: tx_id,
                    });
                }
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    transaction_id = %current_id,
                    "rolling back timed-out transaction"
                );
                self.rollback_transaction(&current_id).await?;
                self.write_permit
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| GrainError::RepeatedTransaction {
                        current: current_id,
                        requested: tx_id.clone(),
                    })?
            }
        };
        self.begin_transaction_with_permit(tx_id, permit).await
    }

    /// Open a transaction with a permit the caller already acquired.
    pub(crate) async fn begin_transaction_with_permit(
        &mut self,
        tx_id: String,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), GrainError> {
        if let Some(current) = &self.transaction {
            return Err(GrainError::RepeatedTransaction {
                current: current.id.clone(),
                requested: tx_id,
            });
        }
        if self.snapshot.base.is_over {
            return Err(GrainError::StateIsOver {
                state_id: self.state_id.to_string(),
            });
        }
        self.snapshot.base.ensure_quiescent()?;

        if self.backup.base.version != self.snapshot.base.version {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                version = self.snapshot.base.version,
                backup_version = self.backup.base.version,
                "backup snapshot out of sync, recovering"
            );
            self.recover().await?;
            self.backup = self.snapshot.clone();
        }

        let start_version = self.snapshot.base.version + 1;
        let start_timestamp = now_millis();
        self.snapshot.base.transaction_id = Some(tx_id.clone());
        self.snapshot.base.transaction_start_version = start_version;
        self.snapshot.base.transaction_start_timestamp = start_timestamp;

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            transaction_id = %tx_id,
            start_version,
            "transaction begun"
        );
        self.transaction = Some(TransactionState {
            id: tx_id,
            status: TransactionStatus::Pending,
            started_at: Instant::now(),
            start_version,
            start_timestamp,
            work: Vec::new(),
            records: Vec::new(),
            rollback_attempts: 0,
            retry_at: None,
            _permit: permit,
        });
        Ok(())
    }

    /// Apply `event` to the live state and buffer it for commit.
    pub fn tx_raise_event(
        &mut self,
        event: A::DomainEvent,
        uid: Option<EventUid>,
    ) -> Result<(), GrainError> {
        let tx = self
            .transaction
            .as_ref()
            .ok_or(GrainError::UnopenedTransaction)?;
        if tx.status != TransactionStatus::Pending {
            return Err(GrainError::TransactionCommitted(tx.id.clone()));
        }
        if self.snapshot.base.is_over {
            return Err(GrainError::StateIsOver {
                state_id: self.state_id.to_string(),
            });
        }

        let version = self.snapshot.base.version + 1;
        let (unique_id, timestamp) = match uid {
            Some(uid) => (uid.uid, uid.timestamp),
            None => (default_unique_id(&self.state_id, version), now_millis()),
        };
        let base = EventBase::new(version, timestamp);

        self.snapshot.base.increment_doing_version()?;
        self.apply_in_flight(&base, &event)?;

        let item = TransactionWorkItem {
            fully_event: FullyEvent {
                state_id: self.state_id.clone(),
                base,
                event,
            },
            unique_id,
            hash_key: self.hash_key(),
        };
        if let Some(tx) = self.transaction.as_mut() {
            tx.work.push(item);
        }
        Ok(())
    }

    /// Durably append every buffered event as one batch.
    ///
    /// On failure the transaction is rolled back before the error is
    /// returned.
    pub async fn commit_transaction(&mut self, tx_id: &str) -> Result<(), GrainError> {
        let tx = self.check_transaction(tx_id)?;
        if tx.status == TransactionStatus::Committed {
            return Ok(());
        }
        let work = tx.work.clone();

        if let Err(e) = self.commit_work(work).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                transaction_id = %tx_id,
                error = %e,
                "commit_transaction failed, rolling back"
            );
            if let Err(rollback_err) = self.rollback_transaction(tx_id).await {
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    transaction_id = %tx_id,
                    error = %rollback_err,
                    "rollback after failed commit failed"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn commit_work(
        &mut self,
        work: Vec<TransactionWorkItem<A::Id, A::DomainEvent>>,
    ) -> Result<(), GrainError> {
        let mut records = Vec::with_capacity(work.len());
        for item in work {
            self.before_raise(item.fully_event.base.timestamp).await?;
            let encoded = encode_event(&item.fully_event.event)?;
            records.push(EventRecord {
                state_id: item.fully_event.state_id,
                base: item.fully_event.base,
                type_code: encoded.type_code,
                payload: encoded.payload,
                unique_id: item.unique_id,
            });
        }

        if !records.is_empty() {
            self.set_status(TransactionStatus::Committing);
            self.ports.events.append_transactional(&records).await?;
        }

        if let Some(tx) = self.transaction.as_mut() {
            tx.status = TransactionStatus::Committed;
            tx.records = records;
        }
        Ok(())
    }

    /// Bring the backup up to date, persist and publish the committed
    /// events, and release the write permit.
    ///
    /// A transaction without work may be finished without committing.
    /// Bookkeeping failures after the durable append are logged, not
    /// returned; the events are already committed.
    pub async fn finish_transaction(&mut self, tx_id: &str) -> Result<(), GrainError> {
        let tx = self.check_transaction(tx_id)?;
        match tx.status {
            TransactionStatus::Committed => {}
            TransactionStatus::Pending if tx.work.is_empty() => {}
            _ => return Err(GrainError::TransactionNotCommitted(tx.id.clone())),
        }
        let Some(tx) = self.transaction.take() else {
            return Err(GrainError::UnopenedTransaction);
        };
        self.snapshot.base.clear_transaction();

        for record in &tx.records {
            if let Err(e) = self.apply_to_backup(record) {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    version = record.base.version,
                    error = %e,
                    "backup snapshot not updated"
                );
            }
            self.extend_archive(&record.base);
        }
        if let Err(e) = self.archive(false).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                transaction_id = %tx.id,
                error = %e,
                "archive after transaction failed"
            );
        }
        if let Err(e) = self.save_snapshot(false, false).await {
            tracing::error!(
                aggregate_type = A::AGGREGATE_TYPE,
                state_id = %self.state_id,
                transaction_id = %tx.id,
                error = %e,
                "snapshot save after transaction failed"
            );
        }
        for record in &tx.records {
            self.publish(record).await;
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            transaction_id = %tx.id,
            events = tx.records.len(),
            version = self.snapshot.base.version,
            "transaction finished"
        );
        Ok(())
    }

    /// Undo the open transaction.
    ///
    /// Durable events of a committed batch are deleted first. The live
    /// snapshot is then restored from the backup when the backup sits
    /// exactly before the transaction, or rebuilt from storage otherwise.
    /// If the rollback itself fails the transaction stays open.
    pub async fn rollback_transaction(&mut self, tx_id: &str) -> Result<(), GrainError> {
        self.check_transaction(tx_id)?;
        let Some(tx) = self.transaction.take() else {
            return Err(GrainError::UnopenedTransaction);
        };

        match self.rollback_to_backup(&tx).await {
            Ok(()) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    transaction_id = %tx.id,
                    version = self.snapshot.base.version,
                    "transaction rolled back"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %self.state_id,
                    transaction_id = %tx.id,
                    error = %e,
                    "rollback_transaction failed"
                );
                self.transaction = Some(tx);
                Err(e)
            }
        }
    }

    async fn rollback_to_backup(&mut self, tx: &TransactionState<A>) -> Result<(), GrainError> {
        let maybe_durable = tx.status != TransactionStatus::Pending;
        if maybe_durable {
            self.ports
                .events
                .delete_after(&self.state_id, tx.start_version, tx.start_timestamp)
                .await?;
        }

        if self.backup.base.version == tx.start_version - 1 {
            let latest_min = self.snapshot.base.latest_min_event_timestamp;
            let is_latest = self.snapshot.base.is_latest;
            self.snapshot = self.backup.clone();
            self.snapshot.base.latest_min_event_timestamp = latest_min;
            self.snapshot.base.is_latest = is_latest;
        } else {
            if !maybe_durable {
                self.ports
                    .events
                    .delete_after(&self.state_id, tx.start_version, tx.start_timestamp)
                    .await?;
            }
            self.recover().await?;
            self.backup = self.snapshot.clone();
        }
        self.snapshot.base.clear_transaction();
        Ok(())
    }

    /// Roll back the open transaction if it outlived `transaction.timeout`.
    pub(crate) async fn rollback_if_timed_out(&mut self) -> Result<bool, GrainError> {
        let Some(tx) = self.transaction.as_ref() else {
            return Ok(false);
        };
        if tx.started_at.elapsed() < self.options.transaction.timeout {
            return Ok(false);
        }
        if tx.retry_at.is_some_and(|at| at > Instant::now()) {
            return Ok(false);
        }
        let tx_id = tx.id.clone();
        tracing::warn!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %self.state_id,
            transaction_id = %tx_id,
            "transaction timed out"
        );
        if let Err(e) = self.rollback_transaction(&tx_id).await {
            if let Some(tx) = self.transaction.as_mut() {
                let backoff = ROLLBACK_RETRY_BASE
                    .saturating_mul(2u32.saturating_pow(tx.rollback_attempts))
                    .min(ROLLBACK_RETRY_MAX);
                tx.rollback_attempts = tx.rollback_attempts.saturating_add(1);
                tx.retry_at = Instant::now().checked_add(backoff);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// When the open transaction times out, or when a failed timeout
    /// rollback is retried. `None` without an open transaction or when the
    /// timeout is too large to represent.
    pub(crate) fn transaction_deadline(&self) -> Option<Instant> {
        let tx = self.transaction.as_ref()?;
        tx.retry_at
            .or_else(|| tx.started_at.checked_add(self.options.transaction.timeout))
    }

    /// Id of the open transaction.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|tx| tx.id.as_str())
    }

    /// Status of the open transaction.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.transaction.as_ref().map(|tx| tx.status)
    }

    fn set_status(&mut self, status: TransactionStatus) {
        if let Some(tx) = self.transaction.as_mut() {
            tx.status = status;
        }
    }

    pub(crate) fn check_transaction(&self, tx_id: &str) -> Result<&TransactionState<A>, GrainError> {
        let tx = self
            .transaction
            .as_ref()
            .ok_or(GrainError::UnopenedTransaction)?;
        if tx.id != tx_id {
            return Err(GrainError::TransactionIdMismatch {
                expected: tx.id.clone(),
                actual: tx_id.to_owned(),
            });
        }
        Ok(tx)
    }
}
