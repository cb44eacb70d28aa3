//! Registry of downstream observers attached to one aggregate type.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::aggregate::AggregateId;
use crate::error::GrainError;

/// One observer as seen from the aggregate side.
///
/// Implemented by [`ObserverGroup`](crate::observer::ObserverGroup); tests
/// and custom hosts may provide their own.
#[async_trait]
pub trait ObserverUnit<K: AggregateId>: Send + Sync {
    /// Observer name, used in logs.
    fn name(&self) -> &str;

    /// Deliver an encoded [`WireEnvelope`](crate::codec::WireEnvelope).
    async fn tell(&self, state_id: &K, envelope: Bytes) -> Result<(), GrainError>;

    /// Return the observer's durable version for `state_id`, persisting
    /// its checkpoint first if it has reached `compare_version` but not
    /// yet saved it.
    async fn get_and_save_version(
        &self,
        state_id: &K,
        compare_version: i64,
    ) -> Result<i64, GrainError>;
}

/// The observers the grain fans out to and consults before compaction.
pub struct FollowUnit<K: AggregateId> {
    observers: Vec<Arc<dyn ObserverUnit<K>>>,
}

impl<K: AggregateId> FollowUnit<K> {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ObserverUnit<K>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Deliver `envelope` to every observer in registration order.
    ///
    /// Delivery is best-effort: a failing observer is logged and the rest
    /// still receive the event. Observers backfill from the event store on
    /// their next delivery.
    pub async fn tell_all(&self, state_id: &K, envelope: &Bytes) {
        for observer in &self.observers {
            if let Err(e) = observer.tell(state_id, envelope.clone()).await {
                tracing::warn!(
                    observer = observer.name(),
                    state_id = %state_id,
                    error = %e,
                    "observer delivery failed"
                );
            }
        }
    }

    /// Durable version of every observer, in registration order.
    pub async fn get_and_save_versions(
        &self,
        state_id: &K,
        compare_version: i64,
    ) -> Result<Vec<i64>, GrainError> {
        let mut versions = Vec::with_capacity(self.observers.len());
        for observer in &self.observers {
            versions.push(
                observer
                    .get_and_save_version(state_id, compare_version)
                    .await?,
            );
        }
        Ok(versions)
    }
}

impl<K: AggregateId> Default for FollowUnit<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AggregateId> Clone for FollowUnit<K> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
        }
    }
}

impl<K: AggregateId> std::fmt::Debug for FollowUnit<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("FollowUnit")
            .field("observers", &names)
            .finish()
    }
}
