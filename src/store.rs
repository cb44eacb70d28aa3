//! Top-level entry point that owns one actor per aggregate instance.
//!
//! The store is assembled via [`AggregateStoreBuilder`], which takes the
//! port set, grain options and the observers every grain fans out to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{AggregateHandle, spawn_actor};
use crate::aggregate::Aggregate;
use crate::batch::ExecuteResult;
use crate::command::CommandContext;
use crate::config::GrainOptions;
use crate::error::GrainError;
use crate::follow::{FollowUnit, ObserverUnit};
use crate::grain::Grain;
use crate::ports::GrainPorts;

type HandleCache<A> = HashMap<<A as Aggregate>::Id, AggregateHandle<A>>;

/// Central registry of live aggregate actors of one type.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped.
pub struct AggregateStore<A: Aggregate> {
    ports: GrainPorts<A>,
    follow: FollowUnit<A::Id>,
    options: Arc<GrainOptions>,
    cache: Arc<RwLock<HandleCache<A>>>,
}

impl<A: Aggregate> Clone for AggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            ports: self.ports.clone(),
            follow: self.follow.clone(),
            options: Arc::clone(&self.options),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("follow", &self.follow)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> AggregateStore<A> {
    /// Get a handle to an aggregate instance, activating its grain if needed.
    ///
    /// If the actor is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise the grain is recovered from
    /// storage and a new actor spawned.
    ///
    /// # Errors
    ///
    /// Any failure during grain activation.
    pub async fn get(&self, id: &A::Id) -> Result<AggregateHandle<A>, GrainError> {
        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = cache.get(id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Activation holds the write lock: two live actors for one key
        // would break the single-writer guarantee.
        let mut cache = self.cache.write().await;
        if let Some(handle) = cache.get(id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        cache.remove(id);

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            state_id = %id,
            "spawning actor"
        );
        let grain = Grain::activate(
            id.clone(),
            self.ports.clone(),
            self.follow.clone(),
            Arc::clone(&self.options),
        )
        .await?;
        let handle = spawn_actor(grain);
        cache.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    /// Execute `cmd` against the aggregate `id`.
    pub async fn execute(
        &self,
        id: &A::Id,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> ExecuteResult<A> {
        self.get(id).await?.execute(cmd, ctx).await
    }

    /// Current state of the aggregate `id`.
    pub async fn state(&self, id: &A::Id) -> Result<A, GrainError> {
        self.get(id).await?.state().await
    }

    /// Stop every cached actor, persisting their snapshots.
    ///
    /// Actors that already exited are skipped.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.cache.write().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.shutdown().await
                && !matches!(e, GrainError::ActorGone)
            {
                tracing::warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    state_id = %id,
                    error = %e,
                    "actor shutdown failed"
                );
            }
        }
    }

    pub fn options(&self) -> &GrainOptions {
        &self.options
    }
}

/// Builder for configuring and assembling an [`AggregateStore`].
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use eventfold_grain::{Aggregate, AggregateStoreBuilder, InMemoryPorts};
/// # fn demo<A: Aggregate>() {
/// let ports = InMemoryPorts::<A::Id, A>::new();
/// let store = AggregateStoreBuilder::new(ports.grain_ports())
///     .idle_timeout(Duration::from_secs(60))
///     .build();
/// # let _ = store;
/// # }
/// ```
pub struct AggregateStoreBuilder<A: Aggregate> {
    ports: GrainPorts<A>,
    follow: FollowUnit<A::Id>,
    options: GrainOptions,
}

impl<A: Aggregate> AggregateStoreBuilder<A> {
    pub fn new(ports: GrainPorts<A>) -> Self {
        Self {
            ports,
            follow: FollowUnit::new(),
            options: GrainOptions::default(),
        }
    }

    /// Replace the grain options wholesale.
    pub fn options(mut self, options: GrainOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an observer that receives every raised event and gates
    /// compaction.
    pub fn observer(mut self, observer: Arc<dyn ObserverUnit<A::Id>>) -> Self {
        self.follow = self.follow.with_observer(observer);
        self
    }

    /// Set the idle timeout for actors.
    ///
    /// Actors that receive no messages within this duration save their
    /// snapshot and exit. The next [`AggregateStore::get`] re-activates
    /// them from storage. Default: 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    pub fn build(self) -> AggregateStore<A> {
        AggregateStore {
            ports: self.ports,
            follow: self.follow,
            options: Arc::new(self.options),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateStoreBuilder<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStoreBuilder")
            .field("follow", &self.follow)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
