//! Single-writer event-sourced aggregates ("grains") with snapshots,
//! archives, transactions and observers.
//!
//! Each aggregate instance lives in one tokio actor that owns its
//! [`Grain`]. Persistence goes through the traits in [`ports`]; in-memory
//! and file-backed implementations ship with the crate.

mod actor;
pub use actor::{AggregateHandle, spawn_actor};
mod aggregate;
pub use aggregate::{Aggregate, AggregateId};
mod archive;
mod batch;
mod codec;
mod command;
mod config;
mod error;
mod event;
mod follow;
mod grain;
mod memory;
mod observer;
pub mod ports;
mod snapshot;
mod storage;
mod store;
mod transaction;

pub use archive::ArchiveBrief;
pub use batch::ExecuteResult;
pub use codec::{EventRegistry, WIRE_FORMAT_V1, WireEnvelope};
pub use command::CommandContext;
pub use config::{
    ArchiveOptions, BatchOptions, EventArchiveType, GrainOptions, ObserverOptions,
    SnapshotOptions, TransactionOptions,
};
pub use error::{BoxError, CodecError, ExecuteError, GrainError, StoreError};
pub use event::{EventBase, EventRecord, EventUid, FullyEvent, default_unique_id, now_millis};
pub use follow::{FollowUnit, ObserverUnit};
pub use grain::{Grain, OverType};
pub use memory::{
    InMemoryArchiveStore, InMemoryEventBus, InMemoryEventStore, InMemoryObserverSnapshotStore,
    InMemoryPorts, InMemorySnapshotStore,
};
pub use observer::{ObserverGrain, ObserverGroup, ObserverHandler, ObserverPorts};
pub use ports::GrainPorts;
pub use snapshot::{ObserverSnapshot, Snapshot, SnapshotBase};
pub use storage::{FileObserverSnapshotStore, FileSnapshotStore, StorageLayout};
pub use store::{AggregateStore, AggregateStoreBuilder};
pub use transaction::{TransactionStatus, TransactionWorkItem};
