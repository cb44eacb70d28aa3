//! Tuning knobs consumed by grains and observers.
//!
//! Every field has a default, and every struct deserializes with
//! `#[serde(default)]`, so a partial JSON document only needs to name the
//! values it overrides. Durations are expressed in milliseconds on the wire.
//!
//! # Examples
//!
//! ```
//! use eventfold_grain::GrainOptions;
//!
//! let options: GrainOptions =
//!     serde_json::from_str(r#"{ "snapshot": { "version_interval": 10 } }"#).unwrap();
//! assert_eq!(options.snapshot.version_interval, 10);
//! assert_eq!(options.snapshot.events_per_read, 2000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Snapshot persistence and recovery paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// Persist a snapshot once this many events have been applied since the
    /// last save.
    ///
    /// Default: 20.
    pub version_interval: i64,

    /// On deactivation, force a save when at least this many events are
    /// unsaved.
    ///
    /// Default: 1.
    pub min_save_interval: i64,

    /// Page size used when replaying events during recovery.
    ///
    /// Default: 2000.
    pub events_per_read: i64,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            version_interval: 20,
            min_save_interval: 1,
            events_per_read: 2000,
        }
    }
}

/// What happens to events covered by a cleared archive brief.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventArchiveType {
    /// Physically delete the range.
    #[default]
    Delete,
    /// Move the range to archive storage.
    Move,
}

/// Archive and compaction thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    /// Whether archiving runs at all.
    ///
    /// Default: `false`.
    pub enabled: bool,

    /// Minimum elapsed event time covered by a brief before it may commit.
    ///
    /// Default: 1 day.
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Minimum number of events covered by a brief before it may commit.
    /// Both `interval` and `interval_version` must be reached.
    ///
    /// Default: 10 000.
    pub interval_version: i64,

    /// Commit regardless of `interval_version` once this much event time
    /// is covered.
    ///
    /// Default: 30 days.
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,

    /// Commit regardless of `interval` once this many events are covered.
    ///
    /// Default: 1 000 000.
    pub max_interval_version: i64,

    /// Number of committed-but-uncleared briefs that triggers compaction of
    /// the oldest one.
    ///
    /// Default: 30.
    pub max_snapshot_archive_records: usize,

    /// How cleared event ranges are disposed of.
    pub event_archive_type: EventArchiveType,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 60 * 60),
            interval_version: 10_000,
            max_interval: Duration::from_secs(30 * 24 * 60 * 60),
            max_interval_version: 1_000_000,
            max_snapshot_archive_records: 30,
            event_archive_type: EventArchiveType::Delete,
        }
    }
}

/// Transaction coordinator timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// A transaction pending longer than this is rolled back automatically.
    ///
    /// Default: 30 seconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// How long `begin_transaction` waits for the write permit.
    ///
    /// Default: 10 seconds.
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Concurrency batcher channel sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Capacity of the concurrent-raise channel. Submissions beyond it fail
    /// with `ChannelUnavailable`.
    ///
    /// Default: 1024.
    pub channel_capacity: usize,

    /// Maximum requests drained into one batch.
    ///
    /// Default: 256.
    pub max_batch_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_batch_size: 256,
        }
    }
}

/// Observer checkpointing and concurrent delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverOptions {
    /// Persist the observer snapshot once this many events have been
    /// delivered since the last save.
    ///
    /// Default: 20.
    pub snapshot_version_interval: i64,

    /// Page size used when backfilling gaps from the event store.
    ///
    /// Default: 2000.
    pub events_per_read: i64,

    /// Upper bound on applying one concurrent delivery batch.
    ///
    /// Default: 30 seconds.
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,

    /// Capacity of the concurrent delivery channel.
    ///
    /// Default: 1024.
    pub channel_capacity: usize,

    /// Maximum deliveries drained into one concurrent batch.
    ///
    /// Default: 256.
    pub max_batch_size: usize,

    /// Coalesce deliveries into batches instead of applying each one on
    /// its own.
    ///
    /// Default: false.
    pub concurrent: bool,

    /// How long an observer actor waits for a delivery before saving its
    /// progress and exiting.
    ///
    /// Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            snapshot_version_interval: 20,
            events_per_read: 2000,
            batch_timeout: Duration::from_secs(30),
            channel_capacity: 1024,
            max_batch_size: 256,
            concurrent: false,
            idle_timeout: GrainOptions::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Flat options struct consumed by every grain of one aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrainOptions {
    pub snapshot: SnapshotOptions,
    pub archive: ArchiveOptions,
    pub transaction: TransactionOptions,
    pub batch: BatchOptions,
    pub observer: ObserverOptions,
    /// How long an actor waits for a message before deactivating.
    ///
    /// Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl GrainOptions {
    /// Default idle timeout for actors: 5 minutes.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
}

impl Default for GrainOptions {
    fn default() -> Self {
        Self {
            snapshot: SnapshotOptions::default(),
            archive: ArchiveOptions::default(),
            transaction: TransactionOptions::default(),
            batch: BatchOptions::default(),
            observer: ObserverOptions::default(),
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
