//! Crate-level error types for grain operations, storage ports and codecs.

/// Boxed error used at trait-object seams (observer handlers, storage
/// backends).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by the storage and bus ports.
///
/// Backends map their native failures onto these variants so the grain
/// can log and propagate them uniformly.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The write collided with an existing record that is not an
    /// idempotent duplicate (e.g. a transactional batch hitting an
    /// occupied version).
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    /// Wrap an arbitrary backend error.
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Error produced while encoding or decoding events and wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON (de)serialization of a payload failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The buffer ended before the declared length.
    #[error("wire envelope truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The envelope's leading format byte is not understood.
    #[error("unsupported wire format {0}")]
    UnsupportedFormat(u8),

    /// A length-prefixed field is longer than its prefix can express.
    #[error("field `{field}` too large for wire envelope ({len} bytes)")]
    FieldTooLarge { field: &'static str, len: usize },

    /// The event type code is not valid UTF-8.
    #[error("type code is not valid UTF-8")]
    InvalidTypeCode,

    /// The domain event did not serialize to an adjacently tagged object.
    #[error("domain event must serialize to an object with a string `type` tag")]
    MissingTypeTag,

    /// No decoder is registered for the type code.
    #[error("no decoder registered for event type `{0}`")]
    UnknownTypeCode(String),

    /// Trailing bytes after a complete envelope.
    #[error("{0} trailing bytes after wire envelope")]
    TrailingBytes(usize),
}

/// Error returned by grain (aggregate actor) and observer operations.
#[derive(Debug, thiserror::Error)]
pub enum GrainError {
    /// An event version did not match the expected next version.
    ///
    /// Indicates corruption or a violated single-writer guarantee.
    #[error("event version unordered for `{state_id}`: expected {expected}, got {actual}")]
    EventVersionUnordered {
        state_id: String,
        expected: i64,
        actual: i64,
    },

    /// An operation requiring quiescence ran while an apply was in flight.
    #[error(
        "state insecurity for `{state_id}`: version {version} != doing version {doing_version}"
    )]
    StateInsecurity {
        state_id: String,
        version: i64,
        doing_version: i64,
    },

    /// The aggregate has been terminally closed.
    #[error("state `{state_id}` is over")]
    StateIsOver { state_id: String },

    /// An event is timestamped inside a range whose events were already
    /// compacted away.
    #[error("event timestamp {timestamp} for `{state_id}` precedes cleared archive")]
    EventIsCleared { state_id: String, timestamp: i64 },

    /// A compaction-dependent operation found an observer behind.
    #[error("observers of `{state_id}` have not reached version {version}")]
    ObserverNotCompleted { state_id: String, version: i64 },

    /// `begin_transaction` while another transaction is open.
    #[error("repeated transaction: `{current}` is open, `{requested}` rejected")]
    RepeatedTransaction { current: String, requested: String },

    /// A transactional raise or commit without an open transaction.
    #[error("no transaction is open")]
    UnopenedTransaction,

    /// Commit, finish or rollback named a different transaction id.
    #[error("transaction id mismatch: open `{expected}`, got `{actual}`")]
    TransactionIdMismatch { expected: String, actual: String },

    /// Finish was requested before the batch was durably committed.
    #[error("transaction `{0}` has not been committed")]
    TransactionNotCommitted(String),

    /// A transactional raise arrived after the batch was committed.
    #[error("transaction `{0}` is already committed")]
    TransactionCommitted(String),

    /// The write permit could not be acquired in time.
    #[error("timed out waiting to begin a transaction")]
    BeginTransactionTimeout,

    /// A non-transactional write was attempted while a transaction is open.
    #[error("transaction `{0}` is pending")]
    TransactionPending(String),

    /// The concurrency batch channel is closed or full.
    #[error("batch channel unavailable: {0}")]
    ChannelUnavailable(&'static str),

    /// A concurrent observer batch did not finish within its timeout.
    #[error("observer batch timed out after applying up to version {version}")]
    BatchTimeout { version: i64 },

    /// The actor task that owns the grain has exited.
    #[error("grain actor is no longer running")]
    ActorGone,

    /// A storage or bus port failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Encoding or decoding an event failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An observer's event handler failed.
    #[error("observer handler failed: {0}")]
    Handler(#[source] BoxError),
}

impl From<serde_json::Error> for GrainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(CodecError::Json(err))
    }
}

/// Error returned when executing a command against an aggregate.
///
/// Generic over `E`, the domain error the aggregate's command handler
/// may produce.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// The engine failed to persist or apply the produced events.
    #[error(transparent)]
    Grain(#[from] GrainError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_wraps_grain_error() {
        let err: ExecuteError<TestDomainError> = GrainError::ActorGone.into();
        assert_eq!(err.to_string(), "grain actor is no longer running");
    }

    #[test]
    fn store_error_converts_into_grain_error_transparently() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = GrainError::from(StoreError::from(io_err));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn state_insecurity_names_both_versions() {
        let err = GrainError::StateInsecurity {
            state_id: "c-1".into(),
            version: 4,
            doing_version: 5,
        };
        assert_eq!(
            err.to_string(),
            "state insecurity for `c-1`: version 4 != doing version 5"
        );
    }

    #[test]
    fn json_error_becomes_codec_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = GrainError::from(json_err);
        assert!(matches!(err, GrainError::Codec(CodecError::Json(_))));
    }

    // Errors cross task boundaries through oneshot replies.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<GrainError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<CodecError>();
            assert_send_sync::<ExecuteError<TestDomainError>>();
        }
    };
}
