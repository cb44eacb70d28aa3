//! Per-command metadata carried alongside a command.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventUid;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries the idempotency token, the transaction the command belongs to
/// and free-form tracing fields, without polluting the `Command` or
/// `DomainEvent` types.
///
/// # Examples
///
/// ```
/// use eventfold_grain::{CommandContext, EventUid};
///
/// let ctx = CommandContext::default()
///     .with_unique(EventUid::new("order-7", 1_700_000_000_000))
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(ctx.event_uid(0).unwrap().uid, "order-7");
/// assert_eq!(ctx.event_uid(1).unwrap().uid, "order-7:1");
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Idempotency token and timestamp for the produced events.
    pub unique: Option<EventUid>,
    /// Joins an already open transaction instead of forming an automatic one.
    pub transaction_id: Option<String>,
    /// Correlation ID for tracing a request across aggregates.
    pub correlation_id: Option<String>,
    /// Arbitrary caller metadata, recorded on the command span but never
    /// persisted.
    pub metadata: Option<Value>,
}

impl CommandContext {
    /// Set the idempotency token.
    ///
    /// A command that produces several events derives one token per event
    /// (see [`event_uid`](Self::event_uid)).
    pub fn with_unique(mut self, uid: EventUid) -> Self {
        self.unique = Some(uid);
        self
    }

    /// Tag the command with an open transaction's id.
    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Span wrapping the handling of one command, carrying the
    /// correlation id and metadata so every log line below it has them.
    pub(crate) fn span(&self, aggregate_type: &'static str) -> tracing::Span {
        tracing::info_span!(
            "command",
            aggregate_type,
            correlation_id = self.correlation_id.as_deref(),
            transaction_id = self.transaction_id.as_deref(),
            metadata = self.metadata.as_ref().map(tracing::field::display)
        )
    }

    /// Token for the `index`-th event produced by the command.
    ///
    /// The first event uses the token as given; later ones append
    /// `":{index}"`. All share the caller's timestamp. `None` without a
    /// token, in which case the grain derives `"{state_id}_{version}"`.
    pub fn event_uid(&self, index: usize) -> Option<EventUid> {
        self.unique.as_ref().map(|uid| match index {
            0 => uid.clone(),
            i => EventUid::new(format!("{}:{i}", uid.uid), uid.timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use serde_json::json;
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};

    type Captured = Arc<Mutex<Vec<(String, String)>>>;

    /// Subscriber that keeps the fields of every new span.
    struct SpanFields(Captured);

    struct Collect<'a>(&'a mut Vec<(String, String)>);

    impl Visit for Collect<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl tracing::Subscriber for SpanFields {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, span: &Attributes<'_>) -> Id {
            if let Ok(mut fields) = self.0.lock() {
                span.record(&mut Collect(&mut fields));
            }
            Id::from_u64(1)
        }

        fn record(&self, _: &Id, _: &Record<'_>) {}

        fn record_follows_from(&self, _: &Id, _: &Id) {}

        fn event(&self, _: &tracing::Event<'_>) {}

        fn enter(&self, _: &Id) {}

        fn exit(&self, _: &Id) {}
    }

    #[test]
    fn untagged_context_derives_no_uid() {
        let ctx = CommandContext::default();
        assert!(ctx.unique.is_none());
        assert!(ctx.transaction_id.is_none());
        assert_eq!(ctx.event_uid(3), None);
    }

    #[test]
    fn event_uids_are_distinct_per_index() {
        let ctx = CommandContext::default().with_unique(EventUid::new("cmd", 42));
        let first = ctx.event_uid(0).expect("uid");
        let third = ctx.event_uid(2).expect("uid");
        assert_eq!(first, EventUid::new("cmd", 42));
        assert_eq!(third.uid, "cmd:2");
        assert_eq!(third.timestamp, 42);
    }

    #[test]
    fn transaction_and_trace_fields_are_set() {
        let ctx = CommandContext::default()
            .with_transaction_id(String::from("tx-1"))
            .with_correlation_id("req-7")
            .with_metadata(json!({"origin": "import"}));

        assert_eq!(ctx.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(ctx.metadata, Some(json!({"origin": "import"})));
    }

    #[test]
    fn command_span_records_correlation_and_metadata() {
        let ctx = CommandContext::default()
            .with_correlation_id("req-7")
            .with_metadata(json!({"origin": "import"}));
        let captured = Captured::default();

        tracing::subscriber::with_default(SpanFields(captured.clone()), || {
            let _span = ctx.span("counter");
        });

        let fields = captured.lock().expect("lock").clone();
        assert!(fields.contains(&("aggregate_type".to_string(), "counter".to_string())));
        assert!(fields.contains(&("correlation_id".to_string(), "req-7".to_string())));
        assert!(fields.contains(&(
            "metadata".to_string(),
            r#"{"origin":"import"}"#.to_string()
        )));
        assert!(!fields.iter().any(|(name, _)| name == "transaction_id"));
    }

    #[test]
    fn context_survives_json() {
        let ctx = CommandContext::default()
            .with_unique(EventUid::new("u-1", 7))
            .with_transaction_id("tx-9");

        let text = serde_json::to_string(&ctx).expect("serialize");
        let back: CommandContext = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, ctx);
    }
}
