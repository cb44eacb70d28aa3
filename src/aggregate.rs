//! Aggregate trait and the key bound shared by grains and observers.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{Serialize, de::DeserializeOwned};

/// Key identifying exactly one aggregate instance.
///
/// Blanket-implemented for every type meeting the bounds, so integers,
/// `String` and `uuid::Uuid` all work out of the box.
pub trait AggregateId:
    Clone + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AggregateId for T where
    T: Clone + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Domain logic of one aggregate type; the type doubles as its state.
///
/// A grain folds stored events through [`apply`](Aggregate::apply) to
/// rebuild the state and asks [`handle`](Aggregate::handle) which events a
/// command produces.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. The concurrency batcher may call it twice for the same
///   command (once in the shared batch, once on the per-caller retry path).
/// - [`apply`](Aggregate::apply) must be pure and total. Replaying the same
///   events must produce an equal state.
/// - `DomainEvent` must use adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`). The tag becomes the
///   event's type code on the wire.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "order"). Used in logs, storage
    /// paths and as the bus hash-key prefix.
    const AGGREGATE_TYPE: &'static str;

    /// Key type of aggregate instances.
    type Id: AggregateId;

    type Command: Clone + Send + 'static;

    /// Adjacently tagged event enum.
    type DomainEvent: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static;

    /// Returned by `handle` to reject a command.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide which events `cmd` produces against the current state.
    ///
    /// An empty vector leaves the aggregate untouched.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Fold one event into the state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// Unsigned counter shared by the unit tests.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    #[derive(Debug, Clone)]
    pub(crate) enum CounterCommand {
        Increment,
        Decrement,
        Add(u64),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Decremented,
        Added { amount: u64 },
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum CounterError {
        #[error("counter is at zero")]
        AlreadyZero,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        type Id = String;
        type Command = CounterCommand;
        type DomainEvent = CounterEvent;
        type Error = CounterError;

        fn handle(&self, cmd: CounterCommand) -> Result<Vec<CounterEvent>, CounterError> {
            let event = match cmd {
                CounterCommand::Increment => CounterEvent::Incremented,
                CounterCommand::Decrement if self.value == 0 => {
                    return Err(CounterError::AlreadyZero);
                }
                CounterCommand::Decrement => CounterEvent::Decremented,
                CounterCommand::Add(amount) => CounterEvent::Added { amount },
            };
            Ok(vec![event])
        }

        fn apply(self, event: &CounterEvent) -> Self {
            let value = match event {
                CounterEvent::Incremented => self.value + 1,
                CounterEvent::Decremented => self.value.saturating_sub(1),
                CounterEvent::Added { amount } => self.value + amount,
            };
            Self { value }
        }
    }
}
