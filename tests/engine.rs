//! End-to-end tests driving grains, actors and observers through the
//! public API with the in-memory ports.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventfold_grain::ports::{ArchiveStore, ObserverSnapshotStore};
use eventfold_grain::{
    Aggregate, BoxError, CommandContext, EventRegistry, EventUid, FollowUnit, FullyEvent, Grain,
    GrainError, GrainOptions, InMemoryPorts, ObserverGroup, ObserverHandler, ObserverOptions,
    ObserverPorts, ObserverSnapshot, ObserverUnit, WireEnvelope, spawn_actor,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Account {
    balance: i64,
    deposits: u32,
}

#[derive(Debug, Clone)]
enum AccountCommand {
    Deposit(i64),
    Withdraw(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("insufficient funds")]
    InsufficientFunds,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
    type Id = String;
    type Command = AccountCommand;
    type DomainEvent = AccountEvent;
    type Error = AccountError;

    fn handle(&self, cmd: AccountCommand) -> Result<Vec<AccountEvent>, AccountError> {
        match cmd {
            AccountCommand::Deposit(amount) => Ok(vec![AccountEvent::Deposited { amount }]),
            AccountCommand::Withdraw(amount) if amount > self.balance => {
                Err(AccountError::InsufficientFunds)
            }
            AccountCommand::Withdraw(amount) => Ok(vec![AccountEvent::Withdrawn { amount }]),
        }
    }

    fn apply(mut self, event: &AccountEvent) -> Self {
        match event {
            AccountEvent::Deposited { amount } => {
                self.balance += amount;
                self.deposits += 1;
            }
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
        self
    }
}

type Ports = InMemoryPorts<String, Account>;

fn id() -> String {
    "acct-1".to_string()
}

async fn activate(ports: &Ports, options: GrainOptions) -> Grain<Account> {
    activate_with(ports, options, FollowUnit::new()).await
}

async fn activate_with(
    ports: &Ports,
    options: GrainOptions,
    follow: FollowUnit<String>,
) -> Grain<Account> {
    Grain::activate(id(), ports.grain_ports(), follow, Arc::new(options))
        .await
        .expect("activation should succeed")
}

/// Context with a deterministic token and timestamp for the `n`-th deposit.
fn ctx(n: i64) -> CommandContext {
    CommandContext::default().with_unique(EventUid::new(format!("dep-{n}"), 1_000 + n))
}

async fn versions(ports: &Ports) -> Vec<i64> {
    ports
        .events
        .records(&id())
        .await
        .iter()
        .map(|r| r.base.version)
        .collect()
}

#[tokio::test]
async fn versions_are_contiguous_and_replay_restores_state() {
    let ports = Ports::new();
    let mut grain = activate(&ports, GrainOptions::default()).await;
    for n in 1..=4 {
        grain
            .execute(AccountCommand::Deposit(n * 10), &ctx(n))
            .await
            .expect("deposit");
    }
    grain
        .execute(AccountCommand::Withdraw(30), &ctx(5))
        .await
        .expect("withdraw");
    let live = grain.state().clone();
    drop(grain);

    assert_eq!(versions(&ports).await, vec![1, 2, 3, 4, 5]);
    let replayed = activate(&ports, GrainOptions::default()).await;
    assert_eq!(replayed.version(), 5);
    assert_eq!(replayed.state(), &live);
    assert_eq!(live.balance, 70);
}

#[tokio::test]
async fn repeated_unique_id_yields_one_event() {
    let ports = Ports::new();
    let mut grain = activate(&ports, GrainOptions::default()).await;

    let first = grain
        .execute(AccountCommand::Deposit(5), &ctx(1))
        .await
        .expect("first");
    let second = grain
        .execute(AccountCommand::Deposit(5), &ctx(1))
        .await
        .expect("second");

    assert_eq!(first, vec![AccountEvent::Deposited { amount: 5 }]);
    assert!(second.is_empty());
    assert_eq!(grain.state().balance, 5);
    assert_eq!(versions(&ports).await, vec![1]);
}

#[tokio::test]
async fn rolled_back_transaction_leaves_no_trace() {
    let ports = Ports::new();
    let mut grain = activate(&ports, GrainOptions::default()).await;
    grain
        .execute(AccountCommand::Deposit(100), &ctx(1))
        .await
        .expect("seed");

    grain.begin_transaction("tx-1").await.expect("begin");
    grain
        .tx_raise_event(AccountEvent::Withdrawn { amount: 40 }, None)
        .expect("raise");
    grain
        .tx_raise_event(AccountEvent::Withdrawn { amount: 50 }, None)
        .expect("raise");
    assert_eq!(grain.state().balance, 10);
    grain.rollback_transaction("tx-1").await.expect("rollback");

    assert_eq!(grain.state().balance, 100);
    assert_eq!(grain.version(), 1);
    assert_eq!(versions(&ports).await, vec![1]);

    grain.begin_transaction("tx-2").await.expect("begin again");
    grain
        .tx_raise_event(AccountEvent::Withdrawn { amount: 25 }, None)
        .expect("raise");
    grain.commit_transaction("tx-2").await.expect("commit");
    grain.finish_transaction("tx-2").await.expect("finish");
    assert_eq!(versions(&ports).await, vec![1, 2]);
    assert_eq!(ports.events.transactional_appends().await, 1);
}

#[tokio::test]
async fn archive_briefs_and_snapshots_follow_their_intervals() {
    let ports = Ports::new();
    let mut options = GrainOptions::default();
    options.snapshot.version_interval = 10;
    options.archive.enabled = true;
    options.archive.interval = Duration::ZERO;
    options.archive.interval_version = 5;
    let mut grain = activate(&ports, options).await;

    for n in 1..=5 {
        grain
            .execute(AccountCommand::Deposit(1), &ctx(n))
            .await
            .expect("deposit");
    }
    let briefs = ports.archives.get_brief_list(&id()).await.expect("briefs");
    assert_eq!(briefs.len(), 1);
    assert_eq!((briefs[0].start_version, briefs[0].end_version), (1, 5));
    assert!(ports.snapshots.stored(&id()).await.is_none());

    for n in 6..=9 {
        grain
            .execute(AccountCommand::Deposit(1), &ctx(n))
            .await
            .expect("deposit");
    }
    assert_eq!(ports.archives.get_brief_list(&id()).await.expect("briefs").len(), 1);
    assert!(ports.snapshots.stored(&id()).await.is_none());

    grain
        .execute(AccountCommand::Deposit(1), &ctx(10))
        .await
        .expect("deposit");
    let briefs = ports.archives.get_brief_list(&id()).await.expect("briefs");
    assert_eq!(briefs.len(), 2);
    assert_eq!((briefs[1].start_version, briefs[1].end_version), (6, 10));
    let snapshot = ports.snapshots.stored(&id()).await.expect("snapshot at 10");
    assert_eq!(snapshot.base.version, 10);
    assert_eq!(snapshot.state.deposits, 10);
}

/// Observer whose durable version is set by the test.
struct ManualObserver {
    version: AtomicI64,
}

#[async_trait]
impl ObserverUnit<String> for ManualObserver {
    fn name(&self) -> &str {
        "manual"
    }

    async fn tell(&self, _state_id: &String, _envelope: Bytes) -> Result<(), GrainError> {
        Ok(())
    }

    async fn get_and_save_version(
        &self,
        _state_id: &String,
        _compare_version: i64,
    ) -> Result<i64, GrainError> {
        Ok(self.version.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn compaction_waits_for_lagging_observer() {
    let ports = Ports::new();
    let mut options = GrainOptions::default();
    options.archive.enabled = true;
    options.archive.interval = Duration::ZERO;
    options.archive.interval_version = 2;
    options.archive.max_snapshot_archive_records = 1;
    let observer = Arc::new(ManualObserver {
        version: AtomicI64::new(0),
    });
    let follow = FollowUnit::new().with_observer(observer.clone());
    let mut grain = activate_with(&ports, options, follow).await;

    for n in 1..=2 {
        grain
            .execute(AccountCommand::Deposit(1), &ctx(n))
            .await
            .expect("deposit");
    }
    assert_eq!(versions(&ports).await, vec![1, 2]);
    assert!(!grain.archive_briefs()[0].event_is_cleared);

    observer.version.store(2, Ordering::SeqCst);
    for n in 3..=4 {
        grain
            .execute(AccountCommand::Deposit(1), &ctx(n))
            .await
            .expect("deposit");
    }
    assert_eq!(versions(&ports).await, vec![3, 4]);
    assert!(grain.archive_briefs()[0].event_is_cleared);

    let err = grain
        .raise_event(
            AccountEvent::Deposited { amount: 1 },
            Some(EventUid::new("late", 1_000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GrainError::EventIsCleared { .. }));
}

#[tokio::test]
async fn concurrent_submissions_share_one_append() {
    let ports = Ports::new();
    let grain = activate(&ports, GrainOptions::default()).await;
    let handle = spawn_actor(grain);
    let deposit = |n: i64| {
        let handle = handle.clone();
        async move {
            handle
                .concurrent_execute(AccountCommand::Deposit(n), CommandContext::default())
                .await
        }
    };

    // Every submission is queued on the first poll, before the actor
    // drains the channel.
    let results = tokio::join!(deposit(1), deposit(2), deposit(3), deposit(4), deposit(5));
    for result in [results.0, results.1, results.2, results.3, results.4] {
        result.expect("deposit");
    }

    assert_eq!(versions(&ports).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(ports.events.transactional_appends().await, 1);
    assert_eq!(handle.state().await.expect("state").balance, 15);
}

#[tokio::test]
async fn failed_batch_retries_each_caller_in_order() {
    let ports = Ports::new();
    let grain = activate(&ports, GrainOptions::default()).await;
    let handle = spawn_actor(grain);
    ports.events.fail_next_transactional(1).await;

    let mut tasks = Vec::new();
    for n in 1..=4 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .concurrent_execute(AccountCommand::Deposit(n), CommandContext::default())
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("deposit");
    }

    let amounts: Vec<i64> = ports
        .events
        .records(&id())
        .await
        .iter()
        .map(|r| {
            match r.decode::<AccountEvent>().expect("decode").event {
                AccountEvent::Deposited { amount } => amount,
                AccountEvent::Withdrawn { amount } => -amount,
            }
        })
        .collect();
    assert_eq!(amounts, vec![1, 2, 3, 4]);
}

struct Ledger {
    seen: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl ObserverHandler<String> for Ledger {
    const NAME: &'static str = "ledger";
    type Event = AccountEvent;

    async fn on_event(&mut self, event: &FullyEvent<String, AccountEvent>) -> Result<(), BoxError> {
        self.seen
            .lock()
            .map_err(|_| "ledger poisoned")?
            .push(event.base.version);
        Ok(())
    }
}

#[tokio::test]
async fn observer_backfills_missed_events() {
    let ports = Ports::new();
    let mut grain = activate(&ports, GrainOptions::default()).await;
    for n in 1..=6 {
        grain
            .execute(AccountCommand::Deposit(n), &ctx(n))
            .await
            .expect("deposit");
    }

    let mut checkpoint = ObserverSnapshot::new(id());
    checkpoint.version = 3;
    checkpoint.doing_version = 3;
    ports
        .observer_snapshots
        .insert("ledger", &checkpoint)
        .await
        .expect("seed checkpoint");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer_ports = ObserverPorts {
        registry: Arc::new(EventRegistry::json(&["Deposited", "Withdrawn"])),
        events: ports.events.clone(),
        snapshots: ports.observer_snapshots.clone(),
        options: Arc::new(ObserverOptions::default()),
    };
    let group = {
        let seen = seen.clone();
        ObserverGroup::new(move |_: &String| Ledger { seen: seen.clone() }, observer_ports)
    };

    let records = ports.events.records(&id()).await;
    let envelope = WireEnvelope::from_record(&records[5])
        .and_then(|e| e.encode())
        .expect("envelope");
    group.tell(&id(), envelope).await.expect("tell");

    assert_eq!(*seen.lock().expect("lock"), vec![4, 5, 6]);
    assert_eq!(group.snapshot(&id()).await.expect("snapshot").version, 6);
}
