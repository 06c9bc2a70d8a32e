//! End-to-end automation scenarios: watcher → queue → workers → commands.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use tidemark_automation::{
    load_cursor, Automation, AutomationConfig, AutomationError, AutomationRegistry, EffectCommand,
    JobQueue, QueueConfig,
};
use tidemark_command::CommandRunner;
use tidemark_core::{Element, EventRegistry, Query, Subspace, UncommittedEvent};
use tidemark_kv::MemKv;
use tidemark_store::{EventStore, ReadOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order: String,
}

#[derive(Debug, Clone, PartialEq)]
enum AppEvent {
    Order(OrderPlaced),
}

#[derive(Default)]
struct Deps {
    commands_run: AtomicUsize,
}

fn registry() -> EventRegistry<AppEvent> {
    let mut reg = EventRegistry::new();
    reg.register("order_placed", AppEvent::Order);
    reg
}

fn setup() -> (EventStore<MemKv>, CommandRunner<MemKv>, Arc<Deps>) {
    tidemark_observability::init_for_tests();
    let store = EventStore::new(Arc::new(MemKv::new()), "app");
    let runner = CommandRunner::new(store.clone());
    (store, runner, Arc::new(Deps::default()))
}

fn order_event(order: &str) -> UncommittedEvent {
    UncommittedEvent::new(
        "order_placed",
        [format!("order:{order}")],
        serde_json::to_vec(&OrderPlaced {
            order: order.to_string(),
        })
        .unwrap(),
    )
}

fn fast_config() -> AutomationConfig {
    AutomationConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_queue(QueueConfig {
            retry_base_wait: Duration::from_millis(10),
            ..QueueConfig::default()
        })
}

fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn watched_event_is_handled_exactly_once_and_cursor_advances() -> Result<()> {
    let (store, runner, deps) = setup();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_handler = seen.clone();

    let automation = Automation::new(
        "billing",
        "order_placed",
        registry(),
        move |event: &AppEvent| {
            let AppEvent::Order(placed) = event;
            seen_by_handler.lock().unwrap().push(placed.order.clone());
            Ok(None)
        },
    );

    let mut automations = AutomationRegistry::new(store.clone(), runner, deps);
    automations.start(automation, fast_config())?;

    store.append(&[order_event("1001")], None)?;

    wait_until("handler invocation", || !seen.lock().unwrap().is_empty());
    // Give duplicate deliveries a chance to show up before asserting.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(seen.lock().unwrap().as_slice(), ["1001".to_string()]);

    // The job is gone and the cursor points at (or past) the event.
    let queue_root: Subspace = store.root().subspace(&[Element::str("billing")]);
    let queue = JobQueue::new(store.kv().clone(), &queue_root, QueueConfig::default());
    wait_until("job completion", || {
        let stats = queue.stats().unwrap();
        stats.pending == 0 && stats.leased == 0
    });

    let head = store.head()?.expect("one event");
    let cursor = load_cursor(&store, "billing")?.expect("cursor written");
    assert!(cursor >= head);

    let errors = automations.shutdown();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    Ok(())
}

#[test]
fn handler_commands_append_follow_up_events() -> Result<()> {
    let (store, runner, deps) = setup();

    let automation = Automation::new(
        "invoicing",
        "order_placed",
        registry(),
        move |event: &AppEvent| {
            let AppEvent::Order(placed) = event;
            let order = placed.order.clone();
            let command: EffectCommand<MemKv, Deps> = Box::new(move |appender, deps| {
                deps.commands_run.fetch_add(1, Ordering::SeqCst);
                appender.append_events_no_condition(&[UncommittedEvent::new(
                    "invoice_issued",
                    [format!("order:{order}")],
                    b"{}".to_vec(),
                )])
            });
            Ok(Some(command))
        },
    );

    let mut automations = AutomationRegistry::new(store.clone(), runner, deps.clone());
    automations.start(automation, fast_config())?;

    store.append(&[order_event("2002")], None)?;

    wait_until("follow-up event", || {
        store
            .read(&Query::of_types(["invoice_issued"]), ReadOptions::new())
            .unwrap()
            .count()
            == 1
    });
    assert_eq!(deps.commands_run.load(Ordering::SeqCst), 1);

    automations.shutdown();
    Ok(())
}

#[test]
fn failing_handler_exhausts_attempts_into_the_dlq() -> Result<()> {
    let (store, runner, deps) = setup();
    let attempts_seen = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts_seen.clone();

    let automation = Automation::new(
        "doomed",
        "order_placed",
        registry(),
        move |_event: &AppEvent| {
            attempts_in_handler.fetch_add(1, Ordering::SeqCst);
            Err(AutomationError::Handler("invoice service down".into()))
        },
    );

    let config = fast_config().with_queue(QueueConfig {
        max_attempts: 2,
        retry_base_wait: Duration::from_millis(10),
        ..QueueConfig::default()
    });
    let mut automations = AutomationRegistry::new(store.clone(), runner, deps);
    automations.start(automation, config)?;

    store.append(&[order_event("3003")], None)?;

    let queue_root: Subspace = store.root().subspace(&[Element::str("doomed")]);
    let queue = JobQueue::new(store.kv().clone(), &queue_root, QueueConfig::default());

    wait_until("dead-lettered job", || {
        queue.stats().unwrap().dead_lettered == 1
    });
    assert_eq!(attempts_seen.load(Ordering::SeqCst), 2);

    let entries: Vec<_> = queue
        .dead_letters(8)?
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 2);
    assert!(entries[0].error.contains("invoice service down"));

    let head = store.head()?.expect("event appended");
    assert_eq!(entries[0].position, head);

    // The primary queue entry is gone.
    let stats = queue.stats()?;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.leased, 0);

    // Operators see the handler failures.
    let errors = automations.shutdown();
    assert!(!errors.is_empty());
    Ok(())
}

#[test]
fn cursor_survives_restart_and_skips_processed_events() -> Result<()> {
    let (store, runner, deps) = setup();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let make_automation = |seen: Arc<Mutex<Vec<String>>>| {
        Automation::new(
            "shipping",
            "order_placed",
            registry(),
            move |event: &AppEvent| {
                let AppEvent::Order(placed) = event;
                seen.lock().unwrap().push(placed.order.clone());
                Ok(None)
            },
        )
    };

    // First run: process E1, then stop.
    let mut automations =
        AutomationRegistry::new(store.clone(), runner.clone(), deps.clone());
    automations.start(make_automation(seen.clone()), fast_config())?;
    store.append(&[order_event("first")], None)?;
    wait_until("first event processed", || seen.lock().unwrap().len() == 1);
    automations.shutdown();

    // E2 arrives while the automation is down.
    store.append(&[order_event("second")], None)?;

    // Restart under the same queue id.
    let mut automations = AutomationRegistry::new(store.clone(), runner, deps);
    automations.start(make_automation(seen.clone()), fast_config())?;
    wait_until("second event processed", || seen.lock().unwrap().len() >= 2);
    thread::sleep(Duration::from_millis(100));

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        ["first".to_string(), "second".to_string()]
    );
    automations.shutdown();
    Ok(())
}

#[test]
fn duplicate_queue_ids_are_rejected_at_start() -> Result<()> {
    let (store, runner, deps) = setup();
    let mut automations = AutomationRegistry::new(store, runner, deps);

    let noop = |_: &AppEvent| Ok(None);
    automations.start(
        Automation::new("dupe", "order_placed", registry(), noop),
        fast_config(),
    )?;

    let err = automations
        .start(
            Automation::new("dupe", "order_placed", registry(), noop),
            fast_config(),
        )
        .unwrap_err();
    assert!(matches!(err, AutomationError::DuplicateQueueId(id) if id == "dupe"));

    automations.shutdown();
    Ok(())
}
