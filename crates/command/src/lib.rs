//! The command runner: read-then-conditionally-append with retry.
//!
//! A command reads events through a [`ReadAppender`], decides, and appends.
//! The appender remembers what the command read; the subsequent append
//! commits only if nothing matching that read arrived in between. A failed
//! condition surfaces as [`CommandError::ConditionFailed`] and is retried for
//! pure commands, so callers get serializable behavior scoped to exactly the
//! predicate they depend on.

use std::fmt;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::debug;

use tidemark_core::{AppendCondition, Query, StoredEvent, UncommittedEvent, Versionstamp};
use tidemark_kv::Kv;
use tidemark_store::{EventStore, ReadOptions, StoreError};

mod retry;

pub use retry::{BackoffStrategy, RetryPolicy};

/// Command-level failure.
#[derive(Debug, Error)]
pub enum CommandError {
    /// An event matching the command's read arrived before its append
    /// committed.
    #[error("optimistic concurrency check failed")]
    ConditionFailed,

    /// The command itself refused the request (domain validation).
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(StoreError),
}

impl CommandError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConditionFailed => CommandError::ConditionFailed,
            other => CommandError::Store(other),
        }
    }
}

/// Handler verdict while streaming events: keep going or short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFlow {
    Continue,
    Stop,
}

/// The capability object handed to a command: read the log, then append under
/// the condition implied by what was read.
pub struct ReadAppender<'a, K: Kv> {
    store: &'a EventStore<K>,
    last_query: Option<Query>,
    last_seen: Option<Versionstamp>,
}

impl<'a, K: Kv> ReadAppender<'a, K> {
    fn new(store: &'a EventStore<K>) -> Self {
        Self {
            store,
            last_query: None,
            last_seen: None,
        }
    }

    /// Stream events matching `query` through `handler`, tracking the
    /// position of the last event the handler saw.
    pub fn read_events<F>(&mut self, query: &Query, mut handler: F) -> Result<(), CommandError>
    where
        F: FnMut(&StoredEvent) -> Result<ReadFlow, CommandError>,
    {
        let iter = self.store.read(query, ReadOptions::new())?;
        self.last_query = Some(query.clone());
        for item in iter {
            let event = item?;
            self.last_seen = Some(event.position);
            if handler(&event)? == ReadFlow::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Position of the last event yielded to a handler, if any.
    pub fn last_seen(&self) -> Option<Versionstamp> {
        self.last_seen
    }

    /// Append events. If this command read earlier, the append is guarded:
    /// it fails if the last query matches anything past the last seen
    /// position.
    pub fn append_events(&mut self, events: &[UncommittedEvent]) -> Result<(), CommandError> {
        match &self.last_query {
            Some(query) => {
                let mut condition = AppendCondition::new(query.clone());
                condition.after = self.last_seen;
                self.store.append(events, Some(&condition))?;
            }
            None => self.store.append(events, None)?,
        }
        Ok(())
    }

    /// Append without a condition, even after a read.
    pub fn append_events_no_condition(
        &mut self,
        events: &[UncommittedEvent],
    ) -> Result<(), CommandError> {
        self.store.append(events, None)?;
        Ok(())
    }
}

type RetryPredicate = Arc<dyn Fn(&CommandError) -> bool + Send + Sync>;

/// Retry configuration for one class of commands.
#[derive(Clone)]
pub struct CommandOptions {
    pub retry: RetryPolicy,
    predicate: RetryPredicate,
}

impl CommandOptions {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            predicate: default_predicate(),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(RetryPolicy::no_retry())
    }

    /// Replace the default "retry only condition failures" predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CommandError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    fn should_retry(&self, error: &CommandError) -> bool {
        (self.predicate)(error)
    }
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn default_predicate() -> RetryPredicate {
    Arc::new(|e| matches!(e, CommandError::ConditionFailed))
}

/// Runs commands against one event store.
///
/// Pure commands retry condition failures; commands with side effects get a
/// single attempt unless their options say otherwise, since the runner must
/// assume the effects are not idempotent.
pub struct CommandRunner<K: Kv> {
    store: EventStore<K>,
    pure_opts: CommandOptions,
    effect_opts: CommandOptions,
}

impl<K: Kv> Clone for CommandRunner<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pure_opts: self.pure_opts.clone(),
            effect_opts: self.effect_opts.clone(),
        }
    }
}

impl<K: Kv> CommandRunner<K> {
    pub fn new(store: EventStore<K>) -> Self {
        Self {
            store,
            pure_opts: CommandOptions::default(),
            effect_opts: CommandOptions::no_retry(),
        }
    }

    pub fn with_pure_options(mut self, opts: CommandOptions) -> Self {
        self.pure_opts = opts;
        self
    }

    pub fn with_effect_options(mut self, opts: CommandOptions) -> Self {
        self.effect_opts = opts;
        self
    }

    pub fn store(&self) -> &EventStore<K> {
        &self.store
    }

    /// Run a side-effect-free command with the default retry policy.
    pub fn run_pure<T, F>(&self, command: F) -> Result<T, CommandError>
    where
        F: Fn(&mut ReadAppender<'_, K>) -> Result<T, CommandError>,
    {
        self.run_with_options(&self.pure_opts, command)
    }

    /// Run a command that performs side effects through `deps`. No retries
    /// by default.
    pub fn run_with_effect<T, D, F>(&self, deps: &D, command: F) -> Result<T, CommandError>
    where
        F: Fn(&mut ReadAppender<'_, K>, &D) -> Result<T, CommandError>,
    {
        self.run_with_options(&self.effect_opts, |appender| command(appender, deps))
    }

    /// Run with explicit per-command options, overriding the runner
    /// defaults.
    pub fn run_with_options<T, F>(
        &self,
        opts: &CommandOptions,
        command: F,
    ) -> Result<T, CommandError>
    where
        F: Fn(&mut ReadAppender<'_, K>) -> Result<T, CommandError>,
    {
        let attempts = opts.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            // A fresh appender per attempt: no state leaks across retries.
            let mut appender = ReadAppender::new(&self.store);
            match command(&mut appender) {
                Ok(value) => return Ok(value),
                Err(error) if attempt < attempts && opts.should_retry(&error) => {
                    let delay = opts.retry.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying command after concurrency failure"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tidemark_kv::MemKv;

    fn setup() -> (EventStore<MemKv>, CommandRunner<MemKv>) {
        let store = EventStore::new(Arc::new(MemKv::new()), "cmd");
        (store.clone(), CommandRunner::new(store))
    }

    fn list_created(list: &str) -> UncommittedEvent {
        UncommittedEvent::new("list_created", [format!("list:{list}")], b"{}".to_vec())
    }

    fn creation_query(list: &str) -> Query {
        Query::single(tidemark_core::QueryItem::new(
            ["list_created"],
            [format!("list:{list}")],
        ))
    }

    #[test]
    fn command_appends_after_empty_read() {
        let (store, runner) = setup();

        runner
            .run_pure(|appender| {
                let mut exists = false;
                appender.read_events(&creation_query("1"), |_| {
                    exists = true;
                    Ok(ReadFlow::Stop)
                })?;
                if exists {
                    return Err(CommandError::rejected("list already exists"));
                }
                appender.append_events(&[list_created("1")])
            })
            .unwrap();

        assert_eq!(
            store.read_all(ReadOptions::new()).unwrap().count(),
            1
        );
    }

    #[test]
    fn duplicate_creation_is_rejected_by_the_command() {
        let (_store, runner) = setup();
        let create = |appender: &mut ReadAppender<'_, MemKv>| {
            let mut exists = false;
            appender.read_events(&creation_query("7"), |_| {
                exists = true;
                Ok(ReadFlow::Stop)
            })?;
            if exists {
                return Err(CommandError::rejected("list already exists"));
            }
            appender.append_events(&[list_created("7")])
        };

        runner.run_pure(create).unwrap();
        let err = runner.run_pure(create).unwrap_err();
        assert!(matches!(err, CommandError::Rejected(_)));
    }

    #[test]
    fn interleaved_writer_triggers_retry_and_second_attempt_succeeds() {
        let (store, runner) = setup();
        let attempts = AtomicUsize::new(0);

        runner
            .run_pure(|appender| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                appender.read_events(&creation_query("9"), |_| Ok(ReadFlow::Continue))?;
                if attempt == 0 {
                    // Another writer lands between this command's read and
                    // its append.
                    store.append(&[list_created("9")], None).map_err(CommandError::from)?;
                }
                appender.append_events(&[UncommittedEvent::new(
                    "item_added",
                    ["list:9"],
                    b"{}".to_vec(),
                )])
            })
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(store.read_all(ReadOptions::new()).unwrap().count(), 2);
    }

    #[test]
    fn append_with_after_does_not_conflict_on_already_seen_events() {
        let (store, runner) = setup();
        store.append(&[list_created("3")], None).unwrap();

        // The command reads the existing event; its condition starts past it.
        runner
            .run_pure(|appender| {
                appender.read_events(&creation_query("3"), |_| Ok(ReadFlow::Continue))?;
                assert!(appender.last_seen().is_some());
                appender.append_events(&[UncommittedEvent::new(
                    "item_added",
                    ["list:3"],
                    b"{}".to_vec(),
                )])
            })
            .unwrap();

        assert_eq!(store.read_all(ReadOptions::new()).unwrap().count(), 2);
    }

    #[test]
    fn effect_commands_are_not_retried_by_default() {
        let (_store, runner) = setup();
        let calls = AtomicUsize::new(0);

        let err = runner
            .run_with_effect(&(), |_appender, _deps| -> Result<(), CommandError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CommandError::ConditionFailed)
            })
            .unwrap_err();

        assert!(matches!(err, CommandError::ConditionFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_command_options_override_the_defaults() {
        let (_store, runner) = setup();
        let calls = AtomicUsize::new(0);

        let opts = CommandOptions::new(RetryPolicy::fixed(3, Duration::from_millis(1)));
        let err = runner
            .run_with_options(&opts, |_appender| -> Result<(), CommandError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CommandError::ConditionFailed)
            })
            .unwrap_err();

        assert!(matches!(err, CommandError::ConditionFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejections_are_never_retried() {
        let (_store, runner) = setup();
        let calls = AtomicUsize::new(0);

        let err = runner
            .run_pure(|_appender| -> Result<(), CommandError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CommandError::rejected("no"))
            })
            .unwrap_err();

        assert!(matches!(err, CommandError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_condition_append_ignores_interleaved_writes() {
        let (store, runner) = setup();

        runner
            .run_pure(|appender| {
                appender.read_events(&creation_query("5"), |_| Ok(ReadFlow::Continue))?;
                store.append(&[list_created("5")], None).map_err(CommandError::from)?;
                appender.append_events_no_condition(&[list_created("5")])
            })
            .unwrap();

        assert_eq!(store.read_all(ReadOptions::new()).unwrap().count(), 2);
    }
}
