//! Automations: a cursor-driven watcher feeding a leased job queue, and a
//! worker pool that processes each job exactly once per delivery.
//!
//! One automation watches one event type. The watcher advances a persistent
//! cursor over the type index and enqueues a job per new event — cursor bump
//! and enqueues commit together, so the cursor never passes an event whose
//! job was lost. Workers dequeue under a lease, decode the event, run the
//! handler's command, and either complete the job or push it through
//! retry/DLQ handling.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use tidemark_command::{CommandError, CommandRunner, ReadAppender};
use tidemark_core::{
    CancelToken, CodecError, Element, EventRegistry, StoredEvent, Subspace, Versionstamp,
};
use tidemark_kv::{Kv, KvError, ReadOps, TransactError, Tx};
use tidemark_store::{EventStore, StoreError};

use crate::queue::{FailureDisposition, JobQueue, LeasedJob, QueueConfig, QueueError, WorkerId};

const ERROR_BUFFER_CAP: usize = 64;

/// Automation failure, surfaced to operators through the handle's error
/// buffer.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("duplicate queue id '{0}'")]
    DuplicateQueueId(String),

    #[error("invalid automation config: {0}")]
    Config(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl TransactError for AutomationError {
    fn as_kv(&self) -> Option<&KvError> {
        match self {
            AutomationError::Kv(e) => Some(e),
            AutomationError::Store(e) => e.as_kv(),
            AutomationError::Queue(e) => e.as_kv(),
            _ => None,
        }
    }
}

/// Worker-pool and polling configuration; lease/backoff settings live in the
/// embedded [`QueueConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationConfig {
    pub num_workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub queue: QueueConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            batch_size: 64,
            poll_interval: Duration::from_millis(100),
            queue: QueueConfig::default(),
        }
    }
}

impl AutomationConfig {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.num_workers == 0 {
            return Err(AutomationError::Config("num_workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(AutomationError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(AutomationError::Config("poll_interval must be positive".into()));
        }
        self.queue.validate().map_err(AutomationError::Config)
    }
}

/// A command produced by an automation handler, run with injected
/// dependencies through the effectful command runner.
pub type EffectCommand<K, D> =
    Box<dyn Fn(&mut ReadAppender<'_, K>, &D) -> Result<(), CommandError> + Send + Sync>;

type Handler<K, E, D> =
    Arc<dyn Fn(&E) -> Result<Option<EffectCommand<K, D>>, AutomationError> + Send + Sync>;

/// Declaration of one automation: which events it watches and what it does
/// with them.
pub struct Automation<K: Kv, E, D> {
    queue_id: String,
    event_type: String,
    registry: Arc<EventRegistry<E>>,
    handler: Handler<K, E, D>,
}

impl<K, E, D> Automation<K, E, D>
where
    K: Kv,
    E: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// `registry` must know how to decode `event_type`. The handler returns
    /// `None` when an event needs no action; returning a command hands it to
    /// the runner with the automation's dependencies.
    pub fn new<F>(
        queue_id: impl Into<String>,
        event_type: impl Into<String>,
        registry: EventRegistry<E>,
        handler: F,
    ) -> Self
    where
        F: Fn(&E) -> Result<Option<EffectCommand<K, D>>, AutomationError> + Send + Sync + 'static,
    {
        Self {
            queue_id: queue_id.into(),
            event_type: event_type.into(),
            registry: Arc::new(registry),
            handler: Arc::new(handler),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    fn start(
        self,
        store: EventStore<K>,
        runner: CommandRunner<K>,
        deps: Arc<D>,
        config: AutomationConfig,
    ) -> Result<AutomationHandle, AutomationError> {
        config.validate()?;
        if !self.registry.contains(&self.event_type) {
            return Err(AutomationError::Config(format!(
                "registry has no decoder for watched type '{}'",
                self.event_type
            )));
        }

        let root = store.root().subspace(&[Element::str(self.queue_id.clone())]);
        let cursor_key = root.pack(&[Element::str("cursor")]);
        let queue = JobQueue::new(store.kv().clone(), &root, config.queue.clone());

        let token = CancelToken::new();
        let errors = ErrorBuffer::new(ERROR_BUFFER_CAP);
        let mut threads = Vec::with_capacity(config.num_workers + 1);

        let watcher = Watcher {
            store: store.clone(),
            queue: queue.clone(),
            event_type: self.event_type.clone(),
            cursor_key,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            token: token.clone(),
            errors: errors.clone(),
            queue_id: self.queue_id.clone(),
        };
        threads.push(
            thread::Builder::new()
                .name(format!("{}-watcher", self.queue_id))
                .spawn(move || watcher.run())
                .expect("failed to spawn automation watcher thread"),
        );

        for i in 0..config.num_workers {
            let worker = Worker {
                store: store.clone(),
                queue: queue.clone(),
                runner: runner.clone(),
                deps: deps.clone(),
                registry: self.registry.clone(),
                handler: self.handler.clone(),
                batch_size: config.batch_size,
                poll_interval: config.poll_interval,
                token: token.clone(),
                errors: errors.clone(),
                queue_id: self.queue_id.clone(),
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("{}-worker-{i}", self.queue_id))
                    .spawn(move || worker.run())
                    .expect("failed to spawn automation worker thread"),
            );
        }

        info!(
            queue_id = %self.queue_id,
            event_type = %self.event_type,
            workers = config.num_workers,
            "automation started"
        );
        Ok(AutomationHandle {
            queue_id: self.queue_id,
            token,
            threads,
            errors,
        })
    }
}

/// Handle controlling one running automation.
#[derive(Debug)]
pub struct AutomationHandle {
    queue_id: String,
    token: CancelToken,
    threads: Vec<thread::JoinHandle<()>>,
    errors: ErrorBuffer,
}

impl AutomationHandle {
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Signal the watcher and all workers to stop after their current step.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Join all threads and drain accumulated errors. Call [`stop`] first;
    /// `wait` by itself blocks until someone does.
    ///
    /// [`stop`]: AutomationHandle::stop
    pub fn wait(mut self) -> Vec<AutomationError> {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.errors.drain()
    }

    /// Stop and join in one step.
    pub fn stop_and_wait(self) -> Vec<AutomationError> {
        self.stop();
        self.wait()
    }

    /// Take the errors buffered so far without stopping anything.
    pub fn drain_errors(&self) -> Vec<AutomationError> {
        self.errors.drain()
    }
}

/// Registry of running automations; rejects duplicate queue ids.
pub struct AutomationRegistry<K: Kv, D> {
    store: EventStore<K>,
    runner: CommandRunner<K>,
    deps: Arc<D>,
    queue_ids: BTreeSet<String>,
    handles: Vec<AutomationHandle>,
}

impl<K, D> AutomationRegistry<K, D>
where
    K: Kv,
    D: Send + Sync + 'static,
{
    pub fn new(store: EventStore<K>, runner: CommandRunner<K>, deps: Arc<D>) -> Self {
        Self {
            store,
            runner,
            deps,
            queue_ids: BTreeSet::new(),
            handles: Vec::new(),
        }
    }

    /// Start an automation under this registry. Fails without starting
    /// anything if its queue id is already taken.
    pub fn start<E>(
        &mut self,
        automation: Automation<K, E, D>,
        config: AutomationConfig,
    ) -> Result<(), AutomationError>
    where
        E: Send + Sync + 'static,
    {
        if !self.queue_ids.insert(automation.queue_id.clone()) {
            return Err(AutomationError::DuplicateQueueId(automation.queue_id));
        }
        let handle = automation.start(
            self.store.clone(),
            self.runner.clone(),
            self.deps.clone(),
            config,
        )?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn stop_all(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }

    /// Stop everything, join all threads, and collect every buffered error.
    pub fn shutdown(mut self) -> Vec<AutomationError> {
        self.stop_all();
        let mut all = Vec::new();
        for handle in self.handles.drain(..) {
            all.extend(handle.wait());
        }
        all
    }
}

#[derive(Debug, Clone)]
struct ErrorBuffer {
    inner: Arc<Mutex<VecDeque<AutomationError>>>,
    cap: usize,
}

impl ErrorBuffer {
    fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            cap,
        }
    }

    /// Push an error, dropping the oldest one when full.
    fn push(&self, error: AutomationError) {
        let mut buf = self.inner.lock().unwrap();
        if buf.len() == self.cap {
            buf.pop_front();
        }
        buf.push_back(error);
    }

    fn drain(&self) -> Vec<AutomationError> {
        self.inner.lock().unwrap().drain(..).collect()
    }
}

struct Watcher<K: Kv> {
    store: EventStore<K>,
    queue: JobQueue<K>,
    event_type: String,
    cursor_key: Vec<u8>,
    batch_size: usize,
    poll_interval: Duration,
    token: CancelToken,
    errors: ErrorBuffer,
    queue_id: String,
}

impl<K: Kv> Watcher<K> {
    fn run(self) {
        debug!(queue_id = %self.queue_id, "watcher started");
        while !self.token.is_canceled() {
            match self.tick() {
                Ok(enqueued) => {
                    if enqueued > 0 {
                        debug!(queue_id = %self.queue_id, enqueued, "watcher enqueued jobs");
                    }
                    // A full batch means more events are likely waiting.
                    if enqueued < self.batch_size {
                        self.token.wait_timeout(self.poll_interval);
                    }
                }
                Err(e) => {
                    warn!(queue_id = %self.queue_id, error = %e, "watcher tick failed");
                    self.errors.push(e);
                    self.token.wait_timeout(self.poll_interval);
                }
            }
        }
        debug!(queue_id = %self.queue_id, "watcher stopped");
    }

    /// One transaction: read cursor, scan the type index past it, enqueue a
    /// job per event, bump the cursor. All-or-nothing.
    fn tick(&self) -> Result<usize, AutomationError> {
        self.store.kv().transact(|tx| {
            let cursor = read_cursor(tx, &self.cursor_key)?;
            let positions =
                self.store
                    .scan_type_index(tx, &self.event_type, cursor.as_ref(), self.batch_size)?;
            for position in &positions {
                self.queue.enqueue_in(tx, position)?;
            }
            if let Some(last) = positions.last() {
                tx.set(&self.cursor_key, last.as_bytes())?;
            }
            Ok(positions.len())
        })
    }
}

struct Worker<K: Kv, E, D> {
    store: EventStore<K>,
    queue: JobQueue<K>,
    runner: CommandRunner<K>,
    deps: Arc<D>,
    registry: Arc<EventRegistry<E>>,
    handler: Handler<K, E, D>,
    batch_size: usize,
    poll_interval: Duration,
    token: CancelToken,
    errors: ErrorBuffer,
    queue_id: String,
}

impl<K, E, D> Worker<K, E, D>
where
    K: Kv,
    E: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn run(self) {
        let worker_id = WorkerId::new();
        debug!(queue_id = %self.queue_id, worker = %worker_id, "worker started");
        while !self.token.is_canceled() {
            match self.queue.dequeue(worker_id, self.batch_size) {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(&job) {
                        self.errors.push(e);
                    }
                }
                Ok(None) => {
                    self.token.wait_timeout(self.poll_interval);
                }
                Err(e) => {
                    warn!(queue_id = %self.queue_id, error = %e, "dequeue failed");
                    self.errors.push(e.into());
                    self.token.wait_timeout(self.poll_interval);
                }
            }
        }
        debug!(queue_id = %self.queue_id, worker = %worker_id, "worker stopped");
    }

    fn process(&self, job: &LeasedJob) -> Result<(), AutomationError> {
        let outcome = self.handle_job(job);
        match outcome {
            Ok(()) => match self.queue.complete(job) {
                Ok(()) => Ok(()),
                // Someone else owns the job now; whatever we did locally is
                // theirs to redo, so stay silent.
                Err(QueueError::LeaseStolen) => {
                    debug!(queue_id = %self.queue_id, position = %job.position, "lease stolen before completion");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            Err(error) => {
                let message = error.to_string();
                match self.queue.fail(job, &message) {
                    Ok(FailureDisposition::Retried { attempts, backoff }) => {
                        warn!(
                            queue_id = %self.queue_id,
                            position = %job.position,
                            attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %message,
                            "job failed, retrying"
                        );
                        Err(error)
                    }
                    Ok(FailureDisposition::DeadLettered { attempts }) => {
                        warn!(
                            queue_id = %self.queue_id,
                            position = %job.position,
                            attempts,
                            error = %message,
                            "job dead-lettered"
                        );
                        Err(error)
                    }
                    Err(QueueError::LeaseStolen) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn handle_job(&self, job: &LeasedJob) -> Result<(), AutomationError> {
        let event: StoredEvent = self.store.fetch_event(&job.position)?;
        let decoded = self.registry.decode(&event)?;
        match (self.handler)(&decoded)? {
            None => Ok(()),
            Some(command) => {
                self.runner
                    .run_with_effect(self.deps.as_ref(), |appender, deps| {
                        command(appender, deps)
                    })?;
                Ok(())
            }
        }
    }
}

fn decode_cursor(bytes: Option<Vec<u8>>) -> Result<Option<Versionstamp>, AutomationError> {
    match bytes {
        None => Ok(None),
        Some(bytes) => Versionstamp::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|e| AutomationError::Store(StoreError::Corrupt(format!("cursor: {e}")))),
    }
}

fn read_cursor(tx: &mut impl Tx, key: &[u8]) -> Result<Option<Versionstamp>, AutomationError> {
    decode_cursor(tx.get(key)?)
}

/// Read an automation's persisted cursor (operator/test helper).
pub fn load_cursor<K: Kv>(
    store: &EventStore<K>,
    queue_id: &str,
) -> Result<Option<Versionstamp>, AutomationError> {
    let root: Subspace = store.root().subspace(&[Element::str(queue_id)]);
    let key = root.pack(&[Element::str("cursor")]);
    let mut snap = store.kv().snapshot().map_err(AutomationError::Kv)?;
    decode_cursor(snap.get(&key).map_err(AutomationError::Kv)?)
}
