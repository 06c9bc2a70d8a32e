//! Persistent read models: named projections replaying the log in order.
//!
//! A read model owns `<ns>/rm/<name>/…`: a cursor plus a data subspace its
//! handler may write to. Each tick processes a batch of new events and bumps
//! the cursor in the same transaction, so a crash or restart replays nothing
//! and skips nothing — the projection is exactly the fold of the log prefix
//! up to its cursor.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use tidemark_core::{
    CancelToken, CodecError, Element, EventRegistry, Subspace, Versionstamp,
};
use tidemark_kv::{Kv, KvError, ReadOps, TransactError, Tx};
use tidemark_store::{EventStore, StoreError};

/// Read-model failure.
#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("invalid read model config: {0}")]
    Config(String),

    /// The projection handler refused an event; the whole tick is rolled
    /// back.
    #[error("projection handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl ReadModelError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

impl TransactError for ReadModelError {
    fn as_kv(&self) -> Option<&KvError> {
        match self {
            ReadModelError::Kv(e) => Some(e),
            ReadModelError::Store(e) => e.as_kv(),
            _ => None,
        }
    }
}

/// Polling configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadModelConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for ReadModelConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ReadModelConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn validate(&self) -> Result<(), ReadModelError> {
        if self.batch_size == 0 {
            return Err(ReadModelError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ReadModelError::Config("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Transactional view handed to the projection handler, scoped to the read
/// model's data subspace. The handler cannot reach keys outside it.
pub struct ScopedTx<'a> {
    tx: &'a mut dyn Tx,
    data: &'a Subspace,
}

impl<'a> ScopedTx<'a> {
    fn new(tx: &'a mut dyn Tx, data: &'a Subspace) -> Self {
        Self { tx, data }
    }

    pub fn get(&mut self, key: &[Element]) -> Result<Option<Vec<u8>>, ReadModelError> {
        Ok(self.tx.get(&self.data.pack(key))?)
    }

    pub fn get_json<V: DeserializeOwned>(
        &mut self,
        key: &[Element],
    ) -> Result<Option<V>, ReadModelError> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
        }
    }

    pub fn set(&mut self, key: &[Element], value: &[u8]) -> Result<(), ReadModelError> {
        Ok(self.tx.set(&self.data.pack(key), value)?)
    }

    pub fn set_json<V: Serialize>(
        &mut self,
        key: &[Element],
        value: &V,
    ) -> Result<(), ReadModelError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| ReadModelError::Codec(CodecError::Malformed(e.to_string())))?;
        self.set(key, &bytes)
    }

    pub fn clear(&mut self, key: &[Element]) {
        self.tx.clear(&self.data.pack(key));
    }

    /// Clear every key below `prefix` within the data subspace.
    pub fn clear_prefix(&mut self, prefix: &[Element]) {
        let (begin, end) = self.data.subspace(prefix).range();
        self.tx.clear_range(&begin, &end);
    }
}

type ProjectionHandler<E> =
    Arc<dyn Fn(&mut ScopedTx<'_>, &E) -> Result<(), ReadModelError> + Send + Sync>;

/// A named projection over the event log.
pub struct ReadModel<K: Kv, E> {
    name: String,
    store: EventStore<K>,
    registry: Arc<EventRegistry<E>>,
    handler: ProjectionHandler<E>,
    config: ReadModelConfig,
    cursor_key: Vec<u8>,
    data: Subspace,
}

impl<K: Kv, E> Clone for ReadModel<K, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            cursor_key: self.cursor_key.clone(),
            data: self.data.clone(),
        }
    }
}

impl<K, E> ReadModel<K, E>
where
    K: Kv,
    E: Send + Sync + 'static,
{
    /// The registry defines which event types this projection watches; the
    /// handler folds each decoded event into the data subspace.
    pub fn new<F>(
        store: EventStore<K>,
        name: impl Into<String>,
        registry: EventRegistry<E>,
        config: ReadModelConfig,
        handler: F,
    ) -> Result<Self, ReadModelError>
    where
        F: Fn(&mut ScopedTx<'_>, &E) -> Result<(), ReadModelError> + Send + Sync + 'static,
    {
        config.validate()?;
        if registry.is_empty() {
            return Err(ReadModelError::Config(
                "read model watches no event types".into(),
            ));
        }

        let name = name.into();
        let space = store
            .root()
            .subspace(&[Element::str("rm"), Element::str(name.clone())]);
        Ok(Self {
            cursor_key: space.pack(&[Element::str("cursor")]),
            data: space.subspace(&[Element::str("data")]),
            name,
            store,
            registry: Arc::new(registry),
            handler: Arc::new(handler),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last processed position, `None` before the first tick.
    pub fn cursor(&self) -> Result<Option<Versionstamp>, ReadModelError> {
        let mut snap = self.store.kv().snapshot()?;
        match snap.get(&self.cursor_key)? {
            None => Ok(None),
            Some(bytes) => Versionstamp::try_from(bytes.as_slice())
                .map(Some)
                .map_err(|e| ReadModelError::Store(StoreError::Corrupt(format!("cursor: {e}")))),
        }
    }

    /// Typed point lookups in the data subspace, one optional value per key.
    pub fn get<V: DeserializeOwned>(
        &self,
        keys: &[Vec<Element>],
    ) -> Result<Vec<Option<V>>, ReadModelError> {
        let mut snap = self.store.kv().snapshot()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match snap.get(&self.data.pack(key))? {
                None => out.push(None),
                Some(bytes) => out.push(Some(decode_value(&bytes)?)),
            }
        }
        Ok(out)
    }

    /// Run one projection tick: scan every watched type index past the
    /// cursor, apply the handler per event in position order, bump the
    /// cursor. One transaction; handler writes and the cursor commit
    /// together.
    pub fn run_once(&self) -> Result<usize, ReadModelError> {
        self.store.kv().transact(|tx| {
            let cursor = match tx.get(&self.cursor_key)? {
                None => None,
                Some(bytes) => Some(Versionstamp::try_from(bytes.as_slice()).map_err(|e| {
                    ReadModelError::Store(StoreError::Corrupt(format!("cursor: {e}")))
                })?),
            };

            let mut positions: Vec<Versionstamp> = Vec::new();
            for event_type in self.registry.event_types() {
                positions.extend(self.store.scan_type_index(
                    tx,
                    event_type,
                    cursor.as_ref(),
                    self.config.batch_size,
                )?);
            }
            positions.sort();
            positions.dedup();
            positions.truncate(self.config.batch_size);

            for position in &positions {
                let event = self.store.event_at(tx, position)?;
                let decoded = self.registry.decode(&event)?;
                let mut scoped = ScopedTx::new(tx, &self.data);
                (self.handler)(&mut scoped, &decoded)?;
            }

            if let Some(last) = positions.last() {
                tx.set(&self.cursor_key, last.as_bytes())?;
            }
            Ok(positions.len())
        })
    }

    /// Spawn the polling loop on its own thread.
    pub fn start(&self) -> ReadModelHandle {
        let worker = self.clone();
        let token = CancelToken::new();
        let loop_token = token.clone();

        let join = thread::Builder::new()
            .name(format!("rm-{}", self.name))
            .spawn(move || {
                debug!(read_model = %worker.name, "projection loop started");
                while !loop_token.is_canceled() {
                    match worker.run_once() {
                        // A full batch means there is likely more to do now.
                        Ok(n) if n >= worker.config.batch_size => continue,
                        Ok(_) => {
                            loop_token.wait_timeout(worker.config.poll_interval);
                        }
                        Err(e) => {
                            warn!(read_model = %worker.name, error = %e, "projection tick failed");
                            loop_token.wait_timeout(worker.config.poll_interval);
                        }
                    }
                }
                debug!(read_model = %worker.name, "projection loop stopped");
            })
            .expect("failed to spawn read model thread");

        ReadModelHandle {
            token,
            join: Some(join),
        }
    }
}

/// Handle to a running projection loop.
#[derive(Debug)]
pub struct ReadModelHandle {
    token: CancelToken,
    join: Option<thread::JoinHandle<()>>,
}

impl ReadModelHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Join the loop. Call [`stop`] first.
    ///
    /// [`stop`]: ReadModelHandle::stop
    pub fn wait(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stop_and_wait(self) {
        self.stop();
        self.wait();
    }
}

fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, ReadModelError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ReadModelError::Codec(CodecError::Malformed(e.to_string())))
}
