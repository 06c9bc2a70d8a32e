//! Transactionally-leased job queue with retry backoff and a dead-letter
//! queue.
//!
//! A job is one event position to process. Jobs live under
//! `<root>/queue/<position>/<random>`; their fixed-size record tracks
//! vesting (earliest delivery time), the current lease, and the attempt
//! count. Every transition (claim, heartbeat, complete, retry) is one
//! transaction that re-verifies ownership, which is what keeps delivery
//! exclusive while leases can still be stolen from dead workers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use tidemark_core::tuple::key_after;
use tidemark_core::{Element, Subspace, Versionstamp};
use tidemark_kv::{Kv, KvError, KvPair, ReadOps, TransactError, Tx};

/// Packed size of a job record:
/// `vesting(8) | expiry(8) | leaseStamp(12) | owner(16) | attempts(1)`.
pub const JOB_RECORD_LEN: usize = 45;

const UNOWNED: [u8; 16] = [0; 16];
const MAX_DLQ_ERROR_LEN: usize = u16::MAX as usize;

/// Queue-level failure.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job record disappeared under us (completed elsewhere or replayed).
    #[error("job is gone")]
    JobGone,

    /// Another worker claimed the job after our lease lapsed.
    #[error("job lease stolen by another worker")]
    LeaseStolen,

    #[error("corrupt queue record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl TransactError for QueueError {
    fn as_kv(&self) -> Option<&KvError> {
        match self {
            QueueError::Kv(e) => Some(e),
            _ => None,
        }
    }
}

/// Identity of one worker process/thread, compared byte-wise on claims.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId([u8; 16]);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0), f)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({self})")
    }
}

/// Lease and backoff configuration for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub lease_ttl: Duration,
    /// Extra slack past the lease expiry before a lease may be stolen,
    /// absorbing modest clock skew between workers.
    pub grace_period: Duration,
    pub max_attempts: u32,
    pub retry_base_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
            max_attempts: 3,
            retry_base_wait: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_ttl.is_zero() {
            return Err("lease_ttl must be positive".into());
        }
        if self.grace_period.is_zero() {
            return Err("grace_period must be positive".into());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.max_attempts > u8::MAX as u32 {
            return Err(format!("max_attempts must be at most {}", u8::MAX));
        }
        if self.retry_base_wait.is_zero() {
            return Err("retry_base_wait must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobRecord {
    vesting_ns: u64,
    expiry_ns: u64,
    /// Wall-clock stamp of the last claim. Kept for the version-based steal
    /// clause some deployments add on top of the time-based one.
    lease_stamp: [u8; 12],
    owner: [u8; 16],
    attempts: u8,
}

impl JobRecord {
    fn fresh(vesting_ns: u64, attempts: u8) -> Self {
        Self {
            vesting_ns,
            expiry_ns: 0,
            lease_stamp: [0; 12],
            owner: UNOWNED,
            attempts,
        }
    }

    fn is_unowned(&self) -> bool {
        self.owner == UNOWNED
    }

    fn pack(&self) -> [u8; JOB_RECORD_LEN] {
        let mut out = [0u8; JOB_RECORD_LEN];
        out[0..8].copy_from_slice(&self.vesting_ns.to_be_bytes());
        out[8..16].copy_from_slice(&self.expiry_ns.to_be_bytes());
        out[16..28].copy_from_slice(&self.lease_stamp);
        out[28..44].copy_from_slice(&self.owner);
        out[44] = self.attempts;
        out
    }

    fn unpack(bytes: &[u8]) -> Result<Self, QueueError> {
        let bytes: &[u8; JOB_RECORD_LEN] = bytes.try_into().map_err(|_| {
            QueueError::Corrupt(format!(
                "job record must be {JOB_RECORD_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let mut vesting = [0u8; 8];
        let mut expiry = [0u8; 8];
        vesting.copy_from_slice(&bytes[0..8]);
        expiry.copy_from_slice(&bytes[8..16]);

        let mut record = Self::fresh(u64::from_be_bytes(vesting), bytes[44]);
        record.expiry_ns = u64::from_be_bytes(expiry);
        record.lease_stamp.copy_from_slice(&bytes[16..28]);
        record.owner.copy_from_slice(&bytes[28..44]);
        Ok(record)
    }
}

/// A job currently leased by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    key: Vec<u8>,
    pub position: Versionstamp,
    pub attempts: u32,
    pub expiry_ns: u64,
    owner: WorkerId,
}

impl LeasedJob {
    pub fn owner(&self) -> WorkerId {
        self.owner
    }
}

/// What became of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-queued with backoff; `attempts` is the count consumed so far.
    Retried { attempts: u32, backoff: Duration },
    /// Attempts exhausted; the job moved to the dead-letter queue.
    DeadLettered { attempts: u32 },
}

/// A dead-lettered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqEntry {
    pub key: Vec<u8>,
    pub recorded_ns: u64,
    pub position: Versionstamp,
    pub attempts: u32,
    pub error: String,
}

/// Operator-facing queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub dead_lettered: usize,
}

/// The leased job queue over one `<root>` subspace.
pub struct JobQueue<K: Kv> {
    kv: Arc<K>,
    queue: Subspace,
    dlq: Subspace,
    config: QueueConfig,
}

impl<K: Kv> Clone for JobQueue<K> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            queue: self.queue.clone(),
            dlq: self.dlq.clone(),
            config: self.config.clone(),
        }
    }
}

impl<K: Kv> JobQueue<K> {
    /// `root` is the queue's namespace (`ns/<queueId>`); the queue owns
    /// everything below it.
    pub fn new(kv: Arc<K>, root: &Subspace, config: QueueConfig) -> Self {
        Self {
            kv,
            queue: root.subspace(&[Element::str("queue")]),
            dlq: root.subspace(&[Element::str("dlq")]),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stage a job for `position` inside an open transaction. The random key
    /// suffix keeps jobs for the same position distinct.
    pub fn enqueue_in(&self, tx: &mut impl Tx, position: &Versionstamp) -> Result<(), QueueError> {
        let mut suffix = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut suffix);
        let key = self.queue.pack(&[
            Element::Versionstamp(*position),
            Element::Bytes(suffix.to_vec()),
        ]);
        tx.set(&key, &JobRecord::fresh(0, 0).pack())?;
        Ok(())
    }

    /// Enqueue a job in its own transaction.
    pub fn enqueue(&self, position: &Versionstamp) -> Result<(), QueueError> {
        self.kv.transact(|tx| self.enqueue_in(tx, position))
    }

    /// Claim the first deliverable job, scanning up to `batch_size`
    /// candidates in key order. Jobs sort by source event position, so
    /// delivery is approximately FIFO.
    pub fn dequeue(
        &self,
        worker: WorkerId,
        batch_size: usize,
    ) -> Result<Option<LeasedJob>, QueueError> {
        self.kv.transact(|tx| self.dequeue_tx(tx, worker, batch_size))
    }

    fn dequeue_tx(
        &self,
        tx: &mut K::Tx<'_>,
        worker: WorkerId,
        batch_size: usize,
    ) -> Result<Option<LeasedJob>, QueueError> {
        let now = now_ns();
        let steal_slack = duration_ns(self.config.grace_period);
        let (begin, end) = self.queue.range();

        for pair in tx.range(&begin, &end, batch_size, false)? {
            let record = JobRecord::unpack(&pair.value)?;
            if record.vesting_ns > now {
                continue;
            }
            if !record.is_unowned() && record.expiry_ns.saturating_add(steal_slack) >= now {
                continue;
            }

            let mut claimed = record;
            claimed.owner = *worker.as_bytes();
            claimed.expiry_ns = now.saturating_add(duration_ns(self.config.lease_ttl));
            claimed.lease_stamp = wall_clock_stamp(now);
            tx.set(&pair.key, &claimed.pack())?;

            let position = job_position(&self.queue, &pair.key)?;
            return Ok(Some(LeasedJob {
                key: pair.key,
                position,
                attempts: claimed.attempts as u32,
                expiry_ns: claimed.expiry_ns,
                owner: worker,
            }));
        }
        Ok(None)
    }

    /// Extend the caller's own lease. Fails with `LeaseStolen` if another
    /// worker claimed the job in the meantime.
    pub fn heartbeat(&self, job: &mut LeasedJob) -> Result<(), QueueError> {
        let expiry = self.kv.transact(|tx| {
            let mut record = self.owned_record(tx, job)?;
            record.expiry_ns = now_ns().saturating_add(duration_ns(self.config.lease_ttl));
            tx.set(&job.key, &record.pack())?;
            Ok::<u64, QueueError>(record.expiry_ns)
        })?;
        job.expiry_ns = expiry;
        Ok(())
    }

    /// Delete a finished job. A missing record counts as success (someone
    /// already completed it); a record owned by someone else means the lease
    /// was stolen and local post-work must be abandoned.
    pub fn complete(&self, job: &LeasedJob) -> Result<(), QueueError> {
        self.kv.transact(|tx| {
            match tx.get(&job.key)? {
                None => Ok(()),
                Some(value) => {
                    let record = JobRecord::unpack(&value)?;
                    if record.owner != *job.owner.as_bytes() {
                        return Err(QueueError::LeaseStolen);
                    }
                    tx.clear(&job.key);
                    Ok(())
                }
            }
        })
    }

    /// Record a failed attempt: requeue with exponential backoff, or move the
    /// job to the dead-letter queue once attempts are exhausted.
    pub fn fail(&self, job: &LeasedJob, error: &str) -> Result<FailureDisposition, QueueError> {
        self.kv.transact(|tx| {
            let record = self.owned_record(tx, job)?;
            let attempts = record.attempts.saturating_add(1);

            if attempts as u32 >= self.config.max_attempts {
                let now = now_ns();
                let dlq_key = self
                    .dlq
                    .pack(&[Element::Int(now), Element::Versionstamp(job.position)]);
                tx.set(&dlq_key, &pack_dlq_value(&job.position, attempts, error))?;
                tx.clear(&job.key);
                debug!(position = %job.position, attempts, "job dead-lettered");
                return Ok(FailureDisposition::DeadLettered {
                    attempts: attempts as u32,
                });
            }

            let backoff = self
                .config
                .retry_base_wait
                .saturating_mul(5u32.saturating_pow(attempts as u32 - 1));
            let mut requeued = JobRecord::fresh(now_ns().saturating_add(duration_ns(backoff)), attempts);
            requeued.lease_stamp = record.lease_stamp;
            tx.set(&job.key, &requeued.pack())?;
            Ok(FailureDisposition::Retried {
                attempts: attempts as u32,
                backoff,
            })
        })
    }

    fn owned_record(&self, tx: &mut K::Tx<'_>, job: &LeasedJob) -> Result<JobRecord, QueueError> {
        let value = tx.get(&job.key)?.ok_or(QueueError::JobGone)?;
        let record = JobRecord::unpack(&value)?;
        if record.owner != *job.owner.as_bytes() {
            return Err(QueueError::LeaseStolen);
        }
        Ok(record)
    }

    /// Lazily iterate the dead-letter queue in recording order.
    pub fn dead_letters(&self, page_size: usize) -> Result<DlqIter<K::Snapshot>, QueueError> {
        let snap = self.kv.snapshot()?;
        let (begin, end) = self.dlq.range();
        Ok(DlqIter {
            snap,
            dlq: self.dlq.clone(),
            begin,
            end,
            page_size: page_size.max(1),
            buf: VecDeque::new(),
            exhausted: false,
            done: false,
        })
    }

    /// Move a dead-lettered job back onto the queue with fresh vesting and a
    /// reset attempt counter.
    pub fn replay_dead_letter(&self, key: &[u8]) -> Result<(), QueueError> {
        self.kv.transact(|tx| {
            let value = tx.get(key)?.ok_or(QueueError::JobGone)?;
            let entry = unpack_dlq_value(&value)?;
            self.enqueue_in(tx, &entry.0)?;
            tx.clear(key);
            Ok(())
        })
    }

    /// Drop every DLQ entry recorded strictly before `before_ns`.
    pub fn purge_dead_letters(&self, before_ns: u64) -> Result<(), QueueError> {
        self.kv.transact(|tx| {
            let (begin, _) = self.dlq.range();
            let end = self.dlq.pack(&[Element::Int(before_ns)]);
            tx.clear_range(&begin, &end);
            Ok(())
        })
    }

    /// Counters for operator dashboards. Scans the whole queue; intended for
    /// inspection, not hot paths.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut snap = self.kv.snapshot()?;
        let now = now_ns();
        let mut stats = QueueStats::default();

        let (begin, end) = self.queue.range();
        for pair in snap.range(&begin, &end, 0, false)? {
            let record = JobRecord::unpack(&pair.value)?;
            if !record.is_unowned() && record.expiry_ns > now {
                stats.leased += 1;
            } else {
                stats.pending += 1;
            }
        }

        let (begin, end) = self.dlq.range();
        stats.dead_lettered = snap.range(&begin, &end, 0, false)?.len();
        Ok(stats)
    }
}

/// Lazy iterator over DLQ entries.
pub struct DlqIter<S: ReadOps> {
    snap: S,
    dlq: Subspace,
    begin: Vec<u8>,
    end: Vec<u8>,
    page_size: usize,
    buf: VecDeque<KvPair>,
    exhausted: bool,
    done: bool,
}

impl<S: ReadOps> Iterator for DlqIter<S> {
    type Item = Result<DlqEntry, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.buf.is_empty() && !self.exhausted {
            match self.snap.range(&self.begin, &self.end, self.page_size, false) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.begin = key_after(&last.key);
                    }
                    self.buf.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }

        let pair = self.buf.pop_front()?;
        match decode_dlq_entry(&self.dlq, pair) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_dlq_entry(dlq: &Subspace, pair: KvPair) -> Result<DlqEntry, QueueError> {
    let elements = dlq
        .unpack(&pair.key)
        .map_err(|e| QueueError::Corrupt(format!("dlq key: {e}")))?;
    let recorded_ns = elements
        .first()
        .and_then(Element::as_int)
        .ok_or_else(|| QueueError::Corrupt("dlq key missing timestamp".into()))?;
    let (position, attempts, error) = unpack_dlq_value(&pair.value)?;
    Ok(DlqEntry {
        key: pair.key,
        recorded_ns,
        position,
        attempts: attempts as u32,
        error,
    })
}

fn pack_dlq_value(position: &Versionstamp, attempts: u8, error: &str) -> Vec<u8> {
    let msg = truncate_utf8(error, MAX_DLQ_ERROR_LEN);
    let mut out = Vec::with_capacity(12 + 1 + 2 + msg.len());
    out.extend_from_slice(position.as_bytes());
    out.push(attempts);
    out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    out.extend_from_slice(msg.as_bytes());
    out
}

fn unpack_dlq_value(value: &[u8]) -> Result<(Versionstamp, u8, String), QueueError> {
    if value.len() < 15 {
        return Err(QueueError::Corrupt(format!(
            "dlq value too short ({} bytes)",
            value.len()
        )));
    }
    let position = Versionstamp::try_from(&value[0..12])
        .map_err(|e| QueueError::Corrupt(e.to_string()))?;
    let attempts = value[12];
    let len = u16::from_be_bytes([value[13], value[14]]) as usize;
    let msg = value
        .get(15..15 + len)
        .ok_or_else(|| QueueError::Corrupt("dlq error message truncated".into()))?;
    let error = String::from_utf8_lossy(msg).into_owned();
    Ok((position, attempts, error))
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn job_position(queue: &Subspace, key: &[u8]) -> Result<Versionstamp, QueueError> {
    let elements = queue
        .unpack(key)
        .map_err(|e| QueueError::Corrupt(format!("job key: {e}")))?;
    elements
        .first()
        .and_then(Element::as_versionstamp)
        .copied()
        .ok_or_else(|| QueueError::Corrupt("job key missing position".into()))
}

pub(crate) fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn wall_clock_stamp(now: u64) -> [u8; 12] {
    let mut stamp = [0u8; 12];
    stamp[..8].copy_from_slice(&now.to_be_bytes());
    stamp
}
