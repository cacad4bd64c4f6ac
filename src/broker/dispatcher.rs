//! Message distribution
//!
//! The dispatcher decouples publishers from consumers. `enqueue` appends a
//! publish context to a deque and returns; worker tasks pull batches off the
//! front and hand each message to the consumers of its registration.
//!
//! Delivery rules per context:
//! - topic: every consumer gets a copy; a failed send only affects that consumer
//! - queue: consumers are tried in registration order until one send succeeds
//! - a queue message nobody accepted goes back to the front of the deque and is
//!   retried on a later cycle; a topic message with no consumers is dropped
//!
//! After each batch the buffer threshold (if any) evicts the oldest pending
//! contexts.
//!
//! Ordering: `Sequential` runs a single worker, so deliveries happen in publish
//! order across every queue and topic. `Parallel` runs `workers` tasks that
//! each take their own batch; there is no ordering between messages handled by
//! different workers.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::message::{Message, MessageKind};
use crate::broker::registration::RegistrationInfo;
use crate::client::ClientInfo;
use crate::utils::error::BusError;

pub const DEFAULT_BUFFER_THRESHOLD: i64 = -1;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 50;

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Distribution strategy. Parsed case-insensitively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ProcessingMode {
    #[default]
    Sequential,
    Parallel,
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(ProcessingMode::Sequential),
            "parallel" => Ok(ProcessingMode::Parallel),
            other => Err(format!("processing mode '{other}' is not supported")),
        }
    }
}

impl TryFrom<String> for ProcessingMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Sequential => f.write_str("Sequential"),
            ProcessingMode::Parallel => f.write_str("Parallel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub processing_mode: ProcessingMode,
    /// Maximum pending contexts kept after a batch; `-1` disables eviction.
    pub buffer_threshold: i64,
    /// Number of worker tasks in `Parallel` mode.
    pub workers: usize,
    /// Maximum contexts taken per batch.
    pub batch_size: usize,
    /// How long a worker waits before retrying retained queue messages when
    /// nothing new arrives.
    pub idle_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::Sequential,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_interval: Duration::from_millis(DEFAULT_IDLE_INTERVAL_MS),
        }
    }
}

impl DispatcherConfig {
    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    /// Negative values disable the buffer policy.
    pub fn with_buffer_threshold(mut self, threshold: i64) -> Self {
        self.buffer_threshold = normalize_threshold(threshold);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn worker_count(&self) -> usize {
        match self.processing_mode {
            ProcessingMode::Sequential => 1,
            ProcessingMode::Parallel => self.workers.max(1),
        }
    }
}

pub(crate) fn normalize_threshold(threshold: i64) -> i64 {
    if threshold < 0 { -1 } else { threshold }
}

/// A message paired with the registration it was published to.
#[derive(Debug, Clone)]
pub struct PublishContext {
    message: Message,
    registration: Arc<RegistrationInfo>,
}

impl PublishContext {
    pub fn new(message: Message, registration: Arc<RegistrationInfo>) -> Self {
        Self {
            message,
            registration,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn registration(&self) -> &Arc<RegistrationInfo> {
        &self.registration
    }
}

/// Out-of-band report of a context that blew up during distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFault {
    pub kind: MessageKind,
    pub name: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub discarded: u64,
}

impl DispatcherStats {
    /// Every context ever enqueued, wherever it is now.
    pub fn received(&self) -> u64 {
        self.pending as u64 + self.in_flight as u64 + self.processed + self.discarded
    }
}

/// What one `run_cycle` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub taken: usize,
    pub completed: usize,
    pub requeued: usize,
    pub faulted: usize,
    pub evicted: usize,
    /// Contexts dropped because the dispatcher was stopped mid-batch.
    pub dropped: usize,
}

impl CycleReport {
    fn progressed(&self) -> bool {
        self.completed > 0 || self.faulted > 0 || self.evicted > 0 || self.dropped > 0
    }
}

enum Distribution {
    Completed,
    Retained,
}

struct Shared {
    config: DispatcherConfig,
    pending: Mutex<VecDeque<PublishContext>>,
    wake: Notify,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    discarded: AtomicU64,
    faults: broadcast::Sender<DispatchFault>,
    // Bumped on every start and stop; a worker exits once it no longer
    // matches the generation it was spawned for.
    generation: watch::Sender<u64>,
    // Bumped by `stop` under the pending lock. A batch taken before a stop
    // finishes without delivering or re-queueing anything.
    stops: AtomicU64,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                pending: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                in_flight: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                faults,
                generation,
                stops: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Append a context and wake a worker. Never blocks on delivery.
    pub fn enqueue(&self, context: PublishContext) {
        self.shared.pending.lock().push_back(context);
        self.shared.wake.notify_one();
    }

    /// Wake a worker so retained queue messages are retried now, for example
    /// after a consumer registered.
    pub fn notify(&self) {
        self.shared.wake.notify_one();
    }

    /// Process one batch on the calling thread.
    pub fn run_cycle(&self) -> CycleReport {
        self.shared.run_cycle()
    }

    /// Spawn the worker tasks on the current tokio runtime. Calling it again
    /// while running is a no-op.
    pub fn start(&self) -> Result<(), BusError> {
        let handle = Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let generation = self.shared.advance_generation();
        let count = self.shared.config.worker_count();
        for id in 0..count {
            let shared = Arc::clone(&self.shared);
            let signal = self.shared.generation.subscribe();
            workers.push(handle.spawn(worker_loop(shared, id, generation, signal)));
        }

        info!(
            mode = %self.shared.config.processing_mode,
            workers = count,
            buffer_threshold = self.shared.config.buffer_threshold,
            "dispatcher started"
        );
        Ok(())
    }

    /// Signal the workers to exit and drop everything still pending. The
    /// dropped contexts are counted as discarded, as is whatever a batch
    /// already in flight had left to deliver or re-queue.
    pub fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        self.shared.advance_generation();

        let dropped = {
            let mut pending = self.shared.pending.lock();
            self.shared.stops.fetch_add(1, Ordering::SeqCst);
            let dropped = pending.len();
            pending.clear();
            dropped
        };
        if dropped > 0 {
            self.shared
                .discarded
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(dropped, "dispatcher stopped with undelivered messages");
        }

        if !workers.is_empty() {
            info!("dispatcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pending: self.pending_len(),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.shared.faults.subscribe()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.advance_generation();
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    id: usize,
    generation: u64,
    mut signal: watch::Receiver<u64>,
) {
    debug!(worker = id, generation, "dispatch worker running");
    loop {
        if *signal.borrow() != generation {
            break;
        }

        let report = shared.run_cycle();
        if report.progressed() {
            tokio::task::yield_now().await;
            continue;
        }

        // Idle, or only retained queue messages: wait for new work, a
        // membership change, or (if something is retained) the retry timer.
        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.idle_interval), if report.requeued > 0 => {}
        }
    }
    debug!(worker = id, "dispatch worker exited");
}

impl Shared {
    fn advance_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    /// Take the next batch along with the stop count it was taken under.
    fn take_batch(&self) -> (Vec<PublishContext>, u64) {
        let mut pending = self.pending.lock();
        let epoch = self.stops.load(Ordering::SeqCst);
        let count = pending.len().min(self.config.batch_size.max(1));
        let batch: Vec<_> = pending.drain(..count).collect();
        self.in_flight.fetch_add(batch.len(), Ordering::Relaxed);
        (batch, epoch)
    }

    fn stopped_since(&self, epoch: u64) -> bool {
        self.stops.load(Ordering::SeqCst) != epoch
    }

    fn run_cycle(&self) -> CycleReport {
        let (batch, epoch) = self.take_batch();
        let mut report = CycleReport {
            taken: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let mut retained = Vec::new();
        // Queues with a retained message in this batch; later messages of the
        // same queue stay behind it.
        let mut blocked: HashSet<usize> = HashSet::new();

        for context in batch {
            if self.stopped_since(epoch) {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                report.dropped += 1;
                continue;
            }

            let key = Arc::as_ptr(&context.registration) as usize;
            if blocked.contains(&key) {
                retained.push(context);
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let (distribution, failed) = distribute(&context);
                // Closing fires the disconnect callback, which takes
                // registration locks; the entry lock is already released here.
                for client in failed {
                    close_channel(&client);
                }
                distribution
            }));

            match outcome {
                Ok(Distribution::Completed) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    report.completed += 1;
                }
                Ok(Distribution::Retained) => {
                    blocked.insert(key);
                    retained.push(context);
                }
                Err(panic) => {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    report.faulted += 1;
                    self.report_fault(&context, panic_reason(panic.as_ref()));
                }
            }
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
        }

        let mut pending = self.pending.lock();
        if self.stopped_since(epoch) {
            // `stop` already counted what it cleared; these were in our hands.
            self.discarded
                .fetch_add(retained.len() as u64, Ordering::Relaxed);
            report.dropped += retained.len();
        } else {
            report.requeued = retained.len();
            for context in retained.into_iter().rev() {
                pending.push_front(context);
            }
        }
        if report.dropped > 0 {
            debug!(dropped = report.dropped, "batch finished after stop, contexts discarded");
        }

        let threshold = self.config.buffer_threshold;
        if threshold > 0 && pending.len() > threshold as usize {
            let excess = pending.len() - threshold as usize;
            pending.drain(..excess);
            self.discarded.fetch_add(excess as u64, Ordering::Relaxed);
            report.evicted = excess;
            warn!(
                evicted = excess,
                threshold, "buffer threshold exceeded, oldest messages discarded"
            );
        }

        report
    }

    fn report_fault(&self, context: &PublishContext, reason: String) {
        let fault = DispatchFault {
            kind: context.registration.kind(),
            name: context.registration.name().to_string(),
            reason,
            at: Utc::now(),
        };
        error!(
            kind = %fault.kind,
            name = %fault.name,
            reason = %fault.reason,
            "error publishing message"
        );
        // nobody listening is fine
        let _ = self.faults.send(fault);
    }
}

/// Deliver one context under its registration lock. Returns the outcome and
/// the consumers whose send failed.
fn distribute(context: &PublishContext) -> (Distribution, Vec<Arc<ClientInfo>>) {
    let registration = &context.registration;
    let message = &context.message;
    let is_queue = registration.kind() == MessageKind::Queue;

    let mut state = registration.lock();
    let mut failed = Vec::new();
    let mut delivered = false;

    for consumer in &state.consumers {
        match consumer.channel().send(message) {
            Ok(()) => {
                consumer.record_consumed();
                delivered = true;
                if is_queue {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    session = consumer.session_id(),
                    name = registration.name(),
                    error = %e,
                    "delivery failed"
                );
                failed.push(Arc::clone(consumer));
            }
        }
    }

    if is_queue && !delivered {
        return (Distribution::Retained, failed);
    }

    state.latest_message = Some(message.clone());
    registration.record_processed();
    (Distribution::Completed, failed)
}

fn close_channel(client: &ClientInfo) {
    let channel = client.channel();
    if channel.is_open() {
        channel.close();
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
