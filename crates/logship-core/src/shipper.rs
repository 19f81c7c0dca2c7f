//! Log shipper: drains the replication log buffer to the slave
//!
//! A dedicated thread owns the transport. It waits on the buffer until a
//! batch is due, ships it, waits for the ack and releases everything the
//! slave acknowledged. Only one batch is in flight at a time, so after a
//! transport loss shipping resumes at `last_acked + 1` simply by taking the
//! oldest batch again.
//!
//! ```text
//!   Idle ──batch due──► Draining ──send──► WaitingAck ──ack──► Idle
//!                                              │
//!          Draining ◄──reconnect── Degraded ◄──┘ transport loss
//!
//!   any state ──stop / fatal──► Terminated
//! ```

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::MasterConfig;
use crate::log_buffer::{LogBatch, Readiness, ReplicationLogBuffer};
use crate::stats::MasterStats;
use crate::transport::Transport;
use crate::{Error, LogInstant, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use logship_protocol::ErrorCode;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest the worker sleeps before rechecking pause and stop requests
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Extra time `stop` waits for the worker to exit after the drain deadline
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// Shipper state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShipperState {
    /// Nothing due
    Idle,
    /// Picking and framing a batch
    Draining,
    /// Batch on the wire, waiting for the slave
    WaitingAck,
    /// Transport lost; reconnecting with backoff
    Degraded,
    /// Worker exited
    Terminated,
}

/// Result of a draining stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    /// Highest instant the slave acknowledged
    pub last_acked: Option<LogInstant>,
    /// Records still buffered without an ack
    pub unacked_records: usize,
    /// Serialized bytes of those records
    pub unacked_bytes: usize,
    /// False when the worker was still blocked in I/O and got detached
    pub joined: bool,
}

impl DrainOutcome {
    /// True when every record reached the slave
    pub fn is_complete(&self) -> bool {
        self.unacked_records == 0
    }
}

/// Called once, from the shipper thread, when shipping cannot continue
pub type FailureHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Shipper tuning, taken from [`MasterConfig`]
#[derive(Debug, Clone)]
pub struct ShipperSettings {
    /// Size trigger
    pub batch_bytes: usize,
    /// Age trigger
    pub batch_delay: Duration,
    /// Consecutive failures tolerated
    pub failure_budget_attempts: u32,
    /// Time since the first consecutive failure tolerated
    pub failure_budget: Duration,
    /// First pause before resending a batch the slave did not take
    pub retry_initial: Duration,
    /// Ceiling for that pause
    pub retry_max: Duration,
}

impl ShipperSettings {
    /// Extract shipper settings
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            batch_bytes: config.batch_bytes,
            batch_delay: config.batch_delay,
            failure_budget_attempts: config.failure_budget_attempts,
            failure_budget: config.failure_budget,
            retry_initial: config.reconnect_initial,
            retry_max: config.reconnect_max,
        }
    }
}

struct Progress {
    state: ShipperState,
    last_acked: Option<LogInstant>,
    next_to_send: Option<LogInstant>,
    flush_target: Option<LogInstant>,
    paused: bool,
    stop_deadline: Option<Instant>,
    failure: Option<String>,
}

struct Shared {
    buffer: Arc<ReplicationLogBuffer>,
    settings: ShipperSettings,
    progress: Mutex<Progress>,
    /// Signalled on every ack, state change, pause change and stop request
    changed: Condvar,
    stats: Arc<Mutex<MasterStats>>,
}

impl Shared {
    fn set_state(&self, state: ShipperState) {
        let mut progress = self.progress.lock();
        if progress.state != state {
            progress.state = state;
            self.changed.notify_all();
        }
    }

    fn last_acked(&self) -> Option<LogInstant> {
        self.progress.lock().last_acked
    }

    fn is_stopping(&self) -> bool {
        self.progress.lock().stop_deadline.is_some()
    }

    fn is_paused(&self) -> bool {
        let progress = self.progress.lock();
        progress.paused && progress.stop_deadline.is_none()
    }

    fn stop_due(&self) -> bool {
        self.progress
            .lock()
            .stop_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn flush_pending(&self) -> bool {
        let progress = self.progress.lock();
        match (progress.flush_target, progress.last_acked) {
            (Some(target), Some(acked)) => acked < target,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Park while paused; true if the worker should re-evaluate
    fn wait_while_paused(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.paused && progress.stop_deadline.is_none() {
            self.changed.wait_for(&mut progress, IDLE_POLL);
            return true;
        }
        false
    }

    /// Sleep up to `delay`, waking early on stop
    fn sleep(&self, delay: Duration) {
        let mut progress = self.progress.lock();
        let mut wake_at = Instant::now() + delay;
        if let Some(deadline) = progress.stop_deadline {
            wake_at = wake_at.min(deadline);
        }
        if Instant::now() < wake_at {
            self.changed.wait_until(&mut progress, wake_at);
        }
    }

    fn begin_send(&self, batch: &LogBatch) {
        let mut progress = self.progress.lock();
        progress.next_to_send = Some(batch.high_instant);
        progress.state = ShipperState::WaitingAck;
    }

    /// Forget what was in flight; returns where shipping resumes from
    fn rewind(&self, state: ShipperState) -> Option<LogInstant> {
        let mut progress = self.progress.lock();
        progress.next_to_send = progress.last_acked;
        progress.state = state;
        self.changed.notify_all();
        progress.last_acked
    }

    fn record_ack(&self, ack: LogInstant) {
        let mut progress = self.progress.lock();
        progress.last_acked = Some(ack);
        if progress.flush_target.is_some_and(|target| target <= ack) {
            progress.flush_target = None;
        }
        progress.state = ShipperState::Idle;
        self.changed.notify_all();
    }

    fn mark_failed(&self, diagnostic: String) {
        let mut progress = self.progress.lock();
        progress.failure = Some(diagnostic);
        self.changed.notify_all();
    }

    fn request_stop(&self, deadline: Instant) {
        let mut progress = self.progress.lock();
        progress.stop_deadline = Some(match progress.stop_deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        progress.paused = false;
        self.changed.notify_all();
    }
}

#[derive(Debug, Default)]
struct FailureWindow {
    attempts: u32,
    since: Option<Instant>,
}

impl FailureWindow {
    fn record(&mut self) -> (u32, Duration) {
        self.attempts = self.attempts.saturating_add(1);
        let since = *self.since.get_or_insert_with(Instant::now);
        (self.attempts, since.elapsed())
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

enum Step {
    Continue,
    Finished,
    Failed(Error),
}

struct Worker {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    on_failure: FailureHandler,
    failures: FailureWindow,
    /// Paces resends while the slave acks without making progress
    stalls: Backoff,
    peer: String,
}

impl Worker {
    fn run(mut self, done: Sender<()>) {
        tracing::info!(peer = %self.peer, "Log shipper started");
        loop {
            match self.step() {
                Step::Continue => {}
                Step::Finished => break,
                Step::Failed(err) => {
                    self.escalate(err);
                    break;
                }
            }
        }
        self.transport.close();
        self.shared.set_state(ShipperState::Terminated);
        tracing::info!(
            peer = %self.peer,
            last_acked = ?self.shared.last_acked(),
            "Log shipper terminated"
        );
        let _ = done.send(());
    }

    fn step(&mut self) -> Step {
        if self.shared.stop_due() {
            return Step::Finished;
        }
        if self.shared.wait_while_paused() {
            return Step::Continue;
        }
        if !self.transport.is_up() {
            return self.reconnect();
        }

        let settings = &self.shared.settings;
        let buffer = &self.shared.buffer;
        let urgent = self.shared.flush_pending();
        if !urgent {
            match buffer.wait_ready(settings.batch_bytes, settings.batch_delay, IDLE_POLL) {
                Readiness::Closed => return Step::Finished,
                Readiness::Idle => return Step::Continue,
                Readiness::Urgent | Readiness::Full | Readiness::Aged => {}
            }
        }
        let wait = if urgent { IDLE_POLL } else { Duration::ZERO };
        let batch = match buffer.next_batch_timeout(settings.batch_bytes, wait) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Step::Continue,
            Err(_) => return Step::Finished,
        };
        if self.shared.is_paused() {
            return Step::Continue;
        }

        // Records already covered by an ack (or by the seeded image) never go out.
        if let Some(acked) = self.shared.last_acked() {
            if batch.first_instant <= acked {
                buffer.release_through(acked);
                return Step::Continue;
            }
        }
        self.ship(batch)
    }

    fn reconnect(&mut self) -> Step {
        self.shared.set_state(ShipperState::Degraded);
        let wait = self.transport.reconnect_delay();
        if !wait.is_zero() {
            self.shared.sleep(wait);
            return Step::Continue;
        }
        match self.transport.connect() {
            Ok(()) => {
                let resume_after = self.shared.rewind(ShipperState::Draining);
                self.shared.stats.lock().reconnects += 1;
                tracing::info!(
                    peer = %self.peer,
                    resume_after = ?resume_after,
                    "Reconnected to slave, resuming shipping"
                );
                Step::Continue
            }
            Err(err) => match self.record_failure(&err) {
                Some(fatal) => Step::Failed(fatal),
                None => Step::Continue,
            },
        }
    }

    fn ship(&mut self, batch: LogBatch) -> Step {
        self.shared.set_state(ShipperState::Draining);
        tracing::debug!(
            peer = %self.peer,
            first = batch.first_instant,
            high = batch.high_instant,
            records = batch.record_count,
            bytes = batch.size_bytes(),
            "Shipping batch"
        );
        self.shared.begin_send(&batch);
        let result = self.transport.send(&batch);
        {
            let mut stats = self.shared.stats.lock();
            stats.batches_sent += 1;
            stats.bytes_shipped += batch.size_bytes() as u64;
        }

        match result {
            Ok(ack) => self.acknowledge(&batch, ack),
            Err(err @ Error::Protocol { .. }) => Step::Failed(err),
            Err(err) => {
                let resume_after = self.shared.rewind(ShipperState::Degraded);
                tracing::warn!(
                    peer = %self.peer,
                    error = %err,
                    resume_after = ?resume_after,
                    "Lost connection to slave"
                );
                match self.record_failure(&err) {
                    Some(fatal) => Step::Failed(fatal),
                    None => Step::Continue,
                }
            }
        }
    }

    fn acknowledge(&mut self, batch: &LogBatch, ack: LogInstant) -> Step {
        if let Some(previous) = self.shared.last_acked() {
            if ack < previous {
                return Step::Failed(Error::protocol(
                    ErrorCode::MalformedFrame,
                    format!("slave ack moved back from {} to {}", previous, ack),
                ));
            }
        }
        if ack < batch.first_instant {
            return self.stalled(batch, ack);
        }
        self.failures.reset();
        self.stalls.reset();
        let released = self.shared.buffer.release_through(ack);
        self.shared.record_ack(ack);
        self.shared.stats.lock().acks += 1;
        tracing::debug!(
            peer = %self.peer,
            ack,
            high = batch.high_instant,
            released,
            "Slave acknowledged batch"
        );
        Step::Continue
    }

    /// The slave answered without taking any record of the batch
    fn stalled(&mut self, batch: &LogBatch, ack: LogInstant) -> Step {
        self.shared.rewind(ShipperState::Degraded);
        let err = Error::disconnected(format!(
            "slave acked {} without taking batch {}..={}",
            ack, batch.first_instant, batch.high_instant
        ));
        if let Some(fatal) = self.record_failure(&err) {
            return Step::Failed(fatal);
        }
        let delay = self.stalls.record_failure();
        self.shared.sleep(delay);
        Step::Continue
    }

    /// Count a failure against the budget; `Some` once it is exhausted
    fn record_failure(&mut self, err: &Error) -> Option<Error> {
        self.shared.stats.lock().send_failures += 1;
        let (attempts, elapsed) = self.failures.record();
        if self.shared.is_stopping() {
            return None;
        }
        let settings = &self.shared.settings;
        if attempts > settings.failure_budget_attempts || elapsed > settings.failure_budget {
            return Some(Error::fatal(format!(
                "giving up on slave {} after {} attempts over {:?}: {}",
                self.peer, attempts, elapsed, err
            )));
        }
        tracing::warn!(
            peer = %self.peer,
            error = %err,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Replication transport failure, retrying"
        );
        None
    }

    fn escalate(&self, err: Error) {
        tracing::error!(peer = %self.peer, error = %err, "Log shipper giving up");
        self.shared.mark_failed(err.to_string());
        (self.on_failure)(err);
    }
}

/// Handle to the shipper thread
pub struct LogShipper {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: Receiver<()>,
}

impl LogShipper {
    /// Spawn the shipper thread over a connected (or connectable) transport
    ///
    /// `acked_through` is what the slave already holds, typically the
    /// seeded image's high-water mark. When `paused` is set nothing ships
    /// until [`resume`](Self::resume).
    pub fn start(
        settings: ShipperSettings,
        buffer: Arc<ReplicationLogBuffer>,
        transport: Box<dyn Transport>,
        acked_through: Option<LogInstant>,
        paused: bool,
        stats: Arc<Mutex<MasterStats>>,
        on_failure: FailureHandler,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            buffer,
            settings,
            progress: Mutex::new(Progress {
                state: ShipperState::Idle,
                last_acked: acked_through,
                next_to_send: acked_through,
                flush_target: None,
                paused,
                stop_deadline: None,
                failure: None,
            }),
            changed: Condvar::new(),
            stats,
        });

        let (done_tx, done) = crossbeam_channel::bounded(1);
        let worker = Worker {
            shared: shared.clone(),
            peer: transport.peer().to_string(),
            transport,
            on_failure,
            failures: FailureWindow::default(),
            stalls: Backoff::new(BackoffConfig::new(
                shared.settings.retry_initial,
                shared.settings.retry_max,
            )),
        };
        let handle = std::thread::Builder::new()
            .name("logship-shipper".to_string())
            .spawn(move || worker.run(done_tx))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            done,
        })
    }

    /// Current state
    pub fn state(&self) -> ShipperState {
        self.shared.progress.lock().state
    }

    /// Highest instant the slave acknowledged
    pub fn last_acked(&self) -> Option<LogInstant> {
        self.shared.last_acked()
    }

    /// Highest instant handed to the transport since the last rewind
    pub fn next_to_send(&self) -> Option<LogInstant> {
        self.shared.progress.lock().next_to_send
    }

    /// Diagnostic of the failure that stopped the shipper, if any
    pub fn failure(&self) -> Option<String> {
        self.shared.progress.lock().failure.clone()
    }

    /// Raise the acknowledged watermark without shipping
    ///
    /// Used once the seeded image is known to hold everything up to
    /// `instant`; buffered records at or below it are dropped.
    pub fn seed(&self, instant: LogInstant) {
        {
            let mut progress = self.shared.progress.lock();
            if progress.last_acked.is_some_and(|acked| acked >= instant) {
                return;
            }
            progress.last_acked = Some(instant);
            progress.next_to_send = progress.next_to_send.max(Some(instant));
            self.shared.changed.notify_all();
        }
        self.shared.buffer.release_through(instant);
    }

    /// Stop sending; records keep accumulating in the buffer
    pub fn pause(&self) {
        let mut progress = self.shared.progress.lock();
        if !progress.paused {
            progress.paused = true;
            tracing::info!("Log shipping paused");
        }
    }

    /// Resume sending after [`pause`](Self::pause)
    pub fn resume(&self) {
        {
            let mut progress = self.shared.progress.lock();
            if !progress.paused {
                return;
            }
            progress.paused = false;
            self.shared.changed.notify_all();
        }
        tracing::info!("Log shipping resumed");
        self.shared.buffer.kick();
    }

    /// True while paused
    pub fn is_paused(&self) -> bool {
        self.shared.progress.lock().paused
    }

    /// Send whatever is buffered now, ignoring the batching triggers
    pub fn force_drain(&self) {
        self.shared.buffer.kick();
    }

    /// Ship promptly until `instant` is acknowledged
    pub fn request_flush(&self, instant: LogInstant) {
        {
            let mut progress = self.shared.progress.lock();
            if progress.last_acked.is_some_and(|acked| acked >= instant) {
                return;
            }
            progress.flush_target = progress.flush_target.max(Some(instant));
        }
        self.shared.buffer.kick();
    }

    /// Block until the slave acknowledged `instant`
    ///
    /// `FlushTimeout` when `timeout` passes or the shipper stops first,
    /// `Fatal` when the shipper failed.
    pub fn wait_acked(&self, instant: LogInstant, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        loop {
            if progress.last_acked.is_some_and(|acked| acked >= instant) {
                return Ok(());
            }
            if let Some(failure) = &progress.failure {
                return Err(Error::fatal(failure.clone()));
            }
            if progress.stop_deadline.is_some() || progress.state == ShipperState::Terminated {
                return Err(Error::FlushTimeout { instant });
            }
            if self
                .shared
                .changed
                .wait_until(&mut progress, deadline)
                .timed_out()
            {
                return if progress.last_acked.is_some_and(|acked| acked >= instant) {
                    Ok(())
                } else {
                    Err(Error::FlushTimeout { instant })
                };
            }
        }
    }

    /// Ask the worker to exit as soon as possible without waiting for it
    ///
    /// Safe to call from the shipper thread itself.
    pub fn abort(&self) {
        self.shared.request_stop(Instant::now());
        self.shared.buffer.close();
    }

    /// Drain until the buffer is empty or `deadline` passes, then join
    ///
    /// Closes the buffer. A worker still blocked in I/O after the deadline
    /// plus a short grace period is detached; it exits once its I/O times
    /// out.
    pub fn stop(&self, deadline: Duration) -> DrainOutcome {
        self.shared.request_stop(Instant::now() + deadline);
        self.shared.buffer.close();

        let joined = match self.done.recv_timeout(deadline + JOIN_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        if let Some(handle) = self.handle.lock().take() {
            if joined {
                if handle.join().is_err() {
                    tracing::error!("Log shipper thread panicked");
                }
            } else {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Log shipper still blocked in I/O after the drain deadline, detaching"
                );
            }
        }

        let buffer = &self.shared.buffer;
        DrainOutcome {
            last_acked: self.last_acked(),
            unacked_records: buffer.len(),
            unacked_bytes: buffer.used_bytes(),
            joined,
        }
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            self.abort();
        }
    }
}

impl std::fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.shared.progress.lock();
        f.debug_struct("LogShipper")
            .field("state", &progress.state)
            .field("last_acked", &progress.last_acked)
            .field("next_to_send", &progress.next_to_send)
            .field("paused", &progress.paused)
            .finish()
    }
}
