//! Master controller: lifecycle of the replication master role
//!
//! ```text
//! Uninitialized ──boot──► Booted ──start_master──► Running ──stop_master──► Stopping ──► Stopped
//!                                                     │                        │
//!                                                     └──────── fatal ─────────┴──► Failed
//! ```
//!
//! The controller is the [`ReplicationSink`] the log manager feeds. Its
//! state lock is held only for bookkeeping: never across network I/O, a
//! back-pressure wait or a thread join. Lock order is controller, then
//! buffer.

use crate::collaborators::{DataFactory, LogManager, RawStore, ReplicationSink};
use crate::config::{self, BackPressurePolicy, MasterConfig, Properties};
use crate::log_buffer::ReplicationLogBuffer;
use crate::shipper::{DrainOutcome, FailureHandler, LogShipper, ShipperSettings, ShipperState};
use crate::stats::MasterStats;
use crate::transport::{TcpTransportFactory, TransportFactory};
use crate::{Error, LogInstant, Result};
use logship_protocol::encoded_len;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterState {
    /// Created, not configured
    Uninitialized,
    /// Configured, not shipping
    Booted,
    /// Intercepting and shipping the log
    Running,
    /// Draining for shutdown
    Stopping,
    /// Shut down cleanly
    Stopped,
    /// Shut down by an unrecoverable error
    Failed,
}

/// Summary of a `stop_master` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// State after the call
    pub state: MasterState,
    /// Highest instant the slave acknowledged
    pub last_acked: Option<LogInstant>,
    /// Records that never reached the slave
    pub unacked_records: usize,
    /// Serialized bytes of those records
    pub unacked_bytes: usize,
    /// Time spent in `stop_master`
    pub elapsed: Duration,
}

impl StopReport {
    fn new(state: MasterState, outcome: Option<&DrainOutcome>, started: Instant) -> Self {
        Self {
            state,
            last_acked: outcome.and_then(|o| o.last_acked),
            unacked_records: outcome.map_or(0, |o| o.unacked_records),
            unacked_bytes: outcome.map_or(0, |o| o.unacked_bytes),
            elapsed: started.elapsed(),
        }
    }
}

/// Everything that lives between `start_master` and `stop_master`
struct Session {
    config: MasterConfig,
    buffer: Arc<ReplicationLogBuffer>,
    shipper: LogShipper,
    log_manager: Arc<dyn LogManager>,
    /// Records below this instant are already in the seeded image
    ship_from: AtomicU64,
    resized: AtomicBool,
}

struct Lifecycle {
    state: MasterState,
    config: Option<MasterConfig>,
    session: Option<Arc<Session>>,
    last_failure: Option<String>,
}

struct Inner {
    id: String,
    transport_factory: Arc<dyn TransportFactory>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes start and stop
    transition: Mutex<()>,
    stats: Arc<Mutex<MasterStats>>,
}

/// Master side of the replication pair
#[derive(Clone)]
pub struct MasterController {
    inner: Arc<Inner>,
}

impl MasterController {
    /// Controller that reaches the slave through `transport_factory`
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                transport_factory,
                lifecycle: Mutex::new(Lifecycle {
                    state: MasterState::Uninitialized,
                    config: None,
                    session: None,
                    last_failure: None,
                }),
                transition: Mutex::new(()),
                stats: Arc::new(Mutex::new(MasterStats::default())),
            }),
        }
    }

    /// Controller shipping over TCP
    pub fn with_tcp() -> Self {
        Self::new(Arc::new(TcpTransportFactory))
    }

    /// True iff `props` name a recognized replication mode
    pub fn can_support(props: &Properties) -> bool {
        config::can_support(props)
    }

    /// Master ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Parse the property bag and move to BOOTED
    ///
    /// `create` tells whether the database is being created rather than
    /// reopened; it only shows up in the logs.
    pub fn boot(&self, create: bool, props: &Properties) -> Result<()> {
        let config = config::parse(props)?;
        self.boot_with_config(create, config)
    }

    /// Same as [`boot`](Self::boot) with an already typed configuration
    pub fn boot_with_config(&self, create: bool, config: MasterConfig) -> Result<()> {
        config.validate()?;
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != MasterState::Uninitialized {
            return Err(Error::invalid_state("uninitialized", lifecycle.state));
        }
        tracing::info!(
            master_id = %self.inner.id,
            mode = %config.mode,
            slave = %config.slave,
            buffer_bytes = config.buffer_bytes,
            create,
            "Replication master booted"
        );
        lifecycle.config = Some(config);
        lifecycle.state = MasterState::Booted;
        Ok(())
    }

    /// Start intercepting and shipping the log
    ///
    /// Connects to the slave, registers with the log manager, hands the
    /// slave a database image consistent through the log's high-water mark
    /// and ships everything after it. Any failure rolls back to BOOTED and
    /// yields `StartupFailed`.
    pub fn start_master(
        &self,
        raw_store: Arc<dyn RawStore>,
        data_factory: Arc<dyn DataFactory>,
        log_manager: Arc<dyn LogManager>,
    ) -> Result<()> {
        let _transition = self.inner.transition.lock();
        let config = {
            let lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != MasterState::Booted {
                return Err(Error::invalid_state("booted", lifecycle.state));
            }
            lifecycle
                .config
                .clone()
                .ok_or_else(|| Error::startup("booted without a configuration"))?
        };
        if data_factory.is_read_only() {
            return Err(Error::startup("a read-only database cannot be a replication master"));
        }

        let buffer = Arc::new(ReplicationLogBuffer::new(config.buffer_bytes));
        let mut transport = self
            .inner
            .transport_factory
            .create(&config)
            .map_err(|e| Error::startup(format!("cannot create transport to {}: {}", config.slave, e)))?;
        transport
            .connect()
            .map_err(|e| Error::startup(format!("cannot connect to slave {}: {}", config.slave, e)))?;
        let shipper = LogShipper::start(
            ShipperSettings::from_config(&config),
            buffer.clone(),
            transport,
            None,
            true,
            self.inner.stats.clone(),
            self.failure_handler(),
        )
        .map_err(|e| Error::startup(format!("cannot start log shipper: {}", e)))?;

        let session = Arc::new(Session {
            config: config.clone(),
            buffer,
            shipper,
            log_manager,
            ship_from: AtomicU64::new(0),
            resized: AtomicBool::new(false),
        });
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.state = MasterState::Running;
            lifecycle.session = Some(session.clone());
            lifecycle.last_failure = None;
        }

        match self.attach(&session, raw_store.as_ref()) {
            Ok(seeded_through) => {
                tracing::info!(
                    master_id = %self.inner.id,
                    slave = %config.slave,
                    mode = %config.mode,
                    seeded_through,
                    "Replication master running"
                );
                Ok(())
            }
            Err(err) => {
                self.roll_back(&session);
                tracing::error!(slave = %config.slave, error = %err, "Replication master start failed");
                Err(match err {
                    Error::StartupFailed(_) => err,
                    other => Error::startup(other.to_string()),
                })
            }
        }
    }

    /// Register, seed and release the shipper; returns the seeded high-water mark
    fn attach(&self, session: &Session, raw_store: &dyn RawStore) -> Result<LogInstant> {
        let sink: Arc<dyn ReplicationSink> = Arc::new(self.clone());
        session.log_manager.start_replication_master_role(sink)?;

        // Read after registering so no record falls between the image and the stream.
        let high_water_mark = session.log_manager.high_water_mark();
        if high_water_mark > 0 {
            session
                .ship_from
                .store(high_water_mark.saturating_add(1), Ordering::Release);
            session.shipper.seed(high_water_mark);
        }
        raw_store.send_database_image(&session.config.slave, high_water_mark)?;
        session.shipper.resume();
        Ok(high_water_mark)
    }

    fn roll_back(&self, session: &Session) {
        session.log_manager.stop_replication_master_role();
        session.shipper.stop(Duration::ZERO);
        session.buffer.close();
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.state = MasterState::Booted;
        lifecycle.session = None;
    }

    fn failure_handler(&self) -> FailureHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |err| {
            if let Some(inner) = inner.upgrade() {
                MasterController { inner }.handle_exceptions(err);
            }
        })
    }

    fn running_session(&self) -> Result<Arc<Session>> {
        let lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            MasterState::Running => lifecycle
                .session
                .clone()
                .ok_or_else(|| Error::fatal("running without a session")),
            MasterState::Stopping | MasterState::Stopped => Err(Error::closed(format!(
                "replication master is {:?}",
                lifecycle.state
            ))),
            MasterState::Failed => Err(Error::fatal(
                lifecycle
                    .last_failure
                    .clone()
                    .unwrap_or_else(|| "replication master failed".to_string()),
            )),
            other => Err(Error::invalid_state("running", other)),
        }
    }

    /// Copy one log record into the replication pipeline
    ///
    /// Never blocks longer than `append_max_wait`. A `BufferFull` that
    /// survives back-pressure fails the whole master; `RecordTooLarge`
    /// rejects just the record.
    pub fn append_log_record(
        &self,
        data_length: usize,
        instant: LogInstant,
        data: &[u8],
        data_offset: usize,
        optional_data: Option<&[u8]>,
        optional_offset: usize,
        optional_length: usize,
    ) -> Result<()> {
        let body = record_span(data, data_offset, data_length, "data")?;
        let optional: &[u8] = match optional_data {
            Some(optional) => record_span(optional, optional_offset, optional_length, "optional data")?,
            None if optional_length == 0 => &[],
            None => {
                return Err(Error::invalid_record(format!(
                    "optional length {} without optional data",
                    optional_length
                )));
            }
        };

        let session = self.running_session()?;
        if instant < session.ship_from.load(Ordering::Acquire) {
            self.inner.stats.lock().records_skipped += 1;
            return Ok(());
        }

        match session.buffer.append(instant, body, optional) {
            Ok(()) => {}
            Err(Error::BufferFull { .. }) => {
                self.relieve_back_pressure(&session, instant, body, optional)?
            }
            Err(err) => {
                if matches!(err, Error::RecordTooLarge { .. }) {
                    tracing::warn!(instant, error = %err, "Rejected log record");
                }
                return Err(err);
            }
        }

        let mut stats = self.inner.stats.lock();
        stats.records_appended += 1;
        stats.bytes_appended += encoded_len(body.len(), optional.len()) as u64;
        Ok(())
    }

    fn relieve_back_pressure(
        &self,
        session: &Session,
        instant: LogInstant,
        body: &[u8],
        optional: &[u8],
    ) -> Result<()> {
        let config = &session.config;
        self.inner.stats.lock().force_drains += 1;
        session.shipper.force_drain();
        tracing::debug!(instant, "Log buffer full, forcing a drain");

        let full = match session
            .buffer
            .append_timeout(instant, body, optional, config.append_max_wait)
        {
            Ok(()) => return Ok(()),
            Err(err @ Error::BufferFull { .. }) => err,
            Err(err) => return Err(err),
        };

        let full = if config.backpressure == BackPressurePolicy::ResizeOnce
            && !session.resized.swap(true, Ordering::AcqRel)
        {
            if session.buffer.grow(config.buffer_max_bytes) {
                self.inner.stats.lock().resizes += 1;
                tracing::info!(
                    from = config.buffer_bytes,
                    to = config.buffer_max_bytes,
                    "Grew replication log buffer"
                );
            }
            match session.buffer.append(instant, body, optional) {
                Ok(()) => return Ok(()),
                Err(err @ Error::BufferFull { .. }) => err,
                Err(err) => return Err(err),
            }
        } else {
            full
        };

        self.handle_exceptions(Error::fatal(format!(
            "{} at instant {} after waiting {:?}",
            full, instant, config.append_max_wait
        )));
        Err(full)
    }

    /// The local log is durable through `instant`
    ///
    /// Asynchronous and one-safe modes only record it. Two-safe blocks
    /// until the slave acknowledged `instant` or `flush_timeout` passes.
    pub fn flushed_to(&self, instant: LogInstant) -> Result<()> {
        let session = self.running_session()?;
        {
            let mut stats = self.inner.stats.lock();
            stats.last_flushed = stats.last_flushed.max(Some(instant));
        }
        if !session.config.mode.is_synchronous() {
            return Ok(());
        }

        session.shipper.request_flush(instant);
        let result = session
            .shipper
            .wait_acked(instant, session.config.flush_timeout);
        if let Err(Error::FlushTimeout { .. }) = &result {
            tracing::warn!(
                instant,
                last_acked = ?session.shipper.last_acked(),
                timeout_ms = session.config.flush_timeout.as_millis() as u64,
                "Synchronous flush timed out"
            );
        }
        result
    }

    /// Drain, disconnect and deregister
    ///
    /// Records still unacknowledged at `shutdown_deadline` are a logged
    /// data-loss event in asynchronous and one-safe modes and a hard
    /// failure (FAILED, `Fatal`) in two-safe mode. Stopping a FAILED master
    /// only releases its resources.
    pub fn stop_master(&self) -> Result<StopReport> {
        let _transition = self.inner.transition.lock();
        let started = Instant::now();
        let (session, was_failed) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.state {
                MasterState::Running => {
                    lifecycle.state = MasterState::Stopping;
                    (lifecycle.session.clone(), false)
                }
                MasterState::Failed => (lifecycle.session.take(), true),
                MasterState::Stopped => {
                    return Ok(StopReport::new(MasterState::Stopped, None, started));
                }
                other => return Err(Error::invalid_state("running", other)),
            }
        };

        let Some(session) = session else {
            return Ok(StopReport::new(MasterState::Failed, None, started));
        };

        if was_failed {
            session.log_manager.stop_replication_master_role();
            let outcome = session.shipper.stop(Duration::ZERO);
            session.buffer.close();
            self.keep_final_stats(&outcome);
            tracing::info!(
                unacked_records = outcome.unacked_records,
                "Released resources of failed replication master"
            );
            return Ok(StopReport::new(MasterState::Failed, Some(&outcome), started));
        }

        tracing::info!(
            deadline_ms = session.config.shutdown_deadline.as_millis() as u64,
            "Stopping replication master"
        );
        session.log_manager.stop_replication_master_role();
        let outcome = session.shipper.stop(session.config.shutdown_deadline);
        session.buffer.close();
        self.keep_final_stats(&outcome);

        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.session = None;
        if lifecycle.state == MasterState::Failed {
            let failure = lifecycle
                .last_failure
                .clone()
                .unwrap_or_else(|| "replication master failed while stopping".to_string());
            return Err(Error::fatal(failure));
        }

        if outcome.is_complete() {
            lifecycle.state = MasterState::Stopped;
            tracing::info!(last_acked = ?outcome.last_acked, "Replication master stopped");
            return Ok(StopReport::new(MasterState::Stopped, Some(&outcome), started));
        }

        if session.config.mode.is_synchronous() {
            let diagnostic = format!(
                "{} records ({} bytes) after instant {:?} never reached slave {}",
                outcome.unacked_records,
                outcome.unacked_bytes,
                outcome.last_acked,
                session.config.slave
            );
            lifecycle.state = MasterState::Failed;
            lifecycle.last_failure = Some(diagnostic.clone());
            tracing::error!(error = %diagnostic, "Two-safe replication stopped with unacknowledged records");
            return Err(Error::fatal(diagnostic));
        }

        lifecycle.state = MasterState::Stopped;
        tracing::warn!(
            unacked_records = outcome.unacked_records,
            unacked_bytes = outcome.unacked_bytes,
            last_acked = ?outcome.last_acked,
            joined = outcome.joined,
            "Replication stopped before the slave caught up; the slave is missing records"
        );
        Ok(StopReport::new(MasterState::Stopped, Some(&outcome), started))
    }

    fn keep_final_stats(&self, outcome: &DrainOutcome) {
        let mut stats = self.inner.stats.lock();
        stats.last_acked = outcome.last_acked;
        stats.buffered_bytes = outcome.unacked_bytes;
    }

    /// Unrecoverable shipping or buffering failure
    ///
    /// Moves a RUNNING or STOPPING master to FAILED, deregisters it from
    /// the log manager, closes the buffer and tells the shipper to exit.
    /// Never joins, so the shipper thread may call it.
    pub fn handle_exceptions(&self, err: Error) {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.state {
                MasterState::Running | MasterState::Stopping => {
                    lifecycle.state = MasterState::Failed;
                    lifecycle.last_failure = Some(err.to_string());
                    lifecycle.session.clone()
                }
                state => {
                    tracing::debug!(?state, error = %err, "Ignoring failure report");
                    return;
                }
            }
        };
        tracing::error!(master_id = %self.inner.id, error = %err, "Replication master failed");
        if let Some(session) = session {
            session.log_manager.stop_replication_master_role();
            session.shipper.abort();
            session.buffer.close();
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> MasterState {
        self.inner.lifecycle.lock().state
    }

    /// Configuration, once booted
    pub fn config(&self) -> Option<MasterConfig> {
        self.inner.lifecycle.lock().config.clone()
    }

    /// Diagnostic of the failure that moved the master to FAILED
    pub fn last_failure(&self) -> Option<String> {
        self.inner.lifecycle.lock().last_failure.clone()
    }

    /// Shipper state while a session exists
    pub fn shipper_state(&self) -> Option<ShipperState> {
        let session = self.inner.lifecycle.lock().session.clone();
        session.map(|s| s.shipper.state())
    }

    /// Pause or resume shipping; records keep accumulating while paused
    pub fn set_shipping_paused(&self, paused: bool) -> Result<()> {
        let session = self.running_session()?;
        if paused {
            session.shipper.pause();
        } else {
            session.shipper.resume();
        }
        Ok(())
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MasterStats {
        let session = self.inner.lifecycle.lock().session.clone();
        let mut stats = self.inner.stats.lock().clone();
        if let Some(session) = session {
            stats.last_acked = session.shipper.last_acked();
            stats.buffered_bytes = session.buffer.used_bytes();
        }
        stats
    }
}

impl ReplicationSink for MasterController {
    fn append_log_record(
        &self,
        data_length: usize,
        instant: LogInstant,
        data: &[u8],
        data_offset: usize,
        optional_data: Option<&[u8]>,
        optional_offset: usize,
        optional_length: usize,
    ) -> Result<()> {
        MasterController::append_log_record(
            self,
            data_length,
            instant,
            data,
            data_offset,
            optional_data,
            optional_offset,
            optional_length,
        )
    }

    fn flushed_to(&self, instant: LogInstant) -> Result<()> {
        MasterController::flushed_to(self, instant)
    }
}

impl std::fmt::Debug for MasterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.inner.lifecycle.lock();
        f.debug_struct("MasterController")
            .field("id", &self.inner.id)
            .field("state", &lifecycle.state)
            .field("config", &lifecycle.config)
            .field("last_failure", &lifecycle.last_failure)
            .finish()
    }
}

fn record_span<'a>(source: &'a [u8], offset: usize, length: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(length)
        .and_then(|end| source.get(offset..end))
        .ok_or_else(|| {
            Error::invalid_record(format!(
                "{} span {}+{} outside a {} byte array",
                what,
                offset,
                length,
                source.len()
            ))
        })
}
