//! In-memory stand-ins for the database side of the master

use crate::collaborators::{DataFactory, LogManager, RawStore, ReplicationSink};
use crate::config::SlaveEndpoint;
use crate::{Error, LogInstant, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Log manager that persists nothing and forwards records to the sink
#[derive(Default)]
pub struct MemoryLogManager {
    sink: Mutex<Option<Arc<dyn ReplicationSink>>>,
    high_water_mark: AtomicU64,
    refuse_registration: AtomicBool,
    registrations: AtomicU64,
}

impl MemoryLogManager {
    /// Empty log
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Log that already holds everything through `instant`
    pub fn with_high_water_mark(instant: LogInstant) -> Arc<Self> {
        let manager = Self::default();
        manager.high_water_mark.store(instant, Ordering::SeqCst);
        Arc::new(manager)
    }

    /// Make `start_replication_master_role` fail
    pub fn refuse_registration(&self, refuse: bool) {
        self.refuse_registration.store(refuse, Ordering::SeqCst);
    }

    /// True while a sink is registered
    pub fn is_registered(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Successful registrations so far
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Persist one record and hand it to the sink, if any
    pub fn write(&self, instant: LogInstant, data: &[u8], optional: Option<&[u8]>) -> Result<()> {
        self.high_water_mark.fetch_max(instant, Ordering::SeqCst);
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.append_log_record(
                data.len(),
                instant,
                data,
                0,
                optional,
                0,
                optional.map_or(0, <[u8]>::len),
            ),
            None => Ok(()),
        }
    }

    /// Report the log durable through `instant`
    pub fn flush(&self, instant: LogInstant) -> Result<()> {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.flushed_to(instant),
            None => Ok(()),
        }
    }
}

impl LogManager for MemoryLogManager {
    fn start_replication_master_role(&self, sink: Arc<dyn ReplicationSink>) -> Result<()> {
        if self.refuse_registration.load(Ordering::SeqCst) {
            return Err(Error::startup("log manager refused the replication hook"));
        }
        *self.sink.lock() = Some(sink);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_replication_master_role(&self) {
        self.sink.lock().take();
    }

    fn high_water_mark(&self) -> LogInstant {
        self.high_water_mark.load(Ordering::SeqCst)
    }
}

/// Raw store that records seeding requests
#[derive(Default)]
pub struct RecordingRawStore {
    requests: Mutex<Vec<(SlaveEndpoint, LogInstant)>>,
    fail: AtomicBool,
}

impl RecordingRawStore {
    /// Store that accepts every request
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `send_database_image` fail
    pub fn fail_seeding(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Seeding requests received, in order
    pub fn requests(&self) -> Vec<(SlaveEndpoint, LogInstant)> {
        self.requests.lock().clone()
    }
}

impl RawStore for RecordingRawStore {
    fn send_database_image(&self, slave: &SlaveEndpoint, through: LogInstant) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::startup(format!("cannot copy database image to {}", slave)));
        }
        self.requests.lock().push((slave.clone(), through));
        Ok(())
    }
}

/// Data factory with a fixed read-only flag
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDataFactory {
    /// Reported by `is_read_only`
    pub read_only: bool,
}

impl StaticDataFactory {
    /// Writable database
    pub fn writable() -> Arc<Self> {
        Arc::new(Self { read_only: false })
    }

    /// Read-only database
    pub fn read_only() -> Arc<Self> {
        Arc::new(Self { read_only: true })
    }
}

impl DataFactory for StaticDataFactory {
    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
