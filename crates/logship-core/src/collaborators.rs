//! Interfaces between the replication master and the rest of the database
//!
//! The master never looks anything up in a process-wide registry: the
//! database hands it these handles in `start_master`, and the master hands
//! itself to the log manager as a [`ReplicationSink`].

use crate::config::SlaveEndpoint;
use crate::{LogInstant, Result};
use std::sync::Arc;

/// Hook the log manager calls for every record it persists
///
/// Implemented by the master controller.
pub trait ReplicationSink: Send + Sync {
    /// Copy one log record into the replication pipeline
    ///
    /// `data[data_offset..data_offset + data_length]` is the record body and
    /// `optional_data[optional_offset..optional_offset + optional_length]`
    /// the optional part.
    fn append_log_record(
        &self,
        data_length: usize,
        instant: LogInstant,
        data: &[u8],
        data_offset: usize,
        optional_data: Option<&[u8]>,
        optional_offset: usize,
        optional_length: usize,
    ) -> Result<()>;

    /// Everything up to `instant` is durable in the local log
    fn flushed_to(&self, instant: LogInstant) -> Result<()>;
}

/// The local write-ahead log manager
pub trait LogManager: Send + Sync {
    /// Start diverting records to `sink`
    fn start_replication_master_role(&self, sink: Arc<dyn ReplicationSink>) -> Result<()>;

    /// Stop diverting records; idempotent
    fn stop_replication_master_role(&self);

    /// Highest instant already persisted in the local log
    fn high_water_mark(&self) -> LogInstant;
}

/// Raw store: owner of the on-disk database image
pub trait RawStore: Send + Sync {
    /// Hand a full database image, consistent through `through`, to the slave
    ///
    /// How the image travels (streaming copy or snapshot) belongs to the
    /// implementation.
    fn send_database_image(&self, slave: &SlaveEndpoint, through: LogInstant) -> Result<()>;
}

/// Data factory: owner of the data files
pub trait DataFactory: Send + Sync {
    /// A read-only database cannot act as replication master
    fn is_read_only(&self) -> bool;
}
