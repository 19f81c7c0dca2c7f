//! Logship Core - master side of database log replication
//!
//! This crate intercepts the write-ahead log of an embedded database and
//! ships it to a standby slave:
//! - Log interception hook handed to the local log manager
//! - Bounded in-memory replication log buffer
//! - Log shipper thread with batching, acks and reconnects
//! - Asynchronous, one-safe and two-safe consistency modes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ append_log_record ┌──────────────────┐
//! │ Log manager  │ ────────────────► │ MasterController │
//! │  (local WAL) │    flushed_to     │                  │
//! └──────────────┘                   └────────┬─────────┘
//!                                             │ append
//!                                    ┌────────▼─────────┐
//!                                    │ ReplicationLog-  │
//!                                    │ Buffer (ring)    │
//!                                    └────────┬─────────┘
//!                                             │ next_batch / release_through
//!                                    ┌────────▼─────────┐   frames    ┌───────┐
//!                                    │ LogShipper       │ ──────────► │ Slave │
//!                                    │ (own thread)     │ ◄────────── │       │
//!                                    └──────────────────┘    acks     └───────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use logship_core::{MasterController, Properties};
//! # fn collaborators() -> (
//! #     std::sync::Arc<dyn logship_core::RawStore>,
//! #     std::sync::Arc<dyn logship_core::DataFactory>,
//! #     std::sync::Arc<dyn logship_core::LogManager>,
//! # ) { unimplemented!() }
//!
//! let mut props = Properties::new();
//! props.insert("replication.mode".into(), "two-safe".into());
//! props.insert("replication.slave.host".into(), "standby.local".into());
//! props.insert("replication.slave.port".into(), "4851".into());
//!
//! let master = MasterController::with_tcp();
//! master.boot(false, &props)?;
//! let (raw_store, data_factory, log_manager) = collaborators();
//! master.start_master(raw_store, data_factory, log_manager)?;
//! // ... the log manager now feeds the master ...
//! let report = master.stop_master()?;
//! println!("stopped with {} unacked records", report.unacked_records);
//! # Ok::<(), logship_core::Error>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod log_buffer;
pub mod shipper;
pub mod stats;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use collaborators::{DataFactory, LogManager, RawStore, ReplicationSink};
pub use config::{BackPressurePolicy, MasterConfig, Properties, ReplicationMode, SlaveEndpoint};
pub use controller::{MasterController, MasterState, StopReport};
pub use error::{Error, Result};
pub use log_buffer::{BufferStats, LogBatch, Readiness, ReplicationLogBuffer};
pub use shipper::{DrainOutcome, LogShipper, ShipperState};
pub use stats::MasterStats;
pub use transport::{TcpTransport, TcpTransportFactory, Transport, TransportFactory};

/// Position of a record in the write-ahead log; strictly increasing
pub type LogInstant = u64;
