//! In-process slave and transport
//!
//! No sockets and no runtime: the transport applies frames directly to a
//! shared [`LoopbackSlave`], which tests drive to inject faults.

use crate::config::{MasterConfig, SlaveEndpoint};
use crate::log_buffer::LogBatch;
use crate::transport::{Transport, TransportFactory};
use crate::{Error, LogInstant, Result};
use logship_protocol::{ErrorCode, LogRecord};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RETRY_DELAY: Duration = Duration::from_millis(5);

#[derive(Default)]
struct SlaveState {
    applied: Vec<LogRecord>,
    applied_through: Option<LogInstant>,
    frames: u64,
    connects: u64,
    unreachable: bool,
    epoch: u64,
    fail_sends: u32,
    error_reply: Option<(ErrorCode, String)>,
    ack_override: Option<LogInstant>,
    ack_delay: Duration,
}

/// Slave state shared by every transport it hands out
#[derive(Clone, Default)]
pub struct LoopbackSlave {
    state: Arc<Mutex<SlaveState>>,
    applied: Arc<Condvar>,
}

impl LoopbackSlave {
    /// Reachable slave with nothing applied
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconnected transport to this slave
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            slave: self.clone(),
            peer: SlaveEndpoint::new("loopback", 0),
            epoch: None,
            retry_at: None,
        }
    }

    /// Factory for the controller
    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            slave: self.clone(),
        }
    }

    /// Instants applied, in order, without duplicates
    pub fn received_instants(&self) -> Vec<LogInstant> {
        self.state.lock().applied.iter().map(|r| r.instant).collect()
    }

    /// Records applied, in order
    pub fn received(&self) -> Vec<LogRecord> {
        self.state.lock().applied.clone()
    }

    /// Frames received, resends included
    pub fn frames(&self) -> u64 {
        self.state.lock().frames
    }

    /// Successful connects
    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    /// Refuse connects; `false` also drops live connections
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.unreachable = !reachable;
        if !reachable {
            state.epoch += 1;
        }
    }

    /// Drop live connections once
    pub fn disconnect(&self) {
        self.state.lock().epoch += 1;
    }

    /// Fail the next `count` sends as if the connection reset
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().fail_sends = count;
    }

    /// Answer the next frame with an error reply
    pub fn reply_error_next(&self, code: ErrorCode, message: impl Into<String>) {
        self.state.lock().error_reply = Some((code, message.into()));
    }

    /// Ack this instant instead of the highest applied one
    pub fn ack_with(&self, instant: Option<LogInstant>) {
        self.state.lock().ack_override = instant;
    }

    /// Delay every ack
    pub fn set_ack_delay(&self, delay: Duration) {
        self.state.lock().ack_delay = delay;
    }

    /// Wait until `instant` is applied
    pub fn wait_for_instant(&self, instant: LogInstant, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.applied_through.is_some_and(|through| through >= instant) {
            if self.applied.wait_until(&mut state, deadline).timed_out() {
                return state.applied_through.is_some_and(|through| through >= instant);
            }
        }
        true
    }
}

/// Transport half of a [`LoopbackSlave`]
pub struct LoopbackTransport {
    slave: LoopbackSlave,
    peer: SlaveEndpoint,
    epoch: Option<u64>,
    retry_at: Option<Instant>,
}

impl LoopbackTransport {
    fn fail(&mut self, err: Error) -> Error {
        self.epoch = None;
        self.retry_at = Some(Instant::now() + RETRY_DELAY);
        err
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.slave.state.lock();
        if state.unreachable {
            drop(state);
            return Err(self.fail(Error::disconnected("loopback slave unreachable")));
        }
        state.connects += 1;
        self.epoch = Some(state.epoch);
        self.retry_at = None;
        Ok(())
    }

    fn send(&mut self, batch: &LogBatch) -> Result<LogInstant> {
        let delay = {
            let mut state = self.slave.state.lock();
            if self.epoch != Some(state.epoch) {
                drop(state);
                return Err(self.fail(Error::disconnected("loopback connection dropped")));
            }
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                drop(state);
                return Err(self.fail(Error::disconnected("loopback connection reset")));
            }
            state.frames += 1;
            if let Some((code, message)) = state.error_reply.take() {
                drop(state);
                return Err(self.fail(Error::protocol(code, message)));
            }

            let records = LogRecord::decode_all(batch.payload.clone())?;
            for record in records {
                if state.applied_through.is_some_and(|through| record.instant <= through) {
                    continue;
                }
                state.applied_through = Some(record.instant);
                state.applied.push(record);
            }
            self.slave.applied.notify_all();
            state.ack_delay
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let state = self.slave.state.lock();
        Ok(state
            .ack_override
            .unwrap_or(batch.high_instant)
            .min(batch.high_instant))
    }

    fn is_up(&self) -> bool {
        self.epoch.is_some()
    }

    fn close(&mut self) {
        self.epoch = None;
    }

    fn reconnect_delay(&self) -> Duration {
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn peer(&self) -> &SlaveEndpoint {
        &self.peer
    }
}

/// [`TransportFactory`] for a [`LoopbackSlave`]
#[derive(Clone)]
pub struct LoopbackFactory {
    slave: LoopbackSlave,
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, _config: &MasterConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.slave.transport()))
    }
}
