//! Stub slave over real TCP
//!
//! Runs its own tokio runtime on a background thread so blocking tests can
//! drive it. Applies each record once (resends are deduplicated by
//! instant) and acks the highest applied instant.

use crate::LogInstant;
use crate::config::SlaveEndpoint;
use logship_protocol::{BatchFrame, ErrorCode, LogRecord, SlaveReply};
use parking_lot::{Condvar, Mutex};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

#[derive(Default)]
struct StubState {
    applied: Vec<LogRecord>,
    applied_through: Option<LogInstant>,
    frames: u64,
    connections: u64,
    drop_next: u32,
    error_reply: Option<(ErrorCode, String)>,
    ack_delay: Duration,
    acks_paused: bool,
    offline: bool,
    refused: u64,
}

struct Shared {
    state: Mutex<StubState>,
    applied: Condvar,
    /// Bumped to make every live connection hang up
    hang_up: watch::Sender<u64>,
}

enum Verdict {
    Ack(LogInstant),
    Error(ErrorCode, String),
    Drop,
}

/// TCP slave for end-to-end tests
pub struct StubSlave {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StubSlave {
    /// Listen on an ephemeral loopback port
    pub fn start() -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(StubState::default()),
            applied: Condvar::new(),
            hang_up: watch::Sender::new(0),
        });
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stub-slave")
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("stub-slave-accept".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, accept_shared, shutdown_rx).await,
                        Err(e) => tracing::error!(error = %e, "Stub slave could not register listener"),
                    }
                });
            })?;

        tracing::debug!(%addr, "Stub slave listening");
        Ok(Self {
            addr,
            shared,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Endpoint for a master configuration
    pub fn endpoint(&self) -> SlaveEndpoint {
        SlaveEndpoint::new("127.0.0.1", self.addr.port())
    }

    /// Instants applied, in order, without duplicates
    pub fn received_instants(&self) -> Vec<LogInstant> {
        self.shared
            .state
            .lock()
            .applied
            .iter()
            .map(|r| r.instant)
            .collect()
    }

    /// Records applied, in order
    pub fn received(&self) -> Vec<LogRecord> {
        self.shared.state.lock().applied.clone()
    }

    /// Frames received, resends included
    pub fn frames(&self) -> u64 {
        self.shared.state.lock().frames
    }

    /// Connections accepted
    pub fn connections(&self) -> u64 {
        self.shared.state.lock().connections
    }

    /// Apply the next `count` frames but close the connection instead of acking
    pub fn drop_connection_next(&self, count: u32) {
        self.shared.state.lock().drop_next = count;
    }

    /// Answer the next frame with an error reply and close the connection
    pub fn reply_error_next(&self, code: ErrorCode, message: impl Into<String>) {
        self.shared.state.lock().error_reply = Some((code, message.into()));
    }

    /// Delay every ack
    pub fn set_ack_delay(&self, delay: Duration) {
        self.shared.state.lock().ack_delay = delay;
    }

    /// Withhold acks until called again with `false`
    pub fn pause_acks(&self, paused: bool) {
        self.shared.state.lock().acks_paused = paused;
    }

    /// Connections closed right after accept while offline
    pub fn refused(&self) -> u64 {
        self.shared.state.lock().refused
    }

    /// Drop every live connection; while offline new connections are
    /// closed as soon as they are accepted
    pub fn set_offline(&self, offline: bool) {
        self.shared.state.lock().offline = offline;
        if offline {
            self.disconnect_all();
        }
    }

    /// Drop every live connection once
    pub fn disconnect_all(&self) {
        self.shared.hang_up.send_modify(|generation| *generation += 1);
    }

    /// Wait until `instant` is applied
    pub fn wait_for_instant(&self, instant: LogInstant, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.applied_through.is_some_and(|through| through >= instant) {
            if self.shared.applied.wait_until(&mut state, deadline).timed_out() {
                return state.applied_through.is_some_and(|through| through >= instant);
            }
        }
        true
    }

    /// Stop listening and drop every connection
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StubSlave {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !admit(&shared) {
                        tracing::debug!(%peer, "Stub slave offline, closing connection");
                        drop(stream);
                        continue;
                    }
                    tracing::debug!(%peer, "Stub slave accepted connection");
                    tokio::spawn(serve(stream, shared.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stub slave accept failed");
                    break;
                }
            },
        }
    }
}

fn admit(shared: &Shared) -> bool {
    let mut state = shared.state.lock();
    if state.offline {
        state.refused += 1;
        return false;
    }
    state.connections += 1;
    true
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let _ = stream.set_nodelay(true);
    let mut hang_up = shared.hang_up.subscribe();
    loop {
        let read = tokio::select! {
            read = BatchFrame::read_from(&mut stream) => read,
            _ = hang_up.changed() => return,
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "Stub slave read failed");
                return;
            }
        };

        let (verdict, delay) = apply(&shared, &frame);
        while acks_paused(&shared) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = match verdict {
            Verdict::Ack(instant) => SlaveReply::Ack { instant },
            Verdict::Error(code, message) => SlaveReply::Error { code, message },
            Verdict::Drop => return,
        };
        let close = matches!(reply, SlaveReply::Error { .. });
        if reply.write_to(&mut stream).await.is_err() || close {
            return;
        }
    }
}

fn acks_paused(shared: &Shared) -> bool {
    shared.state.lock().acks_paused
}

fn apply(shared: &Shared, frame: &BatchFrame) -> (Verdict, Duration) {
    let mut state = shared.state.lock();
    state.frames += 1;
    if let Some((code, message)) = state.error_reply.take() {
        return (Verdict::Error(code, message), Duration::ZERO);
    }
    let records = match frame.records() {
        Ok(records) => records,
        Err(e) => {
            return (
                Verdict::Error(ErrorCode::MalformedFrame, e.to_string()),
                Duration::ZERO,
            );
        }
    };
    let high = records.last().map(|r| r.instant);
    for record in records {
        if state
            .applied_through
            .is_some_and(|through| record.instant <= through)
        {
            continue;
        }
        state.applied_through = Some(record.instant);
        state.applied.push(record);
    }
    shared.applied.notify_all();

    if state.drop_next > 0 {
        state.drop_next -= 1;
        return (Verdict::Drop, Duration::ZERO);
    }
    // Never ack past the frame, even when a longer earlier frame was applied.
    let ack = match (state.applied_through, high) {
        (Some(through), Some(high)) => through.min(high),
        (through, _) => through.unwrap_or(frame.first_instant.saturating_sub(1)),
    };
    (Verdict::Ack(ack), state.ack_delay)
}
