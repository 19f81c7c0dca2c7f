//! Transport client: framed, ordered byte channel to the slave
//!
//! The shipper thread owns its transport exclusively, so the trait takes
//! `&mut self` and needs no internal locking.

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::{MasterConfig, SlaveEndpoint};
use crate::log_buffer::LogBatch;
use crate::{Error, LogInstant, Result};
use logship_protocol::{ErrorCode, SlaveReply};
use std::io::{BufWriter, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connection to one slave
pub trait Transport: Send {
    /// Open the connection; fails fast with `Disconnected` while backing off
    fn connect(&mut self) -> Result<()>;

    /// Ship one batch and wait for the slave's ack
    ///
    /// Returns the acked instant, which is never above `batch.high_instant`.
    /// Fails fast with `Disconnected` while the connection is down.
    fn send(&mut self, batch: &LogBatch) -> Result<LogInstant>;

    /// True while connected
    fn is_up(&self) -> bool;

    /// Drop the connection
    fn close(&mut self);

    /// Time until the next `connect` attempt is allowed
    fn reconnect_delay(&self) -> Duration;

    /// Remote endpoint
    fn peer(&self) -> &SlaveEndpoint;
}

/// Builds transports for the controller
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport for `config.slave`
    fn create(&self, config: &MasterConfig) -> Result<Box<dyn Transport>>;
}

/// Blocking TCP transport
pub struct TcpTransport {
    peer: SlaveEndpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    backoff: Backoff,
    frames_sent: u64,
}

impl TcpTransport {
    /// Create an unconnected transport
    pub fn new(
        peer: SlaveEndpoint,
        connect_timeout: Duration,
        io_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            peer,
            connect_timeout,
            io_timeout,
            stream: None,
            backoff: Backoff::new(backoff),
            frames_sent: 0,
        }
    }

    /// Create from a master configuration
    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(
            config.slave.clone(),
            config.connect_timeout,
            config.io_timeout,
            BackoffConfig::new(config.reconnect_initial, config.reconnect_max),
        )
    }

    /// Frames successfully acked on this transport
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    fn open(&self) -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.peer.host.as_str(), self.peer.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.peer),
            )
        }))
    }

    /// Tear down after a failed exchange so the next send fails fast
    fn mark_down(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.backoff.record_failure();
    }

    fn exchange(stream: &mut TcpStream, batch: &LogBatch) -> Result<SlaveReply> {
        let frame = batch.to_frame();
        let mut writer = BufWriter::new(&mut *stream);
        frame.write_to_sync(&mut writer)?;
        writer.flush()?;
        drop(writer);
        Ok(SlaveReply::read_from_sync(stream)?)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if !self.backoff.ready() {
            return Err(Error::disconnected(format!(
                "backing off from {}, next attempt in {:?}",
                self.peer,
                self.backoff.remaining()
            )));
        }
        match self.open() {
            Ok(stream) => {
                tracing::info!(
                    peer = %self.peer,
                    attempts = self.backoff.failures() + 1,
                    "Connected to replication slave"
                );
                self.stream = Some(stream);
                self.backoff.reset();
                Ok(())
            }
            Err(e) => {
                let delay = self.backoff.record_failure();
                tracing::warn!(
                    peer = %self.peer,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to connect to replication slave"
                );
                Err(Error::disconnected(format!("connect to {}: {}", self.peer, e)))
            }
        }
    }

    fn send(&mut self, batch: &LogBatch) -> Result<LogInstant> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::disconnected(format!("no connection to {}", self.peer)))?;

        let reply = match Self::exchange(stream, batch) {
            Ok(reply) => reply,
            Err(e) => {
                self.mark_down();
                return Err(e);
            }
        };

        match reply {
            SlaveReply::Ack { instant } if instant <= batch.high_instant => {
                self.frames_sent += 1;
                tracing::trace!(
                    peer = %self.peer,
                    first = batch.first_instant,
                    high = batch.high_instant,
                    ack = instant,
                    "Batch acknowledged"
                );
                Ok(instant)
            }
            SlaveReply::Ack { instant } => {
                self.mark_down();
                Err(Error::protocol(
                    ErrorCode::MalformedFrame,
                    format!(
                        "slave acked {} beyond batch high instant {}",
                        instant, batch.high_instant
                    ),
                ))
            }
            SlaveReply::Error { code, message } => {
                self.mark_down();
                Err(Error::protocol(code, message))
            }
        }
    }

    fn is_up(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(peer = %self.peer, "Closed replication connection");
        }
    }

    fn reconnect_delay(&self) -> Duration {
        self.backoff.remaining()
    }

    fn peer(&self) -> &SlaveEndpoint {
        &self.peer
    }
}

/// Factory producing [`TcpTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, config: &MasterConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::from_config(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_protocol::{BatchFrame, LogRecord};
    use std::net::TcpListener;
    use std::thread;

    fn batch(first: u64, count: u64) -> LogBatch {
        let records: Vec<LogRecord> = (first..first + count)
            .map(|i| LogRecord::new(i, vec![i as u8; 8], Vec::new()))
            .collect();
        let frame = BatchFrame::from_records(&records).unwrap();
        LogBatch {
            first_instant: first,
            high_instant: first + count - 1,
            record_count: count as u32,
            payload: frame.payload,
        }
    }

    fn transport_to(port: u16) -> TcpTransport {
        TcpTransport::new(
            SlaveEndpoint::new("127.0.0.1", port),
            Duration::from_millis(500),
            Duration::from_millis(500),
            BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(1)).without_jitter(),
        )
    }

    /// One-connection slave answering each frame with `reply(frame)`
    fn serve_once<F>(reply: F) -> (u16, thread::JoinHandle<Vec<BatchFrame>>)
    where
        F: Fn(&BatchFrame) -> SlaveReply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut frames = Vec::new();
            while let Ok(Some(frame)) = BatchFrame::read_from_sync(&mut stream) {
                let answer = reply(&frame);
                let stop = matches!(answer, SlaveReply::Error { .. });
                answer.write_to_sync(&mut stream).unwrap();
                frames.push(frame);
                if stop {
                    break;
                }
            }
            frames
        });
        (port, handle)
    }

    #[test]
    fn test_send_and_ack() {
        let (port, slave) = serve_once(|frame| SlaveReply::Ack {
            instant: frame.first_instant + frame.record_count as u64 - 1,
        });
        let mut transport = transport_to(port);
        assert!(!transport.is_up());
        transport.connect().unwrap();
        assert!(transport.is_up());

        assert_eq!(transport.send(&batch(100, 3)).unwrap(), 102);
        assert_eq!(transport.send(&batch(103, 2)).unwrap(), 104);
        assert_eq!(transport.frames_sent(), 2);
        transport.close();
        assert!(!transport.is_up());

        let frames = slave.join().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].first_instant, 103);
        let records = frames[0].records().unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_send_while_down_fails_fast() {
        let mut transport = transport_to(1);
        let err = transport.send(&batch(1, 1)).unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[test]
    fn test_connect_failure_backs_off() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut transport = transport_to(port);

        assert!(matches!(transport.connect(), Err(Error::Disconnected(_))));
        assert!(transport.reconnect_delay() > Duration::ZERO);

        // Second attempt inside the backoff window does not touch the network.
        let err = transport.connect().unwrap_err();
        assert!(err.to_string().contains("backing off"));
    }

    #[test]
    fn test_error_reply_is_protocol_error() {
        let (port, slave) = serve_once(|_| SlaveReply::Error {
            code: ErrorCode::InstantGap,
            message: "expected 10".into(),
        });
        let mut transport = transport_to(port);
        transport.connect().unwrap();

        let err = transport.send(&batch(12, 1)).unwrap_err();
        match err {
            Error::Protocol { code, message } => {
                assert_eq!(code, ErrorCode::InstantGap);
                assert_eq!(message, "expected 10");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!transport.is_up());
        slave.join().unwrap();
    }

    #[test]
    fn test_error_reply_on_open_connection_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let slave = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            BatchFrame::read_from_sync(&mut stream).unwrap();
            SlaveReply::Error {
                code: ErrorCode::InstantGap,
                message: "expected 10".into(),
            }
            .write_to_sync(&mut stream)
            .unwrap();
            // Hold the connection open past the transport's io timeout
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        let mut transport = TcpTransport::new(
            SlaveEndpoint::new("127.0.0.1", port),
            Duration::from_millis(500),
            Duration::from_millis(200),
            BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(1)).without_jitter(),
        );
        transport.connect().unwrap();

        let err = transport.send(&batch(12, 1)).unwrap_err();
        match err {
            Error::Protocol { code, message } => {
                assert_eq!(code, ErrorCode::InstantGap);
                assert_eq!(message, "expected 10");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!transport.is_up());
        let _ = release_tx.send(());
        slave.join().unwrap();
    }

    #[test]
    fn test_ack_beyond_batch_is_rejected() {
        let (port, _slave) = serve_once(|_| SlaveReply::Ack { instant: 1_000 });
        let mut transport = transport_to(port);
        transport.connect().unwrap();
        let err = transport.send(&batch(1, 2)).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(!transport.is_up());
    }

    #[test]
    fn test_peer_drop_marks_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let slave = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let mut transport = transport_to(port);
        transport.connect().unwrap();
        slave.join().unwrap();

        let err = transport.send(&batch(1, 1)).unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(!transport.is_up());
    }
}
