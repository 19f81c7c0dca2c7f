//! End-to-end replication tests over TCP
//!
//! A master controller ships the log of an in-memory database to a stub
//! slave listening on loopback:
//! - Asynchronous happy path
//! - Transient slave outage
//! - Back-pressure under fail-fast and resize-once
//! - Two-safe flushes
//! - Oversize records
//! - Graceful stop with and without a reachable slave

use logship_core::testing::{
    MemoryLogManager, RecordingRawStore, StaticDataFactory, StubSlave, init_tracing,
};
use logship_core::{
    BackPressurePolicy, Error, MasterConfig, MasterController, MasterState, ReplicationMode,
};
use logship_protocol::encoded_len;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    slave: StubSlave,
    master: MasterController,
    log: Arc<MemoryLogManager>,
    raw_store: Arc<RecordingRawStore>,
}

fn base_config(mode: ReplicationMode, slave: &StubSlave) -> MasterConfig {
    MasterConfig::new(mode, "127.0.0.1", slave.port())
        .with_reconnect(Duration::from_millis(10), Duration::from_millis(100))
        .with_failure_budget(200, Duration::from_secs(10))
        .with_batching(8192, Duration::from_millis(5))
}

fn start(slave: StubSlave, config: MasterConfig, log: Arc<MemoryLogManager>) -> Rig {
    init_tracing();
    let master = MasterController::with_tcp();
    master.boot_with_config(false, config).unwrap();
    let raw_store = RecordingRawStore::new();
    master
        .start_master(raw_store.clone(), StaticDataFactory::writable(), log.clone())
        .unwrap();
    assert_eq!(master.state(), MasterState::Running);
    Rig {
        slave,
        master,
        log,
        raw_store,
    }
}

fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn body(instant: u64, len: usize) -> Vec<u8> {
    vec![(instant % 251) as u8; len]
}

#[test]
fn test_async_happy_path() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave).with_buffer_bytes(1024);
    let rig = start(slave, config, MemoryLogManager::new());

    for instant in 100..110 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }

    assert!(rig.slave.wait_for_instant(109, WAIT));
    assert!(eventually(WAIT, || {
        let stats = rig.master.stats();
        stats.last_acked == Some(109) && stats.buffered_bytes == 0
    }));
    assert_eq!(rig.slave.received_instants(), (100..110).collect::<Vec<_>>());
    let records = rig.slave.received();
    assert!(records.iter().all(|r| r.data.len() == 64 && r.optional.is_empty()));

    // Empty log at start: the image is consistent through instant 0
    assert_eq!(rig.raw_store.requests(), vec![(rig.slave.endpoint(), 0)]);

    let stats = rig.master.stats();
    assert_eq!(stats.records_appended, 10);
    assert_eq!(stats.bytes_appended, 10 * encoded_len(64, 0) as u64);

    let report = rig.master.stop_master().unwrap();
    assert_eq!(report.state, MasterState::Stopped);
    assert_eq!(report.unacked_records, 0);
    assert!(!rig.log.is_registered());
}

#[test]
fn test_optional_data_reaches_slave() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave);
    let rig = start(slave, config, MemoryLogManager::new());

    rig.log.write(1, b"update row 7", Some(&b"undo row 7"[..])).unwrap();
    rig.log.write(2, b"commit", None).unwrap();

    assert!(rig.slave.wait_for_instant(2, WAIT));
    let records = rig.slave.received();
    assert_eq!(&records[0].data[..], b"update row 7");
    assert_eq!(&records[0].optional[..], b"undo row 7");
    assert_eq!(&records[1].data[..], b"commit");
    assert!(records[1].optional.is_empty());

    rig.master.stop_master().unwrap();
}

#[test]
fn test_transient_disconnect_resumes_without_duplicates() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave);
    let rig = start(slave, config, MemoryLogManager::new());

    for instant in 1..=50 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    assert!(eventually(WAIT, || rig.master.stats().last_acked == Some(50)));

    rig.slave.set_offline(true);
    let outage = Instant::now();
    for instant in 51..=80 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
    if let Some(rest) = Duration::from_millis(500).checked_sub(outage.elapsed()) {
        std::thread::sleep(rest);
    }
    assert_eq!(rig.master.state(), MasterState::Running);
    rig.slave.set_offline(false);

    assert!(rig.slave.wait_for_instant(80, WAIT));
    assert!(eventually(WAIT, || rig.master.stats().last_acked == Some(80)));
    assert_eq!(rig.slave.received_instants(), (1..=80).collect::<Vec<_>>());

    let stats = rig.master.stats();
    assert!(stats.reconnects >= 1);
    assert!(stats.send_failures >= 1);
    assert!(rig.slave.connections() >= 2);
    assert_eq!(rig.master.state(), MasterState::Running);

    rig.master.stop_master().unwrap();
}

#[test]
fn test_full_buffer_fails_fast() {
    let slave = StubSlave::start().unwrap();
    // Exactly five serialized records fit
    let capacity = 5 * encoded_len(64, 0);
    let config = base_config(ReplicationMode::Asynchronous, &slave)
        .with_buffer_bytes(capacity)
        .with_append_max_wait(Duration::from_millis(50));
    let rig = start(slave, config, MemoryLogManager::new());
    rig.master.set_shipping_paused(true).unwrap();

    for instant in 1..=5 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    let started = Instant::now();
    let err = rig.log.write(6, &body(6, 64), None).unwrap_err();
    assert!(matches!(err, Error::BufferFull { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(rig.master.state(), MasterState::Failed);
    assert!(rig.master.last_failure().is_some());
    assert!(!rig.log.is_registered());
    assert_eq!(rig.master.stats().force_drains, 1);
    assert!(rig.slave.received_instants().is_empty());

    let report = rig.master.stop_master().unwrap();
    assert_eq!(report.state, MasterState::Failed);
    assert_eq!(rig.master.state(), MasterState::Failed);
}

#[test]
fn test_full_buffer_resizes_once() {
    let slave = StubSlave::start().unwrap();
    let record = encoded_len(64, 0);
    let config = base_config(ReplicationMode::Asynchronous, &slave)
        .with_buffer_bytes(5 * record)
        .with_backpressure(BackPressurePolicy::ResizeOnce, 7 * record)
        .with_append_max_wait(Duration::from_millis(20));
    let rig = start(slave, config, MemoryLogManager::new());
    rig.master.set_shipping_paused(true).unwrap();

    for instant in 1..=7 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    assert_eq!(rig.master.state(), MasterState::Running);
    assert_eq!(rig.master.stats().resizes, 1);

    // The ceiling is reached and the one resize is spent
    let err = rig.log.write(8, &body(8, 64), None).unwrap_err();
    assert!(matches!(err, Error::BufferFull { .. }), "got {err:?}");
    assert_eq!(rig.master.state(), MasterState::Failed);
    assert_eq!(rig.master.stats().resizes, 1);

    rig.master.stop_master().unwrap();
}

#[test]
fn test_two_safe_flush_waits_for_ack() {
    let slave = StubSlave::start().unwrap();
    let ack_delay = Duration::from_millis(100);
    slave.set_ack_delay(ack_delay);
    let config = base_config(ReplicationMode::TwoSafe, &slave)
        .with_batching(8192, Duration::from_secs(1))
        .with_flush_timeout(Duration::from_secs(5));
    let rig = start(slave, config, MemoryLogManager::with_high_water_mark(199));
    assert_eq!(rig.raw_store.requests(), vec![(rig.slave.endpoint(), 199)]);

    rig.log.write(200, b"commit txn 17", None).unwrap();
    let started = Instant::now();
    rig.log.flush(200).unwrap();
    let elapsed = started.elapsed();

    // The one-second batch delay never kicked in; the flush did
    assert!(elapsed >= ack_delay, "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");
    assert_eq!(rig.slave.received_instants(), vec![200]);
    assert_eq!(rig.master.stats().last_acked, Some(200));
    assert_eq!(rig.master.stats().last_flushed, Some(200));

    rig.master.stop_master().unwrap();
}

#[test]
fn test_two_safe_flush_times_out_without_ack() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::TwoSafe, &slave)
        .with_flush_timeout(Duration::from_millis(100));
    let rig = start(slave, config, MemoryLogManager::new());

    rig.slave.pause_acks(true);
    rig.log.write(1, b"insert", None).unwrap();
    let err = rig.log.flush(1).unwrap_err();
    assert!(matches!(err, Error::FlushTimeout { instant: 1 }), "got {err:?}");
    assert_eq!(rig.master.state(), MasterState::Running);

    rig.slave.pause_acks(false);
    assert!(eventually(WAIT, || rig.log.flush(1).is_ok()));
    rig.master.stop_master().unwrap();
}

#[test]
fn test_async_flush_returns_immediately() {
    let slave = StubSlave::start().unwrap();
    slave.pause_acks(true);
    let config = base_config(ReplicationMode::OneSafe, &slave);
    let rig = start(slave, config, MemoryLogManager::new());

    rig.log.write(1, b"insert", None).unwrap();
    let started = Instant::now();
    rig.log.flush(1).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(rig.master.stats().last_flushed, Some(1));

    rig.slave.pause_acks(false);
    assert!(eventually(WAIT, || rig.master.stats().last_acked == Some(1)));
    rig.master.stop_master().unwrap();
}

#[test]
fn test_oversize_record_rejected_master_keeps_running() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave).with_buffer_bytes(1024);
    let rig = start(slave, config, MemoryLogManager::new());

    let err = rig.log.write(1, &vec![0u8; 1025], None).unwrap_err();
    assert!(matches!(err, Error::RecordTooLarge { .. }), "got {err:?}");
    assert_eq!(rig.master.state(), MasterState::Running);

    rig.log.write(2, b"small", None).unwrap();
    assert!(rig.slave.wait_for_instant(2, WAIT));
    assert_eq!(rig.slave.received_instants(), vec![2]);

    rig.master.stop_master().unwrap();
}

#[test]
fn test_graceful_stop_drains_pending_records() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave)
        .with_buffer_bytes(128 * 1024)
        .with_batching(8192, Duration::from_millis(5))
        .with_shutdown_deadline(Duration::from_secs(2));
    let rig = start(slave, config, MemoryLogManager::new());
    rig.master.set_shipping_paused(true).unwrap();

    for instant in 1..=1000 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    assert_eq!(rig.master.stats().buffered_bytes, 1000 * encoded_len(64, 0));

    let report = rig.master.stop_master().unwrap();
    assert_eq!(report.state, MasterState::Stopped);
    assert_eq!(report.unacked_records, 0);
    assert_eq!(report.last_acked, Some(1000));
    assert!(report.elapsed < Duration::from_secs(3));
    assert_eq!(rig.slave.received_instants(), (1..=1000).collect::<Vec<_>>());
    assert_eq!(rig.master.state(), MasterState::Stopped);
    let stats = rig.master.stats();
    assert_eq!(stats.last_acked, Some(1000));
    assert_eq!(stats.buffered_bytes, 0);
}

#[test]
fn test_async_stop_with_unreachable_slave_reports_loss() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave)
        .with_shutdown_deadline(Duration::from_millis(300));
    let rig = start(slave, config, MemoryLogManager::new());
    rig.master.set_shipping_paused(true).unwrap();

    for instant in 1..=10 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    rig.slave.set_offline(true);

    let report = rig.master.stop_master().unwrap();
    assert_eq!(report.state, MasterState::Stopped);
    assert_eq!(report.unacked_records, 10);
    assert_eq!(report.unacked_bytes, 10 * encoded_len(64, 0));
    assert_eq!(report.last_acked, None);
    assert_eq!(rig.master.state(), MasterState::Stopped);
}

#[test]
fn test_two_safe_stop_with_unreachable_slave_fails() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::TwoSafe, &slave)
        .with_shutdown_deadline(Duration::from_millis(300));
    let rig = start(slave, config, MemoryLogManager::new());
    rig.master.set_shipping_paused(true).unwrap();

    for instant in 1..=10 {
        rig.log.write(instant, &body(instant, 64), None).unwrap();
    }
    rig.slave.set_offline(true);

    let err = rig.master.stop_master().unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "got {err:?}");
    assert_eq!(rig.master.state(), MasterState::Failed);
    assert!(rig.master.last_failure().is_some());
    assert!(!rig.log.is_registered());
}

#[test]
fn test_protocol_error_from_slave_fails_master() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave);
    let rig = start(slave, config, MemoryLogManager::new());

    rig.slave
        .reply_error_next(logship_protocol::ErrorCode::StorageFailure, "disk full");
    rig.log.write(1, b"insert", None).unwrap();

    assert!(eventually(WAIT, || rig.master.state() == MasterState::Failed));
    let failure = rig.master.last_failure().unwrap();
    assert!(failure.contains("disk full"), "{failure}");
    assert!(!rig.log.is_registered());

    let err = rig.log.write(2, b"insert", None);
    assert!(err.is_ok(), "deregistered log manager keeps writing locally");
}

#[test]
fn test_restart_after_stop() {
    let slave = StubSlave::start().unwrap();
    let config = base_config(ReplicationMode::Asynchronous, &slave);
    let rig = start(slave, config.clone(), MemoryLogManager::new());

    rig.log.write(1, b"first", None).unwrap();
    assert!(rig.slave.wait_for_instant(1, WAIT));
    rig.master.stop_master().unwrap();

    let err = rig
        .master
        .start_master(
            rig.raw_store.clone(),
            StaticDataFactory::writable(),
            rig.log.clone(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }), "got {err:?}");

    // A fresh controller seeds from the log's high-water mark and carries on
    let master = MasterController::with_tcp();
    master.boot_with_config(false, config).unwrap();
    master
        .start_master(
            rig.raw_store.clone(),
            StaticDataFactory::writable(),
            rig.log.clone(),
        )
        .unwrap();
    assert_eq!(rig.raw_store.requests().last(), Some(&(rig.slave.endpoint(), 1)));

    // Already part of the image handed over at start
    rig.log.write(1, b"first", None).unwrap();
    rig.log.write(2, b"second", None).unwrap();
    assert!(rig.slave.wait_for_instant(2, WAIT));
    assert_eq!(rig.slave.received_instants(), vec![1, 2]);
    assert_eq!(master.stats().records_skipped, 1);
    master.stop_master().unwrap();
}
