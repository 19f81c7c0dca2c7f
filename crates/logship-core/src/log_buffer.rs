//! Replication log buffer
//!
//! Bounded FIFO of serialized log records between the log writer (single
//! producer) and the log shipper (single consumer).
//!
//! Records are stored in a byte ring in their wire form
//! (`[instant:u64][data_len:u32][opt_len:u32][data][opt]`), so a batch is a
//! straight copy of the oldest bytes. A side index remembers each frame's
//! instant, length and arrival time. Admission counts bytes, never records.
//!
//! ```text
//!            head                        head + used
//!             v                               v
//! ring  [....|frame 100|frame 101|frame 102|.........]
//! index       (100,80)  (101,80)  (102,80)
//! ```
//!
//! Records stay in the buffer after `next_batch` hands them out; only
//! `release_through` (driven by slave acks) frees space.

use crate::{Error, LogInstant, Result};
use bytes::{Bytes, BytesMut};
use logship_protocol::record::{RECORD_HEADER_LEN, encoded_len, write_header};
use logship_protocol::BatchFrame;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Batch of contiguous records taken from the front of the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    /// Instant of the first record
    pub first_instant: LogInstant,
    /// Instant of the last record
    pub high_instant: LogInstant,
    /// Number of records
    pub record_count: u32,
    /// Serialized records, ready to frame
    pub payload: Bytes,
}

impl LogBatch {
    /// Serialized size of the records
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Wire frame carrying this batch
    pub fn to_frame(&self) -> BatchFrame {
        BatchFrame::new(self.first_instant, self.record_count, self.payload.clone())
    }
}

/// Why [`ReplicationLogBuffer::wait_ready`] returned
///
/// Variants are listed in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A flush or drain is waiting, or the buffer closed with records left
    Urgent,
    /// At least `ready_bytes` are buffered
    Full,
    /// The oldest record has waited at least `max_delay`
    Aged,
    /// Timed out with nothing due
    Idle,
    /// Closed and empty
    Closed,
}

/// Point-in-time buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Records currently buffered
    pub records: usize,
    /// Serialized bytes currently buffered
    pub used_bytes: usize,
    /// Current capacity
    pub capacity: usize,
    /// Highest instant ever admitted
    pub last_appended: Option<LogInstant>,
    /// Highest instant released
    pub last_released: Option<LogInstant>,
    /// Records admitted since creation
    pub appended_total: u64,
    /// Records released since creation
    pub released_total: u64,
    /// Appends rejected with `BufferFull`
    pub full_rejections: u64,
    /// Closed flag
    pub closed: bool,
}

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    instant: LogInstant,
    len: usize,
    enqueued_at: Instant,
}

/// Fixed-capacity byte ring
struct ByteRing {
    storage: Box<[u8]>,
    head: usize,
    used: usize,
}

impl ByteRing {
    fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            used: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.used
    }

    /// Caller checks `bytes.len() <= free()`
    fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let cap = self.capacity();
        let tail = (self.head + self.used) % cap;
        let first = bytes.len().min(cap - tail);
        self.storage[tail..tail + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        self.storage[..rest].copy_from_slice(&bytes[first..]);
        self.used += bytes.len();
    }

    fn copy_prefix(&self, len: usize, out: &mut BytesMut) {
        let first = len.min(self.capacity() - self.head);
        out.extend_from_slice(&self.storage[self.head..self.head + first]);
        out.extend_from_slice(&self.storage[..len - first]);
    }

    fn consume(&mut self, len: usize) {
        self.used -= len;
        self.head = if self.used == 0 {
            0
        } else {
            (self.head + len) % self.capacity()
        };
    }

    /// Re-linearize into a larger ring
    fn grow(&mut self, capacity: usize) {
        let mut linear = BytesMut::with_capacity(self.used);
        self.copy_prefix(self.used, &mut linear);
        let mut storage = vec![0u8; capacity].into_boxed_slice();
        storage[..self.used].copy_from_slice(&linear);
        self.storage = storage;
        self.head = 0;
    }
}

struct BufferState {
    ring: ByteRing,
    frames: VecDeque<FrameMeta>,
    last_appended: Option<LogInstant>,
    last_released: Option<LogInstant>,
    closed: bool,
    urgent: bool,
    /// Byte level the consumer wants to be woken at
    ready_hint: usize,
    appended_total: u64,
    released_total: u64,
    full_rejections: u64,
}

/// Bounded, thread-safe FIFO of serialized log records
pub struct ReplicationLogBuffer {
    state: Mutex<BufferState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl ReplicationLogBuffer {
    /// Create a buffer holding at most `capacity` serialized bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                ring: ByteRing::new(capacity),
                frames: VecDeque::new(),
                last_appended: None,
                last_released: None,
                closed: false,
                urgent: false,
                ready_hint: usize::MAX,
                appended_total: 0,
                released_total: 0,
                full_rejections: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Admit one record, failing fast if it does not fit
    pub fn append(&self, instant: LogInstant, data: &[u8], optional: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.append_locked(&mut state, instant, data, optional)
    }

    /// Admit one record, waiting up to `timeout` for space
    ///
    /// Only `BufferFull` is waited out; every other rejection returns at once.
    pub fn append_timeout(
        &self,
        instant: LogInstant,
        data: &[u8],
        optional: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match self.append_locked(&mut state, instant, data, optional) {
                Err(Error::BufferFull { .. }) if Instant::now() < deadline => {
                    state.full_rejections -= 1;
                    self.not_full.wait_until(&mut state, deadline);
                }
                other => return other,
            }
        }
    }

    fn append_locked(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        instant: LogInstant,
        data: &[u8],
        optional: &[u8],
    ) -> Result<()> {
        if state.closed {
            return Err(Error::closed("replication log buffer is closed"));
        }
        if let Some(previous) = state.last_appended {
            if instant <= previous {
                return Err(Error::NonMonotonicInstant {
                    previous,
                    got: instant,
                });
            }
        }
        let size = encoded_len(data.len(), optional.len());
        if size > state.ring.capacity() {
            return Err(Error::RecordTooLarge {
                size,
                capacity: state.ring.capacity(),
            });
        }
        if size > state.ring.free() {
            state.full_rejections += 1;
            return Err(Error::BufferFull {
                needed: size,
                available: state.ring.free(),
            });
        }

        let was_empty = state.frames.is_empty();
        let used_before = state.ring.used;

        let mut header = [0u8; RECORD_HEADER_LEN];
        write_header(&mut &mut header[..], instant, data.len(), optional.len());
        state.ring.write(&header);
        state.ring.write(data);
        state.ring.write(optional);
        state.frames.push_back(FrameMeta {
            instant,
            len: size,
            enqueued_at: Instant::now(),
        });
        state.last_appended = Some(instant);
        state.appended_total += 1;

        let crossed_hint = used_before < state.ready_hint && state.ring.used >= state.ready_hint;
        if was_empty || crossed_hint {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Oldest contiguous prefix of at most `max_bytes`, blocking while empty
    ///
    /// The first record is always included, even when it alone exceeds
    /// `max_bytes`. Returns `Closed` once the buffer is closed and drained.
    pub fn next_batch(&self, max_bytes: usize) -> Result<LogBatch> {
        let mut state = self.state.lock();
        loop {
            if let Some(batch) = Self::batch_locked(&state, max_bytes) {
                return Ok(batch);
            }
            if state.closed {
                return Err(Error::closed("replication log buffer is closed"));
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`next_batch`](Self::next_batch) but gives up after `timeout`
    pub fn next_batch_timeout(
        &self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Option<LogBatch>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(batch) = Self::batch_locked(&state, max_bytes) {
                return Ok(Some(batch));
            }
            if state.closed {
                return Err(Error::closed("replication log buffer is closed"));
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return Ok(Self::batch_locked(&state, max_bytes));
            }
        }
    }

    fn batch_locked(state: &BufferState, max_bytes: usize) -> Option<LogBatch> {
        let first = state.frames.front()?;
        let mut total = 0usize;
        let mut count = 0u32;
        let mut high = first.instant;
        for frame in &state.frames {
            if count > 0 && total + frame.len > max_bytes {
                break;
            }
            total += frame.len;
            count += 1;
            high = frame.instant;
        }
        let mut payload = BytesMut::with_capacity(total);
        state.ring.copy_prefix(total, &mut payload);
        Some(LogBatch {
            first_instant: first.instant,
            high_instant: high,
            record_count: count,
            payload: payload.freeze(),
        })
    }

    /// Block until a batch is due, in priority order Urgent > Full > Aged
    ///
    /// Returns `Idle` after `timeout` if nothing became due and `Closed` if
    /// the buffer is closed and empty.
    pub fn wait_ready(
        &self,
        ready_bytes: usize,
        max_delay: Duration,
        timeout: Duration,
    ) -> Readiness {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.ready_hint = ready_bytes;
        let readiness = self.wait_ready_locked(&mut state, ready_bytes, max_delay, deadline);
        state.ready_hint = usize::MAX;
        readiness
    }

    fn wait_ready_locked(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        ready_bytes: usize,
        max_delay: Duration,
        deadline: Instant,
    ) -> Readiness {
        loop {
            let now = Instant::now();
            let oldest = state.frames.front().map(|frame| frame.enqueued_at);
            let wake_at = match oldest {
                Some(enqueued_at) => {
                    if state.urgent || state.closed {
                        state.urgent = false;
                        return Readiness::Urgent;
                    }
                    if state.ring.used >= ready_bytes {
                        return Readiness::Full;
                    }
                    let age = now.saturating_duration_since(enqueued_at);
                    if age >= max_delay {
                        return Readiness::Aged;
                    }
                    deadline.min(now + (max_delay - age))
                }
                None if state.closed => return Readiness::Closed,
                None => deadline,
            };
            if now >= deadline {
                return Readiness::Idle;
            }
            self.not_empty.wait_until(state, wake_at);
        }
    }

    /// Ask the consumer to send whatever is buffered without waiting for
    /// the size or age triggers
    pub fn kick(&self) {
        let mut state = self.state.lock();
        state.urgent = true;
        self.not_empty.notify_all();
    }

    /// Drop every record with instant <= `instant`; returns how many went
    ///
    /// Repeating a release is a no-op; `last_released` never moves back.
    pub fn release_through(&self, instant: LogInstant) -> usize {
        let mut state = self.state.lock();
        let mut released = 0usize;
        let mut bytes = 0usize;
        while let Some(front) = state.frames.front() {
            if front.instant > instant {
                break;
            }
            bytes += front.len;
            released += 1;
            state.frames.pop_front();
        }
        state.ring.consume(bytes);
        state.last_released = state.last_released.max(Some(instant));
        state.released_total += released as u64;
        if released > 0 {
            self.not_full.notify_all();
        }
        released
    }

    /// Raise capacity to `capacity`; never shrinks. Returns true if it grew.
    pub fn grow(&self, capacity: usize) -> bool {
        let mut state = self.state.lock();
        if capacity <= state.ring.capacity() {
            return false;
        }
        state.ring.grow(capacity);
        self.not_full.notify_all();
        true
    }

    /// Refuse further appends and wake every waiter
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// True once `close` ran
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// True when no record is buffered
    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Serialized bytes buffered
    pub fn used_bytes(&self) -> usize {
        self.state.lock().ring.used
    }

    /// Current capacity in bytes
    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    /// Highest instant currently buffered
    pub fn high_instant(&self) -> Option<LogInstant> {
        self.state.lock().frames.back().map(|f| f.instant)
    }

    /// Highest instant ever admitted
    pub fn last_appended(&self) -> Option<LogInstant> {
        self.state.lock().last_appended
    }

    /// Highest instant released so far
    pub fn last_released(&self) -> Option<LogInstant> {
        self.state.lock().last_released
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            records: state.frames.len(),
            used_bytes: state.ring.used,
            capacity: state.ring.capacity(),
            last_appended: state.last_appended,
            last_released: state.last_released,
            appended_total: state.appended_total,
            released_total: state.released_total,
            full_rejections: state.full_rejections,
            closed: state.closed,
        }
    }
}

impl std::fmt::Debug for ReplicationLogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationLogBuffer")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_protocol::LogRecord;
    use std::sync::Arc;
    use std::thread;

    const REC: usize = RECORD_HEADER_LEN + 64;

    fn fill(buffer: &ReplicationLogBuffer, instants: std::ops::Range<u64>) {
        for i in instants {
            buffer.append(i, &[i as u8; 64], &[]).unwrap();
        }
    }

    #[test]
    fn test_exact_capacity_record() {
        let buffer = ReplicationLogBuffer::new(256);
        let body = vec![7u8; 256 - RECORD_HEADER_LEN];
        buffer.append(1, &body, &[]).unwrap();
        assert_eq!(buffer.used_bytes(), 256);

        let buffer = ReplicationLogBuffer::new(256);
        let body = vec![7u8; 256 - RECORD_HEADER_LEN + 1];
        let err = buffer.append(1, &body, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::RecordTooLarge {
                size: 257,
                capacity: 256
            }
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_is_distinct_from_too_large() {
        let buffer = ReplicationLogBuffer::new(REC * 3);
        fill(&buffer, 1..4);
        let err = buffer.append(4, &[0u8; 64], &[]).unwrap_err();
        assert!(matches!(err, Error::BufferFull { needed: REC, available: 0 }));
        assert_eq!(buffer.stats().full_rejections, 1);

        assert_eq!(buffer.release_through(1), 1);
        buffer.append(4, &[0u8; 64], &[]).unwrap();
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_rejects_non_monotonic() {
        let buffer = ReplicationLogBuffer::new(1024);
        buffer.append(10, b"a", &[]).unwrap();
        let err = buffer.append(10, b"b", &[]).unwrap_err();
        assert!(matches!(err, Error::NonMonotonicInstant { previous: 10, got: 10 }));
        assert!(buffer.append(9, b"c", &[]).is_err());

        // Release does not reset ordering.
        buffer.release_through(10);
        assert!(buffer.append(10, b"d", &[]).is_err());
        buffer.append(11, b"e", &[]).unwrap();
    }

    #[test]
    fn test_batch_respects_max_bytes() {
        let buffer = ReplicationLogBuffer::new(1024);
        fill(&buffer, 100..110);

        let batch = buffer.next_batch(REC * 3 + 10).unwrap();
        assert_eq!(batch.first_instant, 100);
        assert_eq!(batch.high_instant, 102);
        assert_eq!(batch.record_count, 3);
        assert_eq!(batch.size_bytes(), REC * 3);

        // Not removed until released.
        assert_eq!(buffer.next_batch(REC * 3).unwrap(), batch);

        // Oversized single record still ships alone.
        let one = buffer.next_batch(1).unwrap();
        assert_eq!(one.record_count, 1);
        assert_eq!(one.high_instant, 100);
    }

    #[test]
    fn test_wrap_around_preserves_records() {
        let buffer = ReplicationLogBuffer::new(REC * 4 + 7);
        fill(&buffer, 1..5);
        buffer.release_through(2);
        buffer.append(5, &[5u8; 60], &[0xEE; 4]).unwrap();
        buffer.append(6, &[6u8; 64], &[]).unwrap();

        let batch = buffer.next_batch(usize::MAX).unwrap();
        let records = LogRecord::decode_all(batch.payload).unwrap();
        let instants: Vec<u64> = records.iter().map(|r| r.instant).collect();
        assert_eq!(instants, vec![3, 4, 5, 6]);
        assert_eq!(records[2].data.as_ref(), &[5u8; 60]);
        assert_eq!(records[2].optional.as_ref(), &[0xEE; 4]);
        assert_eq!(records[3].data.as_ref(), &[6u8; 64]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let buffer = ReplicationLogBuffer::new(1024);
        fill(&buffer, 1..6);
        assert_eq!(buffer.release_through(3), 3);
        assert_eq!(buffer.release_through(3), 0);
        assert_eq!(buffer.release_through(2), 0);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.last_released(), Some(3));
        assert_eq!(buffer.high_instant(), Some(5));
    }

    #[test]
    fn test_repeated_release_drops_late_record() {
        let buffer = ReplicationLogBuffer::new(1024);
        assert_eq!(buffer.release_through(10), 0);
        buffer.append(7, b"late", &[]).unwrap();
        assert_eq!(buffer.release_through(10), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.used_bytes(), 0);
    }

    #[test]
    fn test_close_unblocks_consumer_and_rejects_appends() {
        let buffer = Arc::new(ReplicationLogBuffer::new(1024));
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.next_batch(1024))
        };
        thread::sleep(Duration::from_millis(50));
        buffer.close();

        let result = consumer.join().unwrap();
        assert!(matches!(result, Err(Error::Closed(_))));
        assert!(matches!(buffer.append(1, b"x", &[]), Err(Error::Closed(_))));
    }

    #[test]
    fn test_closed_buffer_still_drains() {
        let buffer = ReplicationLogBuffer::new(1024);
        fill(&buffer, 1..3);
        buffer.close();
        assert_eq!(buffer.next_batch(1024).unwrap().record_count, 2);
        assert_eq!(
            buffer.wait_ready(1024, Duration::from_secs(1), Duration::ZERO),
            Readiness::Urgent
        );
        buffer.release_through(2);
        assert!(buffer.next_batch(1024).is_err());
        assert_eq!(
            buffer.wait_ready(1024, Duration::from_secs(1), Duration::from_millis(10)),
            Readiness::Closed
        );
    }

    #[test]
    fn test_consumer_wakes_on_first_record() {
        let buffer = Arc::new(ReplicationLogBuffer::new(1024));
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.next_batch(1024))
        };
        thread::sleep(Duration::from_millis(30));
        buffer.append(42, b"hello", b"world").unwrap();

        let batch = consumer.join().unwrap().unwrap();
        assert_eq!(batch.first_instant, 42);
        assert_eq!(batch.size_bytes(), RECORD_HEADER_LEN + 10);
    }

    #[test]
    fn test_next_batch_timeout() {
        let buffer = ReplicationLogBuffer::new(1024);
        assert_eq!(
            buffer
                .next_batch_timeout(1024, Duration::from_millis(20))
                .unwrap(),
            None
        );
        fill(&buffer, 1..2);
        assert!(
            buffer
                .next_batch_timeout(1024, Duration::ZERO)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_wait_ready_priorities() {
        let buffer = ReplicationLogBuffer::new(1024);
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::from_secs(10), Duration::from_millis(10)),
            Readiness::Idle
        );

        fill(&buffer, 1..2);
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::from_secs(10), Duration::from_millis(10)),
            Readiness::Idle
        );
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::from_millis(5), Duration::from_secs(1)),
            Readiness::Aged
        );

        fill(&buffer, 2..3);
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::ZERO, Duration::from_secs(1)),
            Readiness::Full
        );

        buffer.kick();
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::ZERO, Duration::from_secs(1)),
            Readiness::Urgent
        );
        // Kick is consumed.
        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::ZERO, Duration::from_secs(1)),
            Readiness::Full
        );
    }

    #[test]
    fn test_size_hint_only_armed_while_waiting() {
        let buffer = Arc::new(ReplicationLogBuffer::new(1024));
        assert_eq!(buffer.state.lock().ready_hint, usize::MAX);

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                buffer.wait_ready(REC * 2, Duration::from_secs(30), Duration::from_secs(30))
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.state.lock().ready_hint != REC * 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buffer.state.lock().ready_hint, REC * 2);

        buffer.kick();
        fill(&buffer, 1..2);
        assert_eq!(consumer.join().unwrap(), Readiness::Urgent);
        assert_eq!(buffer.state.lock().ready_hint, usize::MAX);

        assert_eq!(
            buffer.wait_ready(REC * 2, Duration::from_secs(10), Duration::from_millis(5)),
            Readiness::Idle
        );
        assert_eq!(buffer.state.lock().ready_hint, usize::MAX);
    }

    #[test]
    fn test_wait_ready_wakes_on_size_threshold() {
        let buffer = Arc::new(ReplicationLogBuffer::new(2048));
        fill(&buffer, 1..2);
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let readiness =
                    buffer.wait_ready(REC * 3, Duration::from_secs(30), Duration::from_secs(30));
                (readiness, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        fill(&buffer, 2..4);

        let (readiness, elapsed) = consumer.join().unwrap();
        assert_eq!(readiness, Readiness::Full);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_append_timeout_waits_for_release() {
        let buffer = Arc::new(ReplicationLogBuffer::new(REC * 2));
        fill(&buffer, 1..3);
        let releaser = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                buffer.release_through(1);
            })
        };
        buffer
            .append_timeout(3, &[3u8; 64], &[], Duration::from_secs(5))
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(buffer.high_instant(), Some(3));

        let err = buffer
            .append_timeout(4, &[4u8; 64], &[], Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::BufferFull { .. }));
    }

    #[test]
    fn test_grow_keeps_contents() {
        let buffer = ReplicationLogBuffer::new(REC * 3);
        fill(&buffer, 1..4);
        buffer.release_through(1);
        buffer.append(4, &[4u8; 64], &[]).unwrap();

        assert!(buffer.grow(REC * 6));
        assert!(!buffer.grow(REC * 2));
        assert_eq!(buffer.capacity(), REC * 6);
        fill(&buffer, 5..8);

        let batch = buffer.next_batch(usize::MAX).unwrap();
        let instants: Vec<u64> = LogRecord::decode_all(batch.payload)
            .unwrap()
            .iter()
            .map(|r| r.instant)
            .collect();
        assert_eq!(instants, vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let buffer = Arc::new(ReplicationLogBuffer::new(REC * 8));
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 1..=500u64 {
                    buffer
                        .append_timeout(i, &[i as u8; 64], &[], Duration::from_secs(10))
                        .unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.last() != Some(&500u64) {
            let batch = buffer.next_batch(REC * 3).unwrap();
            for record in LogRecord::decode_all(batch.payload.clone()).unwrap() {
                assert_eq!(record.data[0], record.instant as u8);
                seen.push(record.instant);
            }
            buffer.release_through(batch.high_instant);
            assert!(buffer.used_bytes() <= buffer.capacity());
        }
        producer.join().unwrap();
        assert_eq!(seen, (1..=500).collect::<Vec<_>>());
    }
}
