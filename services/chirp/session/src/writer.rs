//! Outbound queue, serialization and ack tracking for one connection.
//!
//! Four sources feed the socket, in priority order:
//!
//! 1. control bytes (TLS records and the handshake record), already encrypted
//! 2. ACK frames answering messages we received
//! 3. queued messages, FIFO
//!
//! Only one write is outstanding at a time. A partial write leaves the unsent
//! tail in place and it is re-submitted before anything else.
//!
//! Messages sent with an ack request move to the pending map once fully
//! written and stay there until the matching ACK arrives or the retry budget
//! runs out.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chirp_wire::{encoded_len, BufferPool, Message};
use tracing::{debug, trace, warn};

use crate::encryption::Shim;
use crate::error::ChirpError;

/// Handle returned by a send, echoed in its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendToken(pub u64);

/// How a send succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the socket; no ack was requested
    Sent,
    /// The peer acknowledged the message
    Acked,
}

/// Final outcome of one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Send this completes
    pub token: SendToken,
    /// Outcome
    pub result: Result<Delivery, ChirpError>,
}

impl Completion {
    fn ok(token: SendToken, delivery: Delivery) -> Self {
        Self {
            token,
            result: Ok(delivery),
        }
    }

    fn err(token: SendToken, err: ChirpError) -> Self {
        Self {
            token,
            result: Err(err),
        }
    }
}

/// A message owned by the writer
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Message with serial and type already assigned
    pub msg: Message,
    /// Send handle
    pub token: SendToken,
    /// Retransmissions so far
    pub retries: u32,
}

impl Outgoing {
    /// Fresh outgoing message
    pub fn new(msg: Message, token: SendToken) -> Self {
        Self {
            msg,
            token,
            retries: 0,
        }
    }
}

/// A sent message waiting for its ACK
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// The message as sent
    pub outgoing: Outgoing,
    /// When to retransmit or give up
    pub deadline: Instant,
}

#[derive(Debug)]
enum Sending {
    Control,
    Ack,
    Message { outgoing: Outgoing, acked: bool },
}

#[derive(Debug)]
struct InFlight {
    bytes: Bytes,
    offset: usize,
    what: Sending,
}

/// Writer limits
#[derive(Debug, Clone, Copy)]
pub struct WriterLimits {
    /// High-water mark in messages
    pub max_queue: usize,
    /// High-water mark in bytes
    pub max_queue_bytes: usize,
    /// Ack deadline
    pub timeout: Duration,
    /// Retransmissions before giving up
    pub retries: u32,
}

/// Everything a writer holds that can move to another connection
#[derive(Debug, Default)]
pub struct Backlog {
    queue: VecDeque<Outgoing>,
    acks: VecDeque<Message>,
    pending: BTreeMap<u32, PendingEntry>,
}

/// Outbound half of a connection
#[derive(Debug)]
pub struct Writer {
    limits: WriterLimits,
    control: VecDeque<Bytes>,
    acks: VecDeque<Message>,
    queue: VecDeque<Outgoing>,
    queued_bytes: usize,
    current: Option<InFlight>,
    pending: BTreeMap<u32, PendingEntry>,
}

impl Writer {
    /// Empty writer
    pub fn new(limits: WriterLimits) -> Self {
        Self {
            limits,
            control: VecDeque::new(),
            acks: VecDeque::new(),
            queue: VecDeque::new(),
            queued_bytes: 0,
            current: None,
            pending: BTreeMap::new(),
        }
    }

    /// Messages counted against the high-water mark
    pub fn queued(&self) -> usize {
        self.queue.len() + usize::from(self.current_message().is_some())
    }

    /// Bytes counted against the high-water mark
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes + self.current_message().map_or(0, |o| o.msg.body_len())
    }

    /// Messages awaiting an ACK
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Nothing queued, in flight or awaiting an ACK
    pub fn is_idle(&self) -> bool {
        self.control.is_empty()
            && self.acks.is_empty()
            && self.queue.is_empty()
            && self.current.is_none()
            && self.pending.is_empty()
    }

    /// Whether a write is outstanding on the socket
    pub fn is_writing(&self) -> bool {
        self.current.is_some()
    }

    fn current_message(&self) -> Option<&Outgoing> {
        match &self.current {
            Some(InFlight {
                what: Sending::Message { outgoing, .. },
                ..
            }) => Some(outgoing),
            _ => None,
        }
    }

    /// Reject the next send when the queue is at its high-water mark
    pub fn check_capacity(&self) -> Result<(), ChirpError> {
        if self.queued() >= self.limits.max_queue {
            return Err(ChirpError::Backpressure(format!(
                "{} messages queued",
                self.queued()
            )));
        }
        if self.queued_bytes() >= self.limits.max_queue_bytes {
            return Err(ChirpError::Backpressure(format!(
                "{} bytes queued",
                self.queued_bytes()
            )));
        }
        Ok(())
    }

    /// Append a message. Capacity is the caller's concern.
    pub fn enqueue(&mut self, outgoing: Outgoing) {
        self.queued_bytes += outgoing.msg.body_len();
        self.queue.push_back(outgoing);
    }

    /// Queue an ACK answering `msg`
    pub fn enqueue_ack(&mut self, msg: &Message) {
        self.acks.push_back(msg.ack());
    }

    /// Queue raw bytes that bypass serialization and encryption
    pub fn enqueue_control(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.control.push_back(bytes);
        }
    }

    /// Pick the next write, if nothing is outstanding.
    ///
    /// Messages and ACKs only go out once `established`; control bytes always
    /// do. The returned bytes must be handed to the socket as one write.
    pub fn next_write(
        &mut self,
        established: bool,
        shim: &mut Shim,
        pool: &BufferPool,
    ) -> Result<Option<Bytes>, ChirpError> {
        if self.current.is_some() {
            return Ok(None);
        }

        if let Some(bytes) = self.control.pop_front() {
            return Ok(Some(self.start(bytes, Sending::Control)));
        }
        if !established {
            return Ok(None);
        }

        if let Some(ack) = self.acks.pop_front() {
            let bytes = serialize(&ack, shim, pool)?;
            trace!("Writing ACK for serial {}", ack.serial);
            return Ok(Some(self.start(bytes, Sending::Ack)));
        }

        if let Some(outgoing) = self.queue.pop_front() {
            self.queued_bytes -= outgoing.msg.body_len();
            let bytes = match serialize(&outgoing.msg, shim, pool) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Keep the message accounted for so the caller can fail it
                    self.queued_bytes += outgoing.msg.body_len();
                    self.queue.push_front(outgoing);
                    return Err(e);
                }
            };
            trace!(
                "Writing serial {} (retry {})",
                outgoing.msg.serial,
                outgoing.retries
            );
            return Ok(Some(self.start(
                bytes,
                Sending::Message {
                    outgoing,
                    acked: false,
                },
            )));
        }

        Ok(None)
    }

    fn start(&mut self, bytes: Bytes, what: Sending) -> Bytes {
        self.current = Some(InFlight {
            bytes: bytes.clone(),
            offset: 0,
            what,
        });
        bytes
    }

    /// The socket accepted `n` bytes of the outstanding write.
    ///
    /// Returns the unsent tail to re-submit, or `None` once the write is
    /// complete.
    pub fn on_written(
        &mut self,
        n: usize,
        now: Instant,
        out: &mut Vec<Completion>,
    ) -> Option<Bytes> {
        let Some(mut inflight) = self.current.take() else {
            warn!("Write completion with nothing outstanding");
            return None;
        };

        inflight.offset = (inflight.offset + n).min(inflight.bytes.len());
        if inflight.offset < inflight.bytes.len() {
            let tail = inflight.bytes.slice(inflight.offset..);
            self.current = Some(inflight);
            return Some(tail);
        }

        if let Sending::Message { outgoing, acked } = inflight.what {
            self.message_written(outgoing, acked, now, out);
        }
        None
    }

    fn message_written(
        &mut self,
        outgoing: Outgoing,
        acked: bool,
        now: Instant,
        out: &mut Vec<Completion>,
    ) {
        if acked {
            out.push(Completion::ok(outgoing.token, Delivery::Acked));
        } else if outgoing.msg.requires_ack() {
            let serial = outgoing.msg.serial;
            self.pending.insert(
                serial,
                PendingEntry {
                    outgoing,
                    deadline: now + self.limits.timeout,
                },
            );
        } else {
            out.push(Completion::ok(outgoing.token, Delivery::Sent));
        }
    }

    /// Match an incoming ACK frame against what we sent.
    ///
    /// Unknown serials are ignored; they are late ACKs for sends that already
    /// timed out.
    pub fn on_ack(&mut self, ack: &Message, out: &mut Vec<Completion>) -> Result<(), ChirpError> {
        let serial = ack.serial;

        if let Some(entry) = self.pending.get(&serial) {
            if entry.outgoing.msg.identity != ack.identity {
                return Err(ChirpError::Protocol(format!(
                    "ACK for serial {} carries identity {}, expected {}",
                    serial, ack.identity, entry.outgoing.msg.identity
                )));
            }
            if let Some(entry) = self.pending.remove(&serial) {
                out.push(Completion::ok(entry.outgoing.token, Delivery::Acked));
            }
            return Ok(());
        }

        // A retransmission may be queued or on the wire when the first ACK lands
        if let Some(pos) = self
            .queue
            .iter()
            .position(|o| o.msg.serial == serial && o.msg.identity == ack.identity)
        {
            if let Some(outgoing) = self.queue.remove(pos) {
                self.queued_bytes -= outgoing.msg.body_len();
                out.push(Completion::ok(outgoing.token, Delivery::Acked));
            }
            return Ok(());
        }
        if let Some(InFlight {
            what: Sending::Message { outgoing, acked },
            ..
        }) = &mut self.current
        {
            if outgoing.msg.serial == serial && outgoing.msg.identity == ack.identity {
                *acked = true;
                return Ok(());
            }
        }

        debug!("Ignoring ACK for unknown serial {}", serial);
        Ok(())
    }

    /// Handle expired ACK deadlines: retransmit or report a timeout.
    ///
    /// Returns true when something was re-queued.
    pub fn sweep(&mut self, now: Instant, out: &mut Vec<Completion>) -> bool {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();

        let mut requeued = false;
        for serial in expired {
            let Some(entry) = self.pending.remove(&serial) else {
                continue;
            };
            let mut outgoing = entry.outgoing;
            if outgoing.retries < self.limits.retries {
                outgoing.retries += 1;
                debug!("Retransmitting serial {} (retry {})", serial, outgoing.retries);
                self.enqueue(outgoing);
                requeued = true;
            } else {
                debug!("Serial {} timed out after {} retries", serial, outgoing.retries);
                out.push(Completion::err(
                    outgoing.token,
                    ChirpError::Timeout(format!(
                        "no ACK for serial {} after {} retries",
                        serial, outgoing.retries
                    )),
                ));
            }
        }
        requeued
    }

    /// Fail every queued message that has not started writing
    pub fn fail_queued(&mut self, err: &ChirpError, out: &mut Vec<Completion>) {
        for outgoing in self.queue.drain(..) {
            out.push(Completion::err(outgoing.token, err.clone()));
        }
        self.queued_bytes = 0;
        self.acks.clear();
    }

    /// Fail every message awaiting an ACK
    pub fn fail_pending(&mut self, err: &ChirpError, out: &mut Vec<Completion>) {
        for (_, entry) in std::mem::take(&mut self.pending) {
            out.push(Completion::err(entry.outgoing.token, err.clone()));
        }
    }

    /// Fail everything, including a partially written message
    pub fn fail_all(&mut self, err: &ChirpError, out: &mut Vec<Completion>) {
        if let Some(InFlight {
            what: Sending::Message { outgoing, .. },
            ..
        }) = self.current.take()
        {
            out.push(Completion::err(outgoing.token, err.clone()));
        }
        self.fail_queued(err, out);
        self.fail_pending(err, out);
        self.control.clear();
    }

    /// Take everything that can be resent elsewhere. The outstanding write
    /// and control bytes stay: they belong to this socket, which finishes
    /// the write before it closes.
    pub fn take_backlog(&mut self) -> Backlog {
        self.queued_bytes = 0;
        Backlog {
            queue: std::mem::take(&mut self.queue),
            acks: std::mem::take(&mut self.acks),
            pending: std::mem::take(&mut self.pending),
        }
    }

    /// Adopt a backlog taken from another writer
    pub fn absorb(&mut self, backlog: Backlog) {
        for outgoing in backlog.queue {
            self.enqueue(outgoing);
        }
        self.acks.extend(backlog.acks);
        self.pending.extend(backlog.pending);
    }
}

fn serialize(msg: &Message, shim: &mut Shim, pool: &BufferPool) -> Result<Bytes, ChirpError> {
    let mut buf = pool.acquire_for(encoded_len(msg))?;
    chirp_wire::encode(msg, &mut *buf)?;
    shim.wrap_plaintext(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chirp_wire::{decode, Identity, MsgType};

    fn limits() -> WriterLimits {
        WriterLimits {
            max_queue: 3,
            max_queue_bytes: 1024,
            timeout: Duration::from_secs(1),
            retries: 2,
        }
    }

    fn outgoing(serial: u32, ack: bool) -> Outgoing {
        let mut msg = Message::new(Identity::from_slice(b"A").unwrap())
            .with_actor(vec![1u8])
            .with_data("ping");
        msg.serial = serial;
        if ack {
            msg.typ = MsgType::REQ_ACK;
        }
        Outgoing::new(msg, SendToken(u64::from(serial)))
    }

    /// Write everything currently writable in one go
    fn flush(writer: &mut Writer, now: Instant, out: &mut Vec<Completion>) -> Vec<Bytes> {
        let pool = BufferPool::new();
        let mut shim = Shim::Plain;
        let mut written = Vec::new();
        while let Some(bytes) = writer.next_write(true, &mut shim, &pool).unwrap() {
            assert!(writer.on_written(bytes.len(), now, out).is_none());
            written.push(bytes);
        }
        written
    }

    #[test]
    fn test_no_ack_reports_sent() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        writer.enqueue(outgoing(1, false));
        let frames = flush(&mut writer, Instant::now(), &mut out);

        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).unwrap().0, outgoing(1, false).msg);
        assert_eq!(out, vec![Completion::ok(SendToken(1), Delivery::Sent)]);
        assert!(writer.is_idle());
    }

    #[test]
    fn test_ack_completes_pending() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        let sent = outgoing(5, true);
        writer.enqueue(sent.clone());
        flush(&mut writer, Instant::now(), &mut out);
        assert!(out.is_empty());
        assert_eq!(writer.pending(), 1);

        writer.on_ack(&sent.msg.ack(), &mut out).unwrap();
        assert_eq!(out, vec![Completion::ok(SendToken(5), Delivery::Acked)]);
        assert!(writer.is_idle());

        // Late duplicate is ignored
        writer.on_ack(&sent.msg.ack(), &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_ack_with_wrong_identity_is_protocol_error() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        let sent = outgoing(5, true);
        writer.enqueue(sent.clone());
        flush(&mut writer, Instant::now(), &mut out);

        let mut ack = sent.msg.ack();
        ack.identity = Identity::from_slice(b"B").unwrap();
        assert!(matches!(
            writer.on_ack(&ack, &mut out),
            Err(ChirpError::Protocol(_))
        ));
    }

    #[test]
    fn test_backpressure_at_high_water_mark() {
        let mut writer = Writer::new(limits());
        for serial in 0..3 {
            writer.check_capacity().unwrap();
            writer.enqueue(outgoing(serial, false));
        }
        assert!(matches!(
            writer.check_capacity(),
            Err(ChirpError::Backpressure(_))
        ));
        assert_eq!(writer.queued(), 3);

        let mut out = Vec::new();
        let pool = BufferPool::new();
        let bytes = writer
            .next_write(true, &mut Shim::Plain, &pool)
            .unwrap()
            .unwrap();
        // Still counted while on the wire
        assert!(writer.check_capacity().is_err());
        writer.on_written(bytes.len(), Instant::now(), &mut out);
        assert!(writer.check_capacity().is_ok());
    }

    #[test]
    fn test_byte_high_water_mark() {
        let mut writer = Writer::new(limits());
        let mut big = outgoing(1, false);
        big.msg.data = Bytes::from(vec![0u8; 1024]);
        writer.enqueue(big);
        assert!(matches!(
            writer.check_capacity(),
            Err(ChirpError::Backpressure(_))
        ));
    }

    #[test]
    fn test_retries_then_timeout() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        let mut now = Instant::now();
        writer.enqueue(outgoing(7, true));

        let mut transmissions = flush(&mut writer, now, &mut out).len();
        for _ in 0..10 {
            now += Duration::from_secs(2);
            writer.sweep(now, &mut out);
            transmissions += flush(&mut writer, now, &mut out).len();
        }

        // One original send plus `retries` retransmissions
        assert_eq!(transmissions, 3);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].result, Err(ChirpError::Timeout(_))));
        assert!(writer.is_idle());
    }

    #[test]
    fn test_ack_during_retry_stops_retransmission() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        let now = Instant::now();
        let sent = outgoing(9, true);
        writer.enqueue(sent.clone());
        flush(&mut writer, now, &mut out);

        assert!(writer.sweep(now + Duration::from_secs(2), &mut out));
        writer.on_ack(&sent.msg.ack(), &mut out).unwrap();
        assert_eq!(out, vec![Completion::ok(SendToken(9), Delivery::Acked)]);
        assert!(flush(&mut writer, now, &mut out).is_empty());
        assert!(writer.is_idle());
    }

    #[test]
    fn test_partial_write_resumes_from_offset() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        let pool = BufferPool::new();
        writer.enqueue(outgoing(1, false));
        writer.enqueue(outgoing(2, false));

        let first = writer
            .next_write(true, &mut Shim::Plain, &pool)
            .unwrap()
            .unwrap();
        // Nothing else goes out while a write is outstanding
        assert!(writer.next_write(true, &mut Shim::Plain, &pool).unwrap().is_none());

        let tail = writer.on_written(10, Instant::now(), &mut out).unwrap();
        assert_eq!(tail, first.slice(10..));
        assert!(writer.on_written(tail.len(), Instant::now(), &mut out).is_none());
        assert_eq!(out, vec![Completion::ok(SendToken(1), Delivery::Sent)]);
    }

    #[test]
    fn test_priority_and_handshake_gate() {
        let mut writer = Writer::new(limits());
        let pool = BufferPool::new();
        let mut out = Vec::new();
        writer.enqueue(outgoing(1, false));
        writer.enqueue_ack(&outgoing(40, true).msg);
        writer.enqueue_control(Bytes::from_static(b"hello"));

        let mut shim = Shim::Plain;
        let control = writer.next_write(false, &mut shim, &pool).unwrap().unwrap();
        assert_eq!(&control[..], b"hello");
        writer.on_written(control.len(), Instant::now(), &mut out);
        assert!(writer.next_write(false, &mut shim, &pool).unwrap().is_none());

        let ack = writer.next_write(true, &mut shim, &pool).unwrap().unwrap();
        let (decoded, _) = decode(&ack).unwrap();
        assert!(decoded.is_ack());
        assert_eq!(decoded.serial, 40);
    }

    #[test]
    fn test_backlog_moves_to_other_writer() {
        let mut loser = Writer::new(limits());
        let mut winner = Writer::new(limits());
        let mut out = Vec::new();
        let pool = BufferPool::new();
        loser.enqueue(outgoing(1, true));
        loser.enqueue(outgoing(2, false));
        loser.enqueue(outgoing(3, true));
        let first = loser
            .next_write(true, &mut Shim::Plain, &pool)
            .unwrap()
            .unwrap();
        assert!(loser.on_written(first.len(), Instant::now(), &mut out).is_none());
        let bytes = loser
            .next_write(true, &mut Shim::Plain, &pool)
            .unwrap()
            .unwrap();
        let tail = loser
            .on_written(bytes.len() / 2, Instant::now(), &mut out)
            .unwrap();

        winner.absorb(loser.take_backlog());
        assert_eq!(winner.queued(), 1);
        assert_eq!(winner.pending(), 1);

        // Serial 2 is half written; it finishes on the socket it started on
        assert!(loser.is_writing());
        assert_eq!(loser.queued(), 0);
        assert!(loser.on_written(tail.len(), Instant::now(), &mut out).is_none());
        assert_eq!(out, vec![Completion::ok(SendToken(2), Delivery::Sent)]);
        assert!(loser.is_idle());

        let frames = flush(&mut winner, Instant::now(), &mut out);
        let serials: Vec<u32> = frames.iter().map(|f| decode(f).unwrap().0.serial).collect();
        assert_eq!(serials, vec![3]);
    }

    #[test]
    fn test_fail_all() {
        let mut writer = Writer::new(limits());
        let mut out = Vec::new();
        writer.enqueue(outgoing(1, true));
        flush(&mut writer, Instant::now(), &mut out);
        writer.enqueue(outgoing(2, true));

        writer.fail_all(&ChirpError::Shutdown("closing".into()), &mut out);
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|c| matches!(c.result, Err(ChirpError::Shutdown(_)))));
        assert!(writer.is_idle());
    }
}
