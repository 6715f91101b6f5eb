//! Tagged mailboxes for the group transport
//!
//! Each (coordinator, rank) pair shares one mailbox in each direction. A
//! message is an [`Envelope`] holding one semantic field of a unit, tagged so
//! the receiver can check it is reading fields in the agreed order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ChannelConfig;
use crate::error::{Error, Result, Stage};
use crate::worker::WorkerId;

/// Semantic field carried by a message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Kernel weights, `size * size` floats
    KernelWeights = 0,
    /// Per-rank unit number; opens every work unit
    Sequence = 1,
    /// Kernel side length
    KernelSize = 2,
    /// Image width
    Width = 3,
    /// Multiplier
    Multiplier = 4,
    /// Encoded window bytes
    Payload = 5,
    /// `y_start, y_end, width, band_height`
    Geometry = 6,
    /// Length of the encoded result
    ResultLength = 7,
    /// Encoded result bytes
    ResultPayload = 8,
    /// Echoed `y_start, y_end, width, band_height`
    ResultGeometry = 9,
    /// Length of the encoded window
    PayloadLength = 10,
    /// `overlap_top, overlap_bottom`
    Overlap = 11,
    /// `codec id, codec param`
    Codec = 12,
    /// `status, sequence`; status 0 is success, anything else is followed
    /// by [`Tag::ResultError`]
    ResultStatus = 13,
    /// UTF-8 failure description
    ResultError = 14,
    /// Echoed `overlap_top, overlap_bottom`
    ResultOverlap = 15,
    /// Echoed `codec id, codec param`
    ResultCodec = 16,
}

/// Body of one message
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Integers
    Ints(Vec<u32>),
    /// Floats
    Floats(Vec<f32>),
    /// Raw bytes
    Bytes(Vec<u8>),
}

/// One tagged message between two ranks
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Field carried
    pub tag: Tag,

    /// Sending rank
    pub source: WorkerId,

    /// Field body
    pub payload: Field,
}

/// Traffic counters for one mailbox end
#[derive(Debug, Default)]
pub struct MailboxStats {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
}

impl MailboxStats {
    /// Messages sent
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Messages received
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Sends and receives that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl fmt::Display for MailboxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sent, {} received, {} failed",
            self.sent(),
            self.received(),
            self.failed()
        )
    }
}

/// One end of a bidirectional link between two ranks
pub struct Mailbox {
    local: WorkerId,
    peer: WorkerId,
    tx: flume::Sender<Envelope>,
    rx: flume::Receiver<Envelope>,
    stats: Arc<MailboxStats>,
    timeout: Option<Duration>,
}

impl Mailbox {
    /// Create the two ends of a link between ranks `a` and `b`
    pub fn pair(config: &ChannelConfig, a: WorkerId, b: WorkerId) -> (Mailbox, Mailbox) {
        let channel = || {
            if config.bounded {
                flume::bounded(config.capacity.max(1))
            } else {
                flume::unbounded()
            }
        };
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        let end = |local, peer, tx, rx| Mailbox {
            local,
            peer,
            tx,
            rx,
            stats: Arc::new(MailboxStats::default()),
            timeout: config.timeout,
        };
        (end(a, b, a_tx, a_rx), end(b, a, b_tx, b_rx))
    }

    /// Rank on the other end
    pub fn peer(&self) -> WorkerId {
        self.peer
    }

    /// Send one field to the peer
    pub fn send(&self, tag: Tag, payload: Field, stage: Stage) -> Result<()> {
        let envelope = Envelope {
            tag,
            source: self.local,
            payload,
        };
        let result = match self.timeout {
            Some(timeout) => self.tx.send_timeout(envelope, timeout).map_err(|e| match e {
                flume::SendTimeoutError::Timeout(_) => Error::Timeout {
                    worker: self.peer,
                    stage,
                },
                flume::SendTimeoutError::Disconnected(_) => self.disconnected(stage),
            }),
            None => self.tx.send(envelope).map_err(|_| self.disconnected(stage)),
        };
        self.count(&result, &self.stats.sent);
        result
    }

    /// Block until the next message arrives; `None` once the peer hung up
    pub fn recv_next(&self) -> Option<Envelope> {
        let envelope = self.rx.recv().ok();
        if envelope.is_some() {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
        }
        envelope
    }

    /// Receive the next message whatever its tag, honoring the timeout
    pub fn recv_envelope(&self, stage: Stage) -> Result<Envelope> {
        let result = match self.timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                flume::RecvTimeoutError::Timeout => Error::Timeout {
                    worker: self.peer,
                    stage,
                },
                flume::RecvTimeoutError::Disconnected => self.disconnected(stage),
            }),
            None => self.rx.recv().map_err(|_| self.disconnected(stage)),
        };
        self.count(&result, &self.stats.received);
        result
    }

    /// Receive the next field, which must carry `tag`
    pub fn recv(&self, tag: Tag, stage: Stage) -> Result<Field> {
        let envelope = self.recv_envelope(stage)?;
        expect_tag(envelope, tag).map_err(|e| {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    /// Receive a field of integers
    pub fn recv_ints(&self, tag: Tag, len: usize, stage: Stage) -> Result<Vec<u32>> {
        match self.recv(tag, stage)? {
            Field::Ints(values) if values.len() == len => Ok(values),
            other => Err(mismatch(tag, "ints", len, &other)),
        }
    }

    /// Receive a single integer
    pub fn recv_int(&self, tag: Tag, stage: Stage) -> Result<u32> {
        Ok(self.recv_ints(tag, 1, stage)?[0])
    }

    /// Receive a field of floats of any length
    pub fn recv_floats(&self, tag: Tag, stage: Stage) -> Result<Vec<f32>> {
        match self.recv(tag, stage)? {
            Field::Floats(values) => Ok(values),
            other => Err(mismatch(tag, "floats", 0, &other)),
        }
    }

    /// Receive a field of bytes of the announced length
    pub fn recv_bytes(&self, tag: Tag, len: usize, stage: Stage) -> Result<Vec<u8>> {
        match self.recv(tag, stage)? {
            Field::Bytes(bytes) if bytes.len() == len => Ok(bytes),
            other => Err(mismatch(tag, "bytes", len, &other)),
        }
    }

    /// Traffic counters
    pub fn stats(&self) -> Arc<MailboxStats> {
        Arc::clone(&self.stats)
    }

    fn disconnected(&self, stage: Stage) -> Error {
        Error::transport(self.peer, stage, format!("rank {} hung up", self.peer))
    }

    fn count<T>(&self, result: &Result<T>, ok: &AtomicU64) {
        let counter = if result.is_ok() { ok } else { &self.stats.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Check an already received envelope carries `tag`
pub fn expect_tag(envelope: Envelope, tag: Tag) -> Result<Field> {
    if envelope.tag != tag {
        return Err(Error::Protocol(format!(
            "expected {:?} from rank {}, got {:?}",
            tag, envelope.source, envelope.tag
        )));
    }
    Ok(envelope.payload)
}

fn mismatch(tag: Tag, kind: &str, len: usize, got: &Field) -> Error {
    let got = match got {
        Field::Ints(v) => format!("{} ints", v.len()),
        Field::Floats(v) => format!("{} floats", v.len()),
        Field::Bytes(v) => format!("{} bytes", v.len()),
    };
    Error::Protocol(format!("{:?} should carry {} {}, got {}", tag, len, kind, got))
}
