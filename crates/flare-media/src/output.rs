//! # Unit Output Channel
//!
//! Bounded hand-off from the splitter (receive thread) to the decoder
//! thread.
//!
//! The splitter only sees the [`UnitSink`] trait: obtain a slot sized for a
//! unit, fill it, submit it. [`unit_channel`] provides the in-process
//! implementation: a lock-free SPSC ready ring (`rtrb`) carrying filled
//! slots to the consumer, plus a free ring carrying drained slots back so
//! their buffers are reused instead of reallocated per unit.
//!
//! A full ready ring is reported immediately as [`SinkFull`]. The unit is
//! dropped by the caller; nothing here waits for the consumer.

use thiserror::Error;

use crate::media::nal::UnitKind;

/// The output channel has no room for another unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("output channel full")]
pub struct SinkFull;

/// A unit on its way to the decoder.
#[derive(Debug, Clone)]
pub struct UnitSlot {
    /// Number of valid bytes in the buffer.
    pub length: usize,
    pub frame_index: u64,
    pub kind: UnitKind,
    buf: Vec<u8>,
}

impl UnitSlot {
    pub fn with_capacity(capacity: usize) -> Self {
        UnitSlot {
            length: 0,
            frame_index: 0,
            kind: UnitKind::Delta,
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Overwrite the slot with a copy of `bytes`.
    pub fn fill(&mut self, frame_index: u64, kind: UnitKind, bytes: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.length = bytes.len();
        self.frame_index = frame_index;
        self.kind = kind;
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.length]
    }

    /// Allocated size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

/// Bounded destination for split units.
///
/// Neither method may block. A sink that cannot take a unit right now
/// returns [`SinkFull`] and the unit is dropped.
pub trait UnitSink {
    /// Reserve a slot able to hold `byte_length` bytes.
    fn obtain_slot(&mut self, byte_length: usize) -> Result<UnitSlot, SinkFull>;

    /// Hand a filled slot to the consumer.
    fn submit(&mut self, slot: UnitSlot) -> Result<(), SinkFull>;
}

/// Create a unit channel holding up to `capacity` undelivered units.
pub fn unit_channel(capacity: usize) -> (UnitProducer, UnitConsumer) {
    let capacity = capacity.max(1);
    let (ready_tx, ready_rx) = rtrb::RingBuffer::new(capacity);
    let (free_tx, free_rx) = rtrb::RingBuffer::new(capacity);
    (
        UnitProducer {
            ready: ready_tx,
            free: free_rx,
            submitted: 0,
            rejected: 0,
        },
        UnitConsumer {
            ready: ready_rx,
            free: free_tx,
        },
    )
}

/// Splitter side of a [`unit_channel`].
pub struct UnitProducer {
    ready: rtrb::Producer<UnitSlot>,
    free: rtrb::Consumer<UnitSlot>,
    submitted: u64,
    rejected: u64,
}

impl UnitProducer {
    /// Units accepted into the channel so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Slot requests refused because the channel was full.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Undelivered units currently queued.
    pub fn queued(&self) -> usize {
        self.ready.buffer().capacity() - self.ready.slots()
    }

    /// The consumer has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.ready.is_abandoned()
    }
}

impl UnitSink for UnitProducer {
    fn obtain_slot(&mut self, byte_length: usize) -> Result<UnitSlot, SinkFull> {
        if self.ready.is_full() {
            self.rejected += 1;
            return Err(SinkFull);
        }
        let mut slot = self
            .free
            .pop()
            .unwrap_or_else(|_| UnitSlot::with_capacity(byte_length));
        slot.buf.clear();
        slot.buf.reserve(byte_length);
        Ok(slot)
    }

    fn submit(&mut self, slot: UnitSlot) -> Result<(), SinkFull> {
        match self.ready.push(slot) {
            Ok(()) => {
                self.submitted += 1;
                Ok(())
            }
            Err(_) => {
                self.rejected += 1;
                Err(SinkFull)
            }
        }
    }
}

/// Decoder side of a [`unit_channel`].
pub struct UnitConsumer {
    ready: rtrb::Consumer<UnitSlot>,
    free: rtrb::Producer<UnitSlot>,
}

impl UnitConsumer {
    /// Next unit in submission order, if any.
    pub fn pop(&mut self) -> Option<UnitSlot> {
        self.ready.pop().ok()
    }

    /// Return a drained slot so its buffer can be reused. Slots beyond the
    /// free ring's capacity are simply dropped.
    pub fn recycle(&mut self, slot: UnitSlot) {
        let _ = self.free.push(slot);
    }

    pub fn len(&self) -> usize {
        self.ready.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// The producer has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.ready.is_abandoned()
    }
}

/// Collects units into a vector; never full. Handy for tests and tools
/// that split frames offline.
impl UnitSink for Vec<UnitSlot> {
    fn obtain_slot(&mut self, byte_length: usize) -> Result<UnitSlot, SinkFull> {
        Ok(UnitSlot::with_capacity(byte_length))
    }

    fn submit(&mut self, slot: UnitSlot) -> Result<(), SinkFull> {
        self.push(slot);
        Ok(())
    }
}
