//! # Fragment Wire Format
//!
//! The socket layer delivers one record per received datagram. The record
//! is a fixed big-endian header followed by the fragment payload:
//!
//! ```text
//!  0       1       2                               10              14
//! +-------+-------+-------------------------------+---------------+
//! |  ver  | flags |      frame index (64)         | frame len (32)|
//! +-------+-------+-------------------------------+---------------+
//! 14              18              22              26              30
//! +---------------+---------------+---------------+---------------+
//! | data cnt (32) | parity cnt(32)| frag idx (32) | payload len   |
//! +---------------+---------------+---------------+---------------+
//! |                    payload (payload len bytes)                |
//! +---------------------------------------------------------------+
//! ```
//!
//! `flags` bit 0 marks a parity fragment. Decoding returns `None` on any
//! truncated or inconsistent input and never panics.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::FragmentLayout;
use crate::error::FragmentError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Record format version.
pub const RECORD_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 30;

/// Upper bound on data fragments per frame.
pub const MAX_DATA_FRAGMENTS: u32 = 1024;

/// Upper bound on parity fragments per frame.
pub const MAX_PARITY_FRAGMENTS: u32 = 1024;

/// Default upper bound on a declared frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const FLAG_PARITY: u8 = 0x01;

// ─── Fragment Record ─────────────────────────────────────────────────────────

/// One deframed record as handed over by the reception layer.
///
/// Nothing here is trusted yet; [`Fragment::from_record`] validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRecord {
    pub frame_index: u64,
    /// Total byte length of the reconstructed frame.
    pub frame_byte_length: u32,
    pub data_fragment_count: u32,
    pub parity_fragment_count: u32,
    pub fragment_index: u32,
    pub is_parity: bool,
    pub payload: Bytes,
}

impl FragmentRecord {
    /// Serialized size of this record.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(RECORD_VERSION);
        buf.put_u8(if self.is_parity { FLAG_PARITY } else { 0 });
        buf.put_u64(self.frame_index);
        buf.put_u32(self.frame_byte_length);
        buf.put_u32(self.data_fragment_count);
        buf.put_u32(self.parity_fragment_count);
        buf.put_u32(self.fragment_index);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one record, consuming exactly its bytes from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < RECORD_HEADER_SIZE {
            return None;
        }
        let version = buf.get_u8();
        if version != RECORD_VERSION {
            return None;
        }
        let flags = buf.get_u8();
        let frame_index = buf.get_u64();
        let frame_byte_length = buf.get_u32();
        let data_fragment_count = buf.get_u32();
        let parity_fragment_count = buf.get_u32();
        let fragment_index = buf.get_u32();
        let payload_length = buf.get_u32() as usize;
        if buf.remaining() < payload_length {
            return None;
        }
        let payload = buf.copy_to_bytes(payload_length);

        Some(FragmentRecord {
            frame_index,
            frame_byte_length,
            data_fragment_count,
            parity_fragment_count,
            fragment_index,
            is_parity: flags & FLAG_PARITY != 0,
            payload,
        })
    }
}

// ─── Fragment ────────────────────────────────────────────────────────────────

/// A validated fragment. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub frame_index: u64,
    pub fragment_index: u32,
    pub is_parity: bool,
    pub payload: Bytes,
    /// Layout of the frame this fragment belongs to.
    pub layout: FragmentLayout,
}

impl Fragment {
    /// Validate a record against the fragment layout it declares.
    pub fn from_record(
        record: FragmentRecord,
        max_frame_bytes: u32,
    ) -> Result<Self, FragmentError> {
        let frame_index = record.frame_index;
        let layout = FragmentLayout::new(
            frame_index,
            record.frame_byte_length,
            record.data_fragment_count,
            record.parity_fragment_count,
            max_frame_bytes,
        )?;

        let count = if record.is_parity {
            layout.parity_count
        } else {
            layout.data_count
        };
        if record.fragment_index >= count {
            return Err(FragmentError::IndexOutOfRange {
                frame_index,
                index: record.fragment_index,
                count,
            });
        }

        let expected = if record.is_parity {
            layout.shard_len()
        } else {
            layout.data_slot_len(record.fragment_index)
        };
        if record.payload.len() != expected {
            return Err(FragmentError::PayloadLength {
                frame_index,
                index: record.fragment_index,
                expected,
                got: record.payload.len(),
            });
        }

        Ok(Fragment {
            frame_index,
            fragment_index: record.fragment_index,
            is_parity: record.is_parity,
            payload: record.payload,
            layout,
        })
    }

    /// Payload size in bytes.
    pub fn payload_length(&self) -> u32 {
        self.payload.len() as u32
    }
}
