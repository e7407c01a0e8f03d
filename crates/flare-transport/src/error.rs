//! # Fragment Errors
//!
//! Every fragment arrives over an untrusted, lossy channel. Nothing in this
//! crate panics on malformed input; rejections are reported as
//! [`FragmentError`] and the fragment is dropped.

use thiserror::Error;

/// Reasons a received fragment is rejected before it reaches a group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("record header truncated or of an unknown version")]
    Undecodable,

    #[error("frame {frame_index} declares zero data fragments")]
    NoDataFragments { frame_index: u64 },

    #[error("frame {frame_index} declares an empty frame")]
    EmptyFrame { frame_index: u64 },

    #[error("frame {frame_index} is {len} bytes, limit is {max}")]
    FrameTooLarge { frame_index: u64, len: u32, max: u32 },

    #[error("frame {frame_index} declares {count} {kind} fragments, limit is {max}")]
    TooManyFragments {
        frame_index: u64,
        kind: &'static str,
        count: u32,
        max: u32,
    },

    #[error("frame {frame_index}: {data_count} data fragments cannot carry {len} bytes")]
    InconsistentLayout {
        frame_index: u64,
        data_count: u32,
        len: u32,
    },

    #[error("frame {frame_index}: fragment index {index} out of range ({count})")]
    IndexOutOfRange {
        frame_index: u64,
        index: u32,
        count: u32,
    },

    #[error("frame {frame_index}: fragment {index} carries {got} bytes, expected {expected}")]
    PayloadLength {
        frame_index: u64,
        index: u32,
        expected: usize,
        got: usize,
    },

    #[error("frame {frame_index}: fragment layout disagrees with the group already in flight")]
    LayoutMismatch { frame_index: u64 },
}

impl FragmentError {
    /// Frame index the rejected fragment claimed to belong to.
    pub fn frame_index(&self) -> Option<u64> {
        let frame_index = match *self {
            FragmentError::Undecodable => return None,
            FragmentError::NoDataFragments { frame_index }
            | FragmentError::EmptyFrame { frame_index }
            | FragmentError::FrameTooLarge { frame_index, .. }
            | FragmentError::TooManyFragments { frame_index, .. }
            | FragmentError::InconsistentLayout { frame_index, .. }
            | FragmentError::IndexOutOfRange { frame_index, .. }
            | FragmentError::PayloadLength { frame_index, .. }
            | FragmentError::LayoutMismatch { frame_index } => frame_index,
        };
        Some(frame_index)
    }
}
