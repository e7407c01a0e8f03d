//! # flare-transport
//!
//! Frame reconstruction from lossy, unordered network fragments.
//!
//! Fragments of a video frame arrive out of order and some never arrive.
//! Parity fragments let the receiver rebuild missing data without a
//! retransmission round trip; what cannot be rebuilt is declared lost.
//!
//! ## Crate structure
//!
//! - [`wire`] — Fragment record header serialization and validation
//! - [`store`] — In-flight fragment groups, bounded by a frame window
//! - [`codec`] — XOR parity layout, encoder, and the reconstructor
//! - [`stats`] — Store and FEC counters
//! - [`error`] — Fragment rejection reasons

pub mod codec;
pub mod error;
pub mod stats;
pub mod store;
pub mod wire;

pub use codec::{
    Completion, FecEncoder, FecFailureSignal, FecReconstructor, FragmentLayout,
    ReconstructedFrame,
};
pub use error::FragmentError;
pub use store::{AddOutcome, Admission, FragmentGroup, FragmentStore, GroupState, StoreConfig};
pub use wire::{Fragment, FragmentRecord};
