//! # Media Awareness: Bitstream Unit Splitting
//!
//! Parses reconstructed H.264/H.265 Annex B frames into decoder units.

pub mod nal;
