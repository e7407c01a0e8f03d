//! # flare-media
//!
//! Receive-side video pipeline: fragment records in, decoder units out.
//!
//! Fragments are reassembled and repaired by `flare-transport`; this crate
//! splits each finished frame into H.264/H.265 units, drops the ones a
//! decoder must not see, and hands the rest to a bounded channel drained by
//! the decoding thread.
//!
//! ## Crate structure
//!
//! - [`media::nal`] — Start-code boundary search, unit classification and the splitter
//! - [`output`] — Bounded unit channel between splitter and decoder
//! - [`pipeline`] — Store, reconstructor and splitter driven per record
//! - [`config`] — TOML pipeline configuration
//! - [`metrics`] — Stats snapshot, JSON and Prometheus rendering

pub mod config;
pub mod media;
pub mod metrics;
pub mod output;
pub mod pipeline;

pub use config::PipelineConfig;
pub use media::nal::{Codec, SplitError, SplitReport, Unit, UnitKind, UnitSplitter};
pub use output::{SinkFull, UnitConsumer, UnitProducer, UnitSink, UnitSlot, unit_channel};
pub use pipeline::{FrameOutcome, FramePipeline, IngestReport};
