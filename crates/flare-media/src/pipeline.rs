//! # Frame Pipeline
//!
//! Receive-thread glue: fragment record in, decoder units out.
//!
//! ```text
//! record ─▶ FragmentStore ─▶ FecReconstructor ─▶ UnitSplitter ─▶ UnitSink
//!             (window)        (oldest group)      (per frame)     (bounded)
//! ```
//!
//! Everything runs synchronously on the caller's thread. After every record
//! the oldest in-flight group is offered to the reconstructor, and each
//! finished frame is split before the call returns. Frames therefore leave
//! in frame-index order.

use bytes::Buf;
use flare_transport::codec::{Completion, FecFailureSignal, FecReconstructor, ReconstructedFrame};
use flare_transport::store::{AddOutcome, FragmentStore};
use flare_transport::wire::FragmentRecord;
use flare_transport::{FragmentError, FragmentGroup};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::media::nal::{Codec, SplitError, SplitReport, UnitSplitter};
use crate::metrics::PipelineStats;
use crate::output::UnitSink;

/// What became of one finished frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Split; the report lists every unit.
    Split {
        report: SplitReport,
        lossy: bool,
    },
    /// Rejected by the splitter; nothing was emitted.
    Invalid {
        frame_index: u64,
        error: SplitError,
    },
    /// Finished with gaps and not delivered.
    DiscardedLossy { frame_index: u64 },
}

impl FrameOutcome {
    pub fn frame_index(&self) -> u64 {
        match self {
            FrameOutcome::Split { report, .. } => report.frame_index,
            FrameOutcome::Invalid { frame_index, .. }
            | FrameOutcome::DiscardedLossy { frame_index } => *frame_index,
        }
    }
}

/// Result of feeding one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub outcome: AddOutcome,
    /// Frames finished by this record, oldest first.
    pub frames: Vec<FrameOutcome>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    frames_delivered: u64,
    frames_invalid: u64,
    frames_discarded_lossy: u64,
    frames_bypassed: u64,
    assembly_latency_total: Duration,
    assembly_latency_max: Duration,
}

/// Fragment-to-unit pipeline for one video stream.
pub struct FramePipeline<S: UnitSink> {
    config: PipelineConfig,
    store: FragmentStore,
    fec: FecReconstructor,
    splitter: UnitSplitter,
    sink: S,
    counters: Counters,
}

impl<S: UnitSink> FramePipeline<S> {
    pub fn new(config: PipelineConfig, sink: S) -> Self {
        let store = FragmentStore::new(config.store_config());
        let fec = FecReconstructor::new();
        let splitter = UnitSplitter::new(config.codec, fec.failure_signal());
        tracing::debug!(
            codec = %config.codec,
            fec = config.fec.enabled,
            window = config.fec.window,
            "frame pipeline created"
        );
        FramePipeline {
            config,
            store,
            fec,
            splitter,
            sink,
            counters: Counters::default(),
        }
    }

    /// Decode one wire record and [`ingest`](Self::ingest) it.
    pub fn ingest_datagram<B: Buf>(
        &mut self,
        datagram: &mut B,
    ) -> Result<IngestReport, FragmentError> {
        match FragmentRecord::decode(datagram) {
            Some(record) => self.ingest(record),
            None => {
                tracing::debug!(len = datagram.remaining(), "undecodable record dropped");
                Err(FragmentError::Undecodable)
            }
        }
    }

    /// Feed one received fragment record and deliver every frame it
    /// finishes.
    pub fn ingest(&mut self, record: FragmentRecord) -> Result<IngestReport, FragmentError> {
        if !self.config.fec.enabled {
            return self.ingest_whole_frame(record);
        }

        let admission = self.store.ingest(record).inspect_err(|e| {
            tracing::debug!(frame = ?e.frame_index(), error = %e, "fragment rejected");
        })?;

        let mut frames = Vec::new();
        if let Some(evicted) = admission.evicted {
            self.finish_evicted(evicted, &mut frames);
        }
        self.drain(&mut frames);

        Ok(IngestReport {
            outcome: admission.outcome,
            frames,
        })
    }

    /// Declare that no more fragments will arrive for frames older than
    /// `frame_index`. Those frames finish now, lossy if incomplete.
    pub fn advance_to(&mut self, frame_index: u64) -> Vec<FrameOutcome> {
        let sealed = self.store.seal_before(frame_index);
        if sealed > 0 {
            tracing::debug!(before = frame_index, sealed, "frames sealed");
        }
        let mut frames = Vec::new();
        self.drain(&mut frames);
        frames
    }

    /// Switch bitstream rules. Takes effect from the next split frame.
    pub fn set_codec(&mut self, codec: Codec) {
        self.config.codec = codec;
        self.splitter.set_codec(codec);
    }

    /// [`set_codec`](Self::set_codec) from a negotiated numeric id.
    pub fn set_codec_id(&mut self, id: u32) -> Result<(), SplitError> {
        let codec = Codec::from_id(id)?;
        self.set_codec(codec);
        Ok(())
    }

    pub fn codec(&self) -> Codec {
        self.splitter.codec()
    }

    /// A frame was lost since the last clear. Request a refresh upstream.
    pub fn fec_failure(&self) -> bool {
        self.fec.fec_failure()
    }

    pub fn clear_fec_failure(&self) {
        self.fec.clear_fec_failure();
    }

    /// Shared handle on the failure flag, for a thread that requests
    /// refreshes.
    pub fn failure_signal(&self) -> FecFailureSignal {
        self.fec.failure_signal()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        let finished = c.frames_delivered + c.frames_invalid + c.frames_discarded_lossy;
        let mean_assembly_us = if finished == 0 || c.frames_bypassed == finished {
            0
        } else {
            (c.assembly_latency_total.as_micros() / u128::from(finished - c.frames_bypassed)) as u64
        };
        PipelineStats {
            codec: self.splitter.codec(),
            fec_enabled: self.config.fec.enabled,
            fec_failure: self.fec.fec_failure(),
            in_flight: self.store.in_flight(),
            frames_delivered: c.frames_delivered,
            frames_invalid: c.frames_invalid,
            frames_discarded_lossy: c.frames_discarded_lossy,
            frames_bypassed: c.frames_bypassed,
            mean_assembly_us,
            max_assembly_us: c.assembly_latency_max.as_micros() as u64,
            store: self.store.stats().clone(),
            fec: self.fec.stats().clone(),
            splitter: self.splitter.stats(),
        }
    }

    fn ingest_whole_frame(
        &mut self,
        record: FragmentRecord,
    ) -> Result<IngestReport, FragmentError> {
        let frame_index = record.frame_index;
        let len = record.payload.len();
        if len as u64 > u64::from(self.config.fec.max_frame_bytes) {
            return Err(FragmentError::FrameTooLarge {
                frame_index,
                len: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.config.fec.max_frame_bytes,
            });
        }

        self.counters.frames_bypassed += 1;
        let frame = ReconstructedFrame {
            frame_index,
            buffer: record.payload,
            lossy: false,
            recovered_fragments: 0,
            missing_fragments: 0,
            assembly_latency: Duration::ZERO,
        };
        Ok(IngestReport {
            outcome: AddOutcome::Inserted,
            frames: vec![self.deliver(frame)],
        })
    }

    fn finish_evicted(&mut self, mut evicted: FragmentGroup, frames: &mut Vec<FrameOutcome>) {
        if let Completion::Ready(frame) = self.fec.try_complete(&mut evicted) {
            frames.push(self.deliver(frame));
        }
    }

    /// Finish groups from the oldest until one is still pending.
    fn drain(&mut self, frames: &mut Vec<FrameOutcome>) {
        while let Some(group) = self.store.oldest_mut() {
            match self.fec.try_complete(group) {
                Completion::Pending => break,
                Completion::Ready(frame) => {
                    self.store.retire_oldest();
                    frames.push(self.deliver(frame));
                }
            }
        }
    }

    fn deliver(&mut self, frame: ReconstructedFrame) -> FrameOutcome {
        let c = &mut self.counters;
        c.assembly_latency_total += frame.assembly_latency;
        c.assembly_latency_max = c.assembly_latency_max.max(frame.assembly_latency);

        if frame.lossy && !self.config.deliver_lossy_frames {
            c.frames_discarded_lossy += 1;
            tracing::debug!(
                frame = frame.frame_index,
                missing = frame.missing_fragments,
                "lossy frame discarded"
            );
            return FrameOutcome::DiscardedLossy {
                frame_index: frame.frame_index,
            };
        }

        match self.splitter.process(&frame, &mut self.sink) {
            Ok(report) => {
                self.counters.frames_delivered += 1;
                FrameOutcome::Split {
                    report,
                    lossy: frame.lossy,
                }
            }
            Err(error) => {
                self.counters.frames_invalid += 1;
                tracing::debug!(frame = frame.frame_index, %error, "frame not split");
                FrameOutcome::Invalid {
                    frame_index: frame.frame_index,
                    error,
                }
            }
        }
    }
}
