//! # Bitstream Unit Splitter
//!
//! Splits a reconstructed H.264 (AVC) or H.265 (HEVC) Annex B frame into
//! start-code-delimited units and hands each deliverable unit to a
//! [`UnitSink`].
//!
//! A frame that opens with a parameter set (SPS for H.264, VPS for H.265)
//! has its whole parameter-set prefix emitted as one bundle, so a decoder
//! never sees a sequence header without its picture parameters. Filler and
//! delimiter units are dropped before they reach the decoder.

use std::ops::Range;

use flare_transport::ReconstructedFrame;
use flare_transport::codec::FecFailureSignal;
use serde::Serialize;
use thiserror::Error;

use crate::output::UnitSink;

/// Length of the shortest start code, `00 00 01`.
const MIN_START_CODE: usize = 3;

/// Offset of the unit header byte from the unit start (4-byte start code).
pub const HEADER_OFFSET: usize = 4;

const H264_SPS: u8 = 7;
const H264_IDR: u8 = 5;
const H264_FILLER: u8 = 12;

const H265_VPS: u8 = 32;
/// H.265 types at or above this (AUD, EOS, EOB, FD, SEI, reserved) are
/// never handed to the decoder.
const H265_FIRST_FILTERED: u8 = 35;

/// Codec whose framing rules apply to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Map the numeric codec id carried in stream negotiation.
    pub fn from_id(id: u32) -> Result<Self, SplitError> {
        match id {
            0 => Ok(Codec::H264),
            1 => Ok(Codec::H265),
            other => Err(SplitError::UnsupportedCodec(other)),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Codec::H264 => 0,
            Codec::H265 => 1,
        }
    }

    /// Extract the unit type from a header byte.
    ///
    /// H.264: `forbidden(1) | nal_ref_idc(2) | nal_type(5)`
    /// H.265: `forbidden(1) | nal_type(6) | layer_id(6) | tid(3)`
    pub fn unit_type(self, header: u8) -> u8 {
        match self {
            Codec::H264 => header & 0x1F,
            Codec::H265 => (header >> 1) & 0x3F,
        }
    }

    /// True for the unit type that opens a parameter-set prefix.
    pub fn opens_parameter_sets(self, unit_type: u8) -> bool {
        match self {
            Codec::H264 => unit_type == H264_SPS,
            Codec::H265 => unit_type == H265_VPS,
        }
    }

    /// Number of units in a parameter-set prefix: SPS+PPS, or VPS+SPS+PPS.
    pub fn parameter_set_count(self) -> usize {
        match self {
            Codec::H264 => 2,
            Codec::H265 => 3,
        }
    }

    /// Units of this type never reach the decoder.
    pub fn is_filtered(self, unit_type: u8) -> bool {
        match self {
            Codec::H264 => unit_type == H264_FILLER,
            Codec::H265 => unit_type >= H265_FIRST_FILTERED,
        }
    }

    /// IDR for H.264; BLA, IDR and CRA for H.265.
    pub fn is_key(self, unit_type: u8) -> bool {
        match self {
            Codec::H264 => unit_type == H264_IDR,
            Codec::H265 => (16..=21).contains(&unit_type),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::H264 => f.write_str("h264"),
            Codec::H265 => f.write_str("h265"),
        }
    }
}

/// Classification of a split unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnitKind {
    /// Leading parameter sets, emitted together.
    ParamSetBundle,
    /// Self-contained picture data.
    Key,
    /// Everything else that is delivered.
    Delta,
    /// Filler, delimiters and unclassifiable runts. Never emitted.
    Filtered,
}

/// One unit of a frame: a byte range of the frame buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub frame_index: u64,
    pub kind: UnitKind,
    /// Codec unit type of the unit's first header; 0 when unreadable.
    pub unit_type: u8,
    pub range: Range<usize>,
}

impl Unit {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Outcome of splitting one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub frame_index: u64,
    /// Every unit in buffer order, filtered ones included.
    pub units: Vec<Unit>,
    /// Units handed to the sink.
    pub emitted: u32,
    pub filtered: u32,
    /// Units lost because the sink was full.
    pub dropped: u32,
    /// The frame opened with a parameter-set prefix.
    pub parameter_sets: bool,
}

impl SplitReport {
    fn new(frame_index: u64) -> Self {
        SplitReport {
            frame_index,
            ..SplitReport::default()
        }
    }

    /// Units that were handed to the sink, in order.
    pub fn delivered(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter().filter(|u| u.kind != UnitKind::Filtered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("frame {frame_index} does not start with a start code")]
    MissingStartCode { frame_index: u64 },

    #[error("frame {frame_index}: parameter-set prefix has fewer than {expected} units")]
    MalformedParameterPrefix { frame_index: u64, expected: usize },

    #[error("unsupported codec id {0}")]
    UnsupportedCodec(u32),
}

/// Running splitter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitterStats {
    pub frames_split: u64,
    pub frames_invalid: u64,
    pub parameter_set_frames: u64,
    pub units_emitted: u64,
    pub units_filtered: u64,
    pub units_dropped: u64,
    pub bytes_emitted: u64,
}

// ─── Boundary Search ────────────────────────────────────────────────────────

/// Find where the `count` units starting at `from` end.
///
/// `from` points at the start code of a unit. The first three bytes are
/// skipped, then every `00 00 01` run marks the start of a following unit.
/// Returns the offset of the start code that begins the unit after the
/// `count`th one. Running off the end of `buf` terminates the last unit
/// only when a single unit was sought; otherwise the prefix is incomplete
/// and `None` is returned.
///
/// Start codes are taken to be four bytes: the returned offset is three
/// bytes before the `01`.
pub fn find_unit_end(buf: &[u8], from: usize, count: usize) -> Option<usize> {
    let end = buf.len();
    if from > end {
        return None;
    }
    if count == 0 {
        return Some(from);
    }
    if end - from < MIN_START_CODE {
        return (count == 1).then_some(end);
    }

    let mut remaining = count;
    let mut zeros = 0usize;
    for (pos, &byte) in buf.iter().enumerate().skip(from + MIN_START_CODE) {
        if byte == 0 {
            zeros += 1;
            continue;
        }
        if byte == 1 && zeros >= 2 {
            remaining -= 1;
            if remaining == 0 {
                return Some(pos - 3);
            }
        }
        zeros = 0;
    }

    (count == 1).then_some(end)
}

/// Unit type of the unit starting at `start`, or `None` if the header byte
/// lies outside the buffer.
pub fn unit_type_at(buf: &[u8], start: usize, codec: Codec) -> Option<u8> {
    let header = *buf.get(start.checked_add(HEADER_OFFSET)?)?;
    Some(codec.unit_type(header))
}

fn starts_with_start_code(buf: &[u8]) -> bool {
    buf.len() > HEADER_OFFSET && (buf.starts_with(&[0, 0, 1]) || buf.starts_with(&[0, 0, 0, 1]))
}

// ─── Splitter ───────────────────────────────────────────────────────────────

/// Splits reconstructed frames into units for the decoder.
///
/// The codec is a field rather than a per-call argument; change it with
/// [`UnitSplitter::set_codec`] between frames.
pub struct UnitSplitter {
    codec: Codec,
    signal: FecFailureSignal,
    stats: SplitterStats,
}

impl UnitSplitter {
    /// `signal` is the reconstructor's failure flag; a frame carrying
    /// parameter sets clears it.
    pub fn new(codec: Codec, signal: FecFailureSignal) -> Self {
        UnitSplitter {
            codec,
            signal,
            stats: SplitterStats::default(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn set_codec(&mut self, codec: Codec) {
        if codec != self.codec {
            tracing::info!(from = %self.codec, to = %codec, "splitter codec changed");
            self.codec = codec;
        }
    }

    pub fn stats(&self) -> SplitterStats {
        self.stats
    }

    /// Split `frame` and push its deliverable units into `sink`.
    ///
    /// A full sink drops the unit in hand and splitting carries on with the
    /// next one. On error nothing has been pushed.
    pub fn process<S>(
        &mut self,
        frame: &ReconstructedFrame,
        sink: &mut S,
    ) -> Result<SplitReport, SplitError>
    where
        S: UnitSink + ?Sized,
    {
        let buf = &frame.buffer[..];
        let frame_index = frame.frame_index;
        let codec = self.codec;

        if !starts_with_start_code(buf) {
            self.stats.frames_invalid += 1;
            tracing::debug!(frame = frame_index, len = buf.len(), "frame without start code");
            return Err(SplitError::MissingStartCode { frame_index });
        }

        let mut report = SplitReport::new(frame_index);
        let mut cursor = 0;

        let first_type = unit_type_at(buf, 0, codec).unwrap_or_default();
        if codec.opens_parameter_sets(first_type) {
            let expected = codec.parameter_set_count();
            let Some(boundary) = find_unit_end(buf, 0, expected) else {
                self.stats.frames_invalid += 1;
                tracing::warn!(
                    frame = frame_index,
                    %codec,
                    expected,
                    "incomplete parameter-set prefix, frame rejected"
                );
                return Err(SplitError::MalformedParameterPrefix {
                    frame_index,
                    expected,
                });
            };

            tracing::info!(
                frame = frame_index,
                %codec,
                bytes = boundary,
                "parameter sets received"
            );
            self.emit(
                frame,
                UnitKind::ParamSetBundle,
                first_type,
                0..boundary,
                sink,
                &mut report,
            );
            self.signal.clear();
            self.stats.parameter_set_frames += 1;
            report.parameter_sets = true;
            cursor = boundary;
        }

        while cursor < buf.len() {
            let end = find_unit_end(buf, cursor, 1).unwrap_or(buf.len());
            match unit_type_at(buf, cursor, codec) {
                Some(t) if !codec.is_filtered(t) => {
                    let kind = if codec.is_key(t) {
                        UnitKind::Key
                    } else {
                        UnitKind::Delta
                    };
                    self.emit(frame, kind, t, cursor..end, sink, &mut report);
                }
                t => {
                    report.filtered += 1;
                    self.stats.units_filtered += 1;
                    report.units.push(Unit {
                        frame_index,
                        kind: UnitKind::Filtered,
                        unit_type: t.unwrap_or_default(),
                        range: cursor..end,
                    });
                }
            }
            cursor = end;
        }

        self.stats.frames_split += 1;
        Ok(report)
    }

    fn emit<S>(
        &mut self,
        frame: &ReconstructedFrame,
        kind: UnitKind,
        unit_type: u8,
        range: Range<usize>,
        sink: &mut S,
        report: &mut SplitReport,
    ) where
        S: UnitSink + ?Sized,
    {
        let bytes = &frame.buffer[range.clone()];
        let pushed = sink.obtain_slot(bytes.len()).and_then(|mut slot| {
            slot.fill(frame.frame_index, kind, bytes);
            sink.submit(slot)
        });

        match pushed {
            Ok(()) => {
                report.emitted += 1;
                self.stats.units_emitted += 1;
                self.stats.bytes_emitted += bytes.len() as u64;
            }
            Err(_) => {
                report.dropped += 1;
                self.stats.units_dropped += 1;
                tracing::warn!(
                    frame = frame.frame_index,
                    ?kind,
                    len = bytes.len(),
                    "output channel full, unit dropped"
                );
            }
        }

        report.units.push(Unit {
            frame_index: frame.frame_index,
            kind,
            unit_type,
            range,
        });
    }
}
