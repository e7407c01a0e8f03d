//! # Pipeline Metrics
//!
//! A point-in-time snapshot of every pipeline counter, rendered either as
//! JSON for periodic log lines or in Prometheus text exposition format.

use flare_transport::stats::{FecStats, StoreStats};
use serde::Serialize;
use std::fmt::Write;

use crate::media::nal::{Codec, SplitterStats};

/// Snapshot returned by [`FramePipeline::stats`](crate::pipeline::FramePipeline::stats).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub codec: Codec,
    pub fec_enabled: bool,
    /// Failure flag at snapshot time.
    pub fec_failure: bool,
    /// Frames currently being reassembled.
    pub in_flight: usize,
    /// Frames handed to the splitter and split.
    pub frames_delivered: u64,
    /// Frames the splitter rejected.
    pub frames_invalid: u64,
    /// Lossy frames withheld from the splitter.
    pub frames_discarded_lossy: u64,
    /// Frames taken whole in FEC-bypass mode.
    pub frames_bypassed: u64,
    /// Mean first-fragment-to-assembly time of reassembled frames.
    pub mean_assembly_us: u64,
    pub max_assembly_us: u64,
    pub store: StoreStats,
    pub fec: FecStats,
    pub splitter: SplitterStats,
}

impl PipelineStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render a stats snapshot as Prometheus text exposition format.
pub fn render_prometheus(stats: &PipelineStats) -> String {
    let mut out = String::with_capacity(2048);

    // ── Fragment store ─────────────────────────────────────────

    let s = &stats.store;
    metric(
        &mut out,
        "flare_fragments_received_total",
        "counter",
        "Fragment records offered to the store.",
        s.fragments_received,
    );
    metric(
        &mut out,
        "flare_fragments_malformed_total",
        "counter",
        "Fragment records rejected by validation.",
        s.malformed,
    );
    metric(
        &mut out,
        "flare_fragments_duplicate_total",
        "counter",
        "Fragments for an already-filled slot.",
        s.duplicates,
    );
    metric(
        &mut out,
        "flare_fragments_stale_total",
        "counter",
        "Fragments for frames already retired.",
        s.stale,
    );
    metric(
        &mut out,
        "flare_frames_evicted_total",
        "counter",
        "Frames pushed out of the reassembly window.",
        s.evicted,
    );
    metric(
        &mut out,
        "flare_frames_in_flight",
        "gauge",
        "Frames currently being reassembled.",
        stats.in_flight,
    );

    // ── FEC ────────────────────────────────────────────────────

    let f = &stats.fec;
    metric(
        &mut out,
        "flare_frames_complete_total",
        "counter",
        "Frames with every data fragment known.",
        f.frames_complete,
    );
    metric(
        &mut out,
        "flare_frames_recovered_total",
        "counter",
        "Complete frames that needed parity.",
        f.frames_recovered,
    );
    metric(
        &mut out,
        "flare_frames_lossy_total",
        "counter",
        "Frames assembled with zero-filled gaps.",
        f.frames_lossy,
    );
    metric(
        &mut out,
        "flare_fragments_recovered_total",
        "counter",
        "Data fragments rebuilt from parity.",
        f.fragments_recovered,
    );
    metric(
        &mut out,
        "flare_fec_failure",
        "gauge",
        "1 while an unrecoverable loss awaits a refresh.",
        u8::from(stats.fec_failure),
    );
    metric(
        &mut out,
        "flare_assembly_mean_us",
        "gauge",
        "Mean frame assembly time in microseconds.",
        stats.mean_assembly_us,
    );
    metric(
        &mut out,
        "flare_assembly_max_us",
        "gauge",
        "Longest frame assembly time in microseconds.",
        stats.max_assembly_us,
    );

    // ── Splitter ───────────────────────────────────────────────

    let u = &stats.splitter;
    metric(
        &mut out,
        "flare_frames_delivered_total",
        "counter",
        "Frames split into units.",
        stats.frames_delivered,
    );
    metric(
        &mut out,
        "flare_frames_invalid_total",
        "counter",
        "Frames rejected by the splitter.",
        stats.frames_invalid,
    );
    metric(
        &mut out,
        "flare_frames_discarded_lossy_total",
        "counter",
        "Lossy frames withheld from the decoder.",
        stats.frames_discarded_lossy,
    );
    metric(
        &mut out,
        "flare_parameter_set_frames_total",
        "counter",
        "Frames opening with parameter sets.",
        u.parameter_set_frames,
    );
    metric(
        &mut out,
        "flare_units_emitted_total",
        "counter",
        "Units handed to the decoder channel.",
        u.units_emitted,
    );
    metric(
        &mut out,
        "flare_units_filtered_total",
        "counter",
        "Filler and delimiter units dropped.",
        u.units_filtered,
    );
    metric(
        &mut out,
        "flare_units_dropped_total",
        "counter",
        "Units dropped on a full decoder channel.",
        u.units_dropped,
    );
    metric(
        &mut out,
        "flare_unit_bytes_emitted_total",
        "counter",
        "Bytes handed to the decoder channel.",
        u.bytes_emitted,
    );

    let _ = writeln!(out, "# HELP flare_codec Active codec.");
    let _ = writeln!(out, "# TYPE flare_codec gauge");
    let _ = writeln!(out, "flare_codec{{codec=\"{}\"}} 1", stats.codec);

    out
}
