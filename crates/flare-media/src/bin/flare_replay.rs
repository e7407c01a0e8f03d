//! # Flare Replay
//!
//! Drives the receive pipeline with a synthetic H.264/H.265 stream over a
//! simulated lossy link. Frames are fragmented with parity, dropped and
//! reordered with a seeded RNG, fed through the pipeline on the main thread
//! and drained by a decoder thread. When the pipeline reports an
//! unrecoverable loss the synthetic encoder answers with a fresh key frame,
//! the way a real sender would on a refresh request.
//!
//! ## Usage
//!
//! ```bash
//! # 600 frames, 5% fragment loss
//! flare-replay --frames 600 --loss 0.05
//!
//! # HEVC with a config file, Prometheus dump at the end
//! flare-replay --codec hevc --config flare.toml --prometheus
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use crossbeam_channel::Sender;
use flare_media::config::{PipelineConfig, parse_codec};
use flare_media::media::nal::{Codec, UnitKind};
use flare_media::metrics::render_prometheus;
use flare_media::output::{UnitConsumer, unit_channel};
use flare_media::pipeline::FramePipeline;
use flare_transport::FecEncoder;
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            PipelineConfig::from_toml_str(&text).map_err(anyhow::Error::msg)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(codec) = args.codec {
        config.codec = codec;
    }

    tracing::info!(
        codec = %config.codec,
        frames = args.frames,
        loss = args.loss,
        reorder = args.reorder,
        seed = args.seed,
        window = config.fec.window,
        fec = config.fec.enabled,
        "flare-replay starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Decoder thread ──────────────────────────────────────────
    let (producer, consumer) = unit_channel(config.output.capacity);
    let (totals_tx, totals_rx) = crossbeam_channel::bounded(1);
    let decoding = Arc::new(AtomicBool::new(true));
    let decoder = {
        let decoding = decoding.clone();
        thread::Builder::new()
            .name("flare-decoder".into())
            .spawn(move || decoder_loop(consumer, decoding, totals_tx))?
    };

    // ── Replay loop ─────────────────────────────────────────────
    let mut pipeline = FramePipeline::new(config.clone(), producer);
    let encoder = FecEncoder::new(args.shard_size, args.parity_percent);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut synth = StreamSynth::new(config.codec, args.gop);

    let mut fragments_sent = 0u64;
    let mut fragments_lost = 0u64;
    let mut refreshes = 0u64;
    let mut frames = 0u64;
    let mut last_stats_log = Instant::now();
    let stats_interval = Duration::from_secs(2);

    for frame_index in 0..args.frames {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        if pipeline.fec_failure() && synth.request_refresh() {
            refreshes += 1;
            tracing::debug!(frame = frame_index, "refresh requested");
        }

        let frame = synth.next_frame(&mut rng);
        let mut records = match encoder.encode_frame(frame_index, &frame) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(frame = frame_index, error = %e, "frame not encodable");
                continue;
            }
        };
        if rng.random::<f64>() < args.reorder {
            records.shuffle(&mut rng);
        }

        for record in records {
            if rng.random::<f64>() < args.loss {
                fragments_lost += 1;
                continue;
            }
            fragments_sent += 1;
            let mut datagram = record.to_bytes();
            if let Err(e) = pipeline.ingest_datagram(&mut datagram) {
                tracing::debug!(frame = frame_index, error = %e, "record rejected");
            }
        }
        frames += 1;

        if last_stats_log.elapsed() >= stats_interval {
            tracing::info!(stats = %pipeline.stats().to_json(), "pipeline stats");
            last_stats_log = Instant::now();
        }
    }
    pipeline.advance_to(frames);
    let stats = pipeline.stats();
    drop(pipeline);

    // ── Cleanup ─────────────────────────────────────────────────
    decoding.store(false, Ordering::Relaxed);
    let totals = totals_rx
        .recv_timeout(Duration::from_secs(5))
        .context("decoder thread did not report")?;
    decoder
        .join()
        .map_err(|_| anyhow::anyhow!("decoder thread panicked"))?;

    tracing::info!(
        frames,
        fragments_sent,
        fragments_lost,
        refreshes,
        units = totals.units,
        bytes = totals.bytes,
        parameter_sets = totals.parameter_sets,
        key_units = totals.key_units,
        delta_units = totals.delta_units,
        frames_decoded = totals.frames,
        frames_lossy = stats.fec.frames_lossy,
        fragments_recovered = stats.fec.fragments_recovered,
        units_dropped = stats.splitter.units_dropped,
        "flare-replay finished"
    );

    if args.prometheus {
        print!("{}", render_prometheus(&stats));
    }

    Ok(())
}

// ─── Decoder Side ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DecoderTotals {
    units: u64,
    bytes: u64,
    parameter_sets: u64,
    key_units: u64,
    delta_units: u64,
    /// Distinct frame indices seen.
    frames: u64,
}

fn decoder_loop(
    mut consumer: UnitConsumer,
    decoding: Arc<AtomicBool>,
    totals_tx: Sender<DecoderTotals>,
) {
    let mut totals = DecoderTotals::default();
    let mut last_frame = None;

    loop {
        while let Some(slot) = consumer.pop() {
            totals.units += 1;
            totals.bytes += slot.length as u64;
            match slot.kind {
                UnitKind::ParamSetBundle => totals.parameter_sets += 1,
                UnitKind::Key => totals.key_units += 1,
                UnitKind::Delta => totals.delta_units += 1,
                UnitKind::Filtered => {}
            }
            if last_frame != Some(slot.frame_index) {
                totals.frames += 1;
                last_frame = Some(slot.frame_index);
            }
            consumer.recycle(slot);
        }

        if consumer.is_empty() && (!decoding.load(Ordering::Relaxed) || consumer.is_abandoned()) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    let _ = totals_tx.send(totals);
}

// ─── Synthetic Stream ───────────────────────────────────────────────────────

/// Produces Annex B frames shaped like an encoder's output: parameter sets
/// and an IDR at every GOP start, a slice per delta frame, and the odd
/// filler or delimiter unit that the splitter must drop.
struct StreamSynth {
    codec: Codec,
    gop: u64,
    position: u64,
    refresh_pending: bool,
}

impl StreamSynth {
    fn new(codec: Codec, gop: u64) -> Self {
        StreamSynth {
            codec,
            gop: gop.max(1),
            position: 0,
            refresh_pending: false,
        }
    }

    /// Force the next frame to be a key frame. False if one is already due.
    fn request_refresh(&mut self) -> bool {
        !std::mem::replace(&mut self.refresh_pending, true)
    }

    fn next_frame(&mut self, rng: &mut StdRng) -> Vec<u8> {
        let key = self.refresh_pending || self.position % self.gop == 0;
        self.position = if key { 1 } else { self.position + 1 };
        self.refresh_pending = false;

        let mut frame = Vec::new();
        match (self.codec, key) {
            (Codec::H264, true) => {
                push_unit(&mut frame, &[0x67], rng.random_range(8..24), rng); // SPS
                push_unit(&mut frame, &[0x68], rng.random_range(3..8), rng); // PPS
                push_unit(&mut frame, &[0x65], rng.random_range(12_000..30_000), rng);
            }
            (Codec::H264, false) => {
                if rng.random::<f64>() < 0.2 {
                    push_unit(&mut frame, &[0x06], rng.random_range(8..40), rng); // SEI
                }
                push_unit(&mut frame, &[0x41], rng.random_range(1_500..8_000), rng);
            }
            (Codec::H265, true) => {
                push_unit(&mut frame, &[0x40, 0x01], rng.random_range(16..28), rng); // VPS
                push_unit(&mut frame, &[0x42, 0x01], rng.random_range(24..48), rng); // SPS
                push_unit(&mut frame, &[0x44, 0x01], rng.random_range(4..10), rng); // PPS
                push_unit(&mut frame, &[0x26, 0x01], rng.random_range(12_000..30_000), rng);
            }
            (Codec::H265, false) => {
                push_unit(&mut frame, &[0x02, 0x01], rng.random_range(1_500..8_000), rng);
                if rng.random::<f64>() < 0.2 {
                    // SEI suffix
                    push_unit(&mut frame, &[0x50, 0x01], rng.random_range(8..40), rng);
                }
            }
        }

        if rng.random::<f64>() < 0.1 {
            let filler: &[u8] = match self.codec {
                Codec::H264 => &[0x0C],
                Codec::H265 => &[0x4C, 0x01],
            };
            push_unit(&mut frame, filler, rng.random_range(16..256), rng);
        }
        frame
    }
}

/// Start code, header, then `len` nonzero bytes so no start code is
/// emulated inside the unit.
fn push_unit(frame: &mut Vec<u8>, header: &[u8], len: usize, rng: &mut StdRng) {
    frame.extend_from_slice(&[0, 0, 0, 1]);
    frame.extend_from_slice(header);
    frame.extend((0..len).map(|_| rng.random_range(1..=255u8)));
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<String>,
    codec: Option<Codec>,
    frames: u64,
    loss: f64,
    reorder: f64,
    seed: u64,
    gop: u64,
    shard_size: usize,
    parity_percent: u32,
    prometheus: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut out = Args {
        config: None,
        codec: None,
        frames: 300,
        loss: 0.02,
        reorder: 0.3,
        seed: 1,
        gop: 60,
        shard_size: 1200,
        parity_percent: 10,
        prometheus: false,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => out.config = Some(take_value(&args, &mut i, flag)?.to_string()),
            "--codec" => {
                let name = take_value(&args, &mut i, flag)?;
                out.codec = Some(parse_codec(name).map_err(anyhow::Error::msg)?);
            }
            "--frames" | "-n" => out.frames = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--loss" => out.loss = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--reorder" => out.reorder = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--seed" => out.seed = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--gop" => out.gop = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--shard-size" => out.shard_size = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--parity" => out.parity_percent = parse_num(flag, take_value(&args, &mut i, flag)?)?,
            "--prometheus" => out.prometheus = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    if !(0.0..=1.0).contains(&out.loss) || !(0.0..=1.0).contains(&out.reorder) {
        anyhow::bail!("--loss and --reorder must be between 0 and 1");
    }
    Ok(out)
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn parse_num<T>(flag: &str, val: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.parse()
        .map_err(|e| anyhow::anyhow!("invalid value for {flag} '{val}': {e}"))
}

fn print_help() {
    eprintln!(
        "flare-replay: replay a synthetic video stream through the receive pipeline

USAGE:
    flare-replay [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Pipeline config (TOML)
        --codec <NAME>      h264 | h265 (overrides config)
    -n, --frames <N>        Frames to replay [default: 300]
        --loss <P>          Fragment loss probability [default: 0.02]
        --reorder <P>       Probability a frame's fragments are shuffled [default: 0.3]
        --seed <N>          RNG seed [default: 1]
        --gop <N>           Frames per key frame [default: 60]
        --shard-size <B>    Fragment payload size [default: 1200]
        --parity <PCT>      Parity fragments per 100 data fragments [default: 10]
        --prometheus        Print final metrics in Prometheus format
    -h, --help              Print this help

ENVIRONMENT:
    RUST_LOG                Log filter [default: info]"
    );
}
