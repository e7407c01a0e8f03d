use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flare_media::config::PipelineConfig;
use flare_media::media::nal::{find_unit_end, Codec, UnitSplitter};
use flare_media::output::unit_channel;
use flare_media::pipeline::FramePipeline;
use flare_transport::codec::FecFailureSignal;
use flare_transport::{FecEncoder, ReconstructedFrame};

fn unit(header: u8, len: usize) -> Vec<u8> {
    let mut u = vec![0, 0, 0, 1, header];
    u.extend((0..len).map(|i| (i % 254 + 1) as u8));
    u
}

/// SPS + PPS + a 60 KiB IDR sliced four ways.
fn key_frame() -> Vec<u8> {
    let mut f = unit(0x67, 20);
    f.extend(unit(0x68, 6));
    for _ in 0..4 {
        f.extend(unit(0x65, 15_000));
    }
    f
}

/// Benchmark the start-code scan on its own.
fn bench_boundary_scan(c: &mut Criterion) {
    let frame = key_frame();
    let mut group = c.benchmark_group("boundary");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("scan_60k_frame", |b| {
        b.iter(|| {
            let mut cursor = 0;
            while cursor < frame.len() {
                cursor = find_unit_end(black_box(&frame), cursor, 1).unwrap_or(frame.len());
            }
            black_box(cursor)
        });
    });
    group.finish();
}

/// Benchmark splitting into the unit channel, drained after every frame.
fn bench_split(c: &mut Criterion) {
    let frame = ReconstructedFrame {
        frame_index: 0,
        buffer: Bytes::from(key_frame()),
        lossy: false,
        recovered_fragments: 0,
        missing_fragments: 0,
        assembly_latency: Duration::ZERO,
    };
    let (mut tx, mut rx) = unit_channel(64);
    let mut splitter = UnitSplitter::new(Codec::H264, FecFailureSignal::new());

    let mut group = c.benchmark_group("splitter");
    group.throughput(Throughput::Bytes(frame.buffer.len() as u64));
    group.bench_function("split_key_frame", |b| {
        b.iter(|| {
            let report = splitter.process(black_box(&frame), &mut tx);
            while let Some(slot) = rx.pop() {
                rx.recycle(slot);
            }
            black_box(report)
        });
    });
    group.finish();
}

/// Fragments in, units out, 10% parity and no loss.
fn bench_pipeline(c: &mut Criterion) {
    let payload = key_frame();
    let enc = FecEncoder::new(1200, 10);
    let records: Vec<_> = (0..16u64)
        .map(|i| enc.encode_frame(i, &payload).expect("valid frame"))
        .collect();

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("sixteen_key_frames", |b| {
        b.iter(|| {
            let (tx, mut rx) = unit_channel(256);
            let mut p = FramePipeline::new(PipelineConfig::default(), tx);
            for rec in records.iter().flatten().cloned() {
                let _ = p.ingest(rec);
            }
            while let Some(slot) = rx.pop() {
                black_box(slot);
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_boundary_scan, bench_split, bench_pipeline);
criterion_main!(benches);
