//! # End-to-end pipeline tests
//!
//! Annex B frames are fragmented with parity, pushed through the wire
//! format under loss and reordering, and the units that reach the decoder
//! side of the channel are checked against the source bitstream.

use bytes::Bytes;
use flare_media::config::PipelineConfig;
use flare_media::media::nal::{Codec, SplitError, UnitKind};
use flare_media::output::{UnitConsumer, UnitSlot, unit_channel};
use flare_media::pipeline::{FrameOutcome, FramePipeline};
use flare_transport::FecEncoder;
use flare_transport::wire::FragmentRecord;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn unit(header: &[u8], len: usize, seed: u8) -> Vec<u8> {
    let mut u = vec![0, 0, 0, 1];
    u.extend_from_slice(header);
    u.extend((0..len).map(|i| ((i as u32 * 7 + seed as u32) % 254 + 1) as u8));
    u
}

fn h264_key(seed: u8) -> Vec<Vec<u8>> {
    vec![
        unit(&[0x67], 12, seed),
        unit(&[0x68], 4, seed),
        unit(&[0x65], 5000, seed),
    ]
}

fn h264_delta(seed: u8) -> Vec<Vec<u8>> {
    vec![unit(&[0x41], 1500, seed)]
}

fn drain(rx: &mut UnitConsumer) -> Vec<UnitSlot> {
    std::iter::from_fn(|| rx.pop()).collect()
}

fn send_frame(
    p: &mut FramePipeline<flare_media::UnitProducer>,
    enc: &FecEncoder,
    index: u64,
    units: &[Vec<u8>],
) -> Vec<FrameOutcome> {
    let mut out = Vec::new();
    for rec in enc.encode_frame(index, &units.concat()).unwrap() {
        let mut wire = rec.to_bytes();
        out.extend(p.ingest_datagram(&mut wire).unwrap().frames);
    }
    out
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[test]
fn sps_pps_slice_scenario() {
    let (tx, mut rx) = unit_channel(16);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    p.failure_signal().raise();

    let sps = unit(&[0x67], 3, 1);
    let pps = unit(&[0x68], 2, 2);
    let slice = unit(&[0x65], 40, 3);
    send_frame(&mut p, &FecEncoder::new(16, 10), 0, &[sps.clone(), pps.clone(), slice.clone()]);

    let units = drain(&mut rx);
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].kind, UnitKind::ParamSetBundle);
    assert_eq!(units[0].data(), &[sps, pps].concat()[..]);
    assert_eq!(units[1].kind, UnitKind::Key);
    assert_eq!(units[1].data(), &slice[..]);
    assert!(!p.fec_failure());
}

#[test]
fn gop_survives_moderate_loss_byte_exact() {
    let (tx, mut rx) = unit_channel(256);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    let enc = FecEncoder::new(300, 25);
    let mut rng = StdRng::seed_from_u64(11);

    let mut sent = Vec::new();
    for i in 0..30u64 {
        let units = if i % 10 == 0 {
            h264_key(i as u8)
        } else {
            h264_delta(i as u8)
        };
        let mut records = enc.encode_frame(i, &units.concat()).unwrap();
        records.shuffle(&mut rng);
        // One data fragment lost per frame; parity rebuilds it.
        let victim = records
            .iter()
            .position(|r| !r.is_parity)
            .unwrap();
        records.remove(victim);
        for rec in records {
            p.ingest(rec).unwrap();
        }
        sent.push(units);
    }
    p.advance_to(30);

    let units = drain(&mut rx);
    let stats = p.stats();
    assert_eq!(stats.fec.frames_lossy, 0);
    assert_eq!(stats.frames_delivered, 30);
    assert!(stats.fec.fragments_recovered >= 30);

    let mut expected = Vec::new();
    for (i, frame) in sent.iter().enumerate() {
        if i % 10 == 0 {
            let bundle = [frame[0].clone(), frame[1].clone()].concat();
            expected.push((i as u64, UnitKind::ParamSetBundle, bundle));
            expected.push((i as u64, UnitKind::Key, frame[2].clone()));
        } else {
            expected.push((i as u64, UnitKind::Delta, frame[0].clone()));
        }
    }
    let got: Vec<(u64, UnitKind, Vec<u8>)> = units
        .iter()
        .map(|s| (s.frame_index, s.kind, s.data().to_vec()))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn unrecoverable_loss_raises_flag_until_key_frame() {
    let (tx, mut rx) = unit_channel(64);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    let enc = FecEncoder::new(200, 0);

    send_frame(&mut p, &enc, 0, &h264_key(0));
    assert!(!p.fec_failure());

    // Frame 1 loses a fragment and has no parity.
    let mut records = enc.encode_frame(1, &h264_delta(1).concat()).unwrap();
    records.remove(2);
    for rec in records {
        p.ingest(rec).unwrap();
    }
    // Frames 2 and 3 open; the window of 2 pushes frame 1 out.
    send_frame(&mut p, &enc, 2, &h264_delta(2));
    let outcomes = send_frame(&mut p, &enc, 3, &h264_delta(3));
    assert!(outcomes.contains(&FrameOutcome::DiscardedLossy { frame_index: 1 }));
    assert!(p.fec_failure());

    // Delta frames do not clear it; a parameter-set frame does.
    send_frame(&mut p, &enc, 4, &h264_delta(4));
    assert!(p.fec_failure());
    send_frame(&mut p, &enc, 5, &h264_key(5));
    assert!(!p.fec_failure());

    let frames: Vec<u64> = drain(&mut rx).iter().map(|s| s.frame_index).collect();
    assert!(!frames.contains(&1));
    assert!(frames.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn truncated_parameter_sets_reject_the_frame() {
    let (tx, mut rx) = unit_channel(16);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    // H.265 needs VPS, SPS and PPS ahead of the picture.
    p.set_codec(Codec::H265);

    let units = vec![unit(&[0x40, 0x01], 20, 0), unit(&[0x42, 0x01], 30, 0)];
    let outcomes = send_frame(&mut p, &FecEncoder::new(64, 0), 0, &units);

    assert_eq!(
        outcomes,
        vec![FrameOutcome::Invalid {
            frame_index: 0,
            error: SplitError::MalformedParameterPrefix {
                frame_index: 0,
                expected: 3
            }
        }]
    );
    assert!(drain(&mut rx).is_empty());
    assert_eq!(p.stats().frames_invalid, 1);
}

#[test]
fn hevc_filler_and_delimiters_stay_out() {
    let (tx, mut rx) = unit_channel(16);
    let mut config = PipelineConfig::default();
    config.codec = Codec::H265;
    let mut p = FramePipeline::new(config, tx);

    let units = vec![
        unit(&[0x40, 0x01], 20, 1),
        unit(&[0x42, 0x01], 30, 2),
        unit(&[0x44, 0x01], 6, 3),
        unit(&[0x26, 0x01], 900, 4),
        unit(&[0x4C, 0x01], 64, 5), // filler data, type 38
        unit(&[0x46, 0x01], 1, 6),  // AUD, type 35
    ];
    send_frame(&mut p, &FecEncoder::new(256, 10), 0, &units);

    let kinds: Vec<UnitKind> = drain(&mut rx).iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![UnitKind::ParamSetBundle, UnitKind::Key]);
    assert_eq!(p.stats().splitter.units_filtered, 2);
}

#[test]
fn slow_decoder_loses_units_not_the_stream() {
    let (tx, mut rx) = unit_channel(2);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    let enc = FecEncoder::new(500, 0);

    for i in 0..4u64 {
        send_frame(&mut p, &enc, i, &h264_delta(i as u8));
    }
    assert_eq!(drain(&mut rx).len(), 2);
    assert_eq!(p.stats().splitter.units_dropped, 2);

    send_frame(&mut p, &enc, 4, &h264_delta(4));
    let units = drain(&mut rx);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].frame_index, 4);
}

#[test]
fn fec_bypass_treats_each_record_as_a_frame() {
    let (tx, mut rx) = unit_channel(16);
    let config = PipelineConfig::from_toml_str("[fec]\nenabled = false").unwrap();
    let mut p = FramePipeline::new(config, tx);

    for i in 0..3u64 {
        let frame = Bytes::from(h264_delta(i as u8).concat());
        let rec = FragmentRecord {
            frame_index: i,
            frame_byte_length: frame.len() as u32,
            data_fragment_count: 1,
            parity_fragment_count: 0,
            fragment_index: 0,
            is_parity: false,
            payload: frame,
        };
        p.ingest(rec).unwrap();
    }
    assert_eq!(drain(&mut rx).len(), 3);
    assert_eq!(p.stats().frames_bypassed, 3);
}

#[test]
fn codec_renegotiation_between_frames() {
    let (tx, mut rx) = unit_channel(16);
    let mut p = FramePipeline::new(PipelineConfig::default(), tx);
    let enc = FecEncoder::new(400, 10);

    send_frame(&mut p, &enc, 0, &h264_key(0));
    p.set_codec_id(Codec::H265.id()).unwrap();
    let hevc = vec![
        unit(&[0x40, 0x01], 20, 1),
        unit(&[0x42, 0x01], 30, 2),
        unit(&[0x44, 0x01], 6, 3),
        unit(&[0x26, 0x01], 900, 4),
    ];
    send_frame(&mut p, &enc, 1, &hevc);

    let units = drain(&mut rx);
    let kinds: Vec<(u64, UnitKind)> = units.iter().map(|s| (s.frame_index, s.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (0, UnitKind::ParamSetBundle),
            (0, UnitKind::Key),
            (1, UnitKind::ParamSetBundle),
            (1, UnitKind::Key),
        ]
    );
    assert_eq!(units[2].data(), &hevc[..3].concat()[..]);
}
