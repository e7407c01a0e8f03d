//! # Integration tests: encoder → wire → store → reconstructor
//!
//! No network I/O — records are encoded to bytes, impaired (dropped,
//! reordered, duplicated), decoded again and fed to the store. After every
//! fragment the oldest group is offered to the reconstructor, the way the
//! receive thread drives it.

use bytes::Bytes;
use flare_transport::codec::{Completion, FecEncoder, FecReconstructor, ReconstructedFrame};
use flare_transport::store::{AddOutcome, FragmentStore, StoreConfig};
use flare_transport::wire::FragmentRecord;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand::rngs::StdRng;

// ─── Helpers ────────────────────────────────────────────────────────────────

struct Harness {
    store: FragmentStore,
    fec: FecReconstructor,
    frames: Vec<ReconstructedFrame>,
}

impl Harness {
    fn new(window: usize) -> Self {
        Harness {
            store: FragmentStore::new(StoreConfig {
                window,
                ..StoreConfig::default()
            }),
            fec: FecReconstructor::new(),
            frames: Vec::new(),
        }
    }

    /// Wire-encode, decode, admit, then drain finished frames.
    fn feed(&mut self, record: &FragmentRecord) -> AddOutcome {
        let mut wire: Bytes = record.to_bytes();
        let decoded = FragmentRecord::decode(&mut wire).expect("valid wire record");
        let admission = self.store.ingest(decoded).expect("valid fragment");
        if let Some(mut evicted) = admission.evicted {
            if let Completion::Ready(frame) = self.fec.try_complete(&mut evicted) {
                self.frames.push(frame);
            }
        }
        self.drain();
        admission.outcome
    }

    fn advance_to(&mut self, frame_index: u64) {
        self.store.seal_before(frame_index);
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(group) = self.store.oldest_mut() {
            match self.fec.try_complete(group) {
                Completion::Pending => break,
                Completion::Ready(frame) => {
                    self.store.retire_oldest();
                    self.frames.push(frame);
                }
            }
        }
    }
}

fn frame_payload(index: u64, len: usize) -> Vec<u8> {
    (0..len).map(|j| (j as u64 ^ index.wrapping_mul(131)) as u8).collect()
}

// ─── Perfect Network ────────────────────────────────────────────────────────

#[test]
fn in_order_frames_delivered_in_order() {
    let enc = FecEncoder::new(1000, 10);
    let mut h = Harness::new(2);

    let payloads: Vec<Vec<u8>> =
        (0..10).map(|i| frame_payload(i, 3000 + i as usize * 17)).collect();
    for (i, p) in payloads.iter().enumerate() {
        for rec in enc.encode_frame(i as u64, p).unwrap() {
            h.feed(&rec);
        }
    }

    assert_eq!(h.frames.len(), 10);
    for (i, frame) in h.frames.iter().enumerate() {
        assert_eq!(frame.frame_index, i as u64);
        assert_eq!(&frame.buffer[..], &payloads[i][..]);
        assert!(!frame.lossy);
    }
    // Data completes each frame; its parity then arrives for a retired frame.
    assert_eq!(h.store.stats().stale, 10);
    assert_eq!(h.fec.stats().frames_complete, 10);
}

#[test]
fn shuffled_fragments_within_a_frame() {
    let enc = FecEncoder::new(500, 20);
    let payload = frame_payload(3, 7777);
    let mut records = enc.encode_frame(3, &payload).unwrap();
    records.shuffle(&mut StdRng::seed_from_u64(42));

    let mut h = Harness::new(2);
    for rec in &records {
        h.feed(rec);
    }
    assert_eq!(h.frames.len(), 1);
    assert_eq!(&h.frames[0].buffer[..], &payload[..]);
}

#[test]
fn duplicates_are_ignored() {
    let enc = FecEncoder::new(400, 0);
    let payload = frame_payload(1, 1200);
    let records = enc.encode_frame(1, &payload).unwrap();

    let mut h = Harness::new(2);
    assert_eq!(h.feed(&records[0]), AddOutcome::Inserted);
    assert_eq!(h.feed(&records[0]), AddOutcome::Duplicate);
    assert_eq!(h.feed(&records[1]), AddOutcome::Inserted);
    assert_eq!(h.feed(&records[2]), AddOutcome::Inserted);
    assert_eq!(h.feed(&records[1]), AddOutcome::Stale);

    assert_eq!(h.frames.len(), 1);
    assert_eq!(&h.frames[0].buffer[..], &payload[..]);
}

// ─── Loss ───────────────────────────────────────────────────────────────────

#[test]
fn one_lost_fragment_per_frame_recovered() {
    let enc = FecEncoder::new(200, 10);
    let mut h = Harness::new(2);

    for i in 0..20u64 {
        let payload = frame_payload(i, 2000);
        let lost = (i % 10) as u32;
        for rec in enc.encode_frame(i, &payload).unwrap() {
            if !rec.is_parity && rec.fragment_index == lost {
                continue;
            }
            h.feed(&rec);
        }
    }

    assert_eq!(h.frames.len(), 20);
    assert!(h.frames.iter().all(|f| !f.lossy && f.recovered_fragments == 1));
    assert!(!h.fec.fec_failure());
    assert_eq!(h.fec.stats().fragments_recovered, 20);
}

#[test]
fn eviction_finishes_oldest_frame_lossy() {
    let enc = FecEncoder::new(100, 0);
    let mut h = Harness::new(2);

    // Frame 0 loses its second fragment; frames 1 and 2 start afterwards.
    let f0 = enc.encode_frame(0, &frame_payload(0, 300)).unwrap();
    h.feed(&f0[0]);
    h.feed(&f0[2]);
    let f1 = enc.encode_frame(1, &frame_payload(1, 300)).unwrap();
    h.feed(&f1[0]);
    assert!(h.frames.is_empty());

    let f2 = enc.encode_frame(2, &frame_payload(2, 300)).unwrap();
    h.feed(&f2[0]);

    assert_eq!(h.frames.len(), 1);
    assert_eq!(h.frames[0].frame_index, 0);
    assert!(h.frames[0].lossy);
    assert!(h.frames[0].buffer[100..200].iter().all(|&b| b == 0));
    assert!(h.fec.fec_failure());
    assert_eq!(h.store.stats().evicted, 1);

    // The missing fragment shows up late.
    assert_eq!(h.feed(&f0[1]), AddOutcome::Stale);
}

#[test]
fn newer_complete_frame_waits_for_older() {
    let enc = FecEncoder::new(100, 0);
    let mut h = Harness::new(2);

    let f0 = enc.encode_frame(0, &frame_payload(0, 200)).unwrap();
    let f1 = enc.encode_frame(1, &frame_payload(1, 200)).unwrap();
    h.feed(&f0[0]);
    h.feed(&f1[0]);
    h.feed(&f1[1]);
    assert!(h.frames.is_empty(), "frame 1 is held behind frame 0");

    h.feed(&f0[1]);
    let order: Vec<u64> = h.frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(order, vec![0, 1]);
}

#[test]
fn explicit_advance_seals_older_frames() {
    let enc = FecEncoder::new(100, 0);
    let mut h = Harness::new(4);

    let f0 = enc.encode_frame(0, &frame_payload(0, 200)).unwrap();
    h.feed(&f0[0]);
    h.advance_to(1);

    assert_eq!(h.frames.len(), 1);
    assert!(h.frames[0].lossy);
    assert_eq!(h.store.in_flight(), 0);
    assert_eq!(h.store.watermark(), Some(0));
}

#[test]
fn random_loss_never_corrupts_complete_frames() {
    let enc = FecEncoder::new(300, 20);
    let mut rng = StdRng::seed_from_u64(7);
    let mut h = Harness::new(2);
    let mut originals = Vec::new();

    for i in 0..50u64 {
        let payload = frame_payload(i, 4000);
        let mut records = enc.encode_frame(i, &payload).unwrap();
        records.shuffle(&mut rng);
        // Deterministic ~8% loss.
        for (n, rec) in records.iter().enumerate() {
            if (n as u64 + i) % 12 != 0 {
                h.feed(rec);
            }
        }
        originals.push(payload);
    }
    h.advance_to(50);

    assert_eq!(h.frames.len(), 50);
    for frame in &h.frames {
        if !frame.lossy {
            assert_eq!(&frame.buffer[..], &originals[frame.frame_index as usize][..]);
        }
        assert_eq!(frame.buffer.len(), 4000);
    }
    let indices: Vec<u64> = h.frames.iter().map(|f| f.frame_index).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
}
