#![no_main]

use bytes::Bytes;
use flare_media::media::nal::{Codec, UnitSplitter};
use flare_media::output::unit_channel;
use flare_transport::ReconstructedFrame;
use flare_transport::codec::FecFailureSignal;
use libfuzzer_sys::fuzz_target;

/// Fuzz the bitstream splitter with arbitrary frame buffers.
///
/// First byte picks the codec; the rest is the frame. Every emitted unit
/// range must lie inside the frame and units must tile it in order.
fuzz_target!(|data: &[u8]| {
    let Some((&selector, body)) = data.split_first() else {
        return;
    };
    let codec = if selector & 1 == 0 { Codec::H264 } else { Codec::H265 };
    let (mut producer, _consumer) = unit_channel(4);
    let mut splitter = UnitSplitter::new(codec, FecFailureSignal::new());

    let frame = ReconstructedFrame {
        frame_index: 0,
        buffer: Bytes::copy_from_slice(body),
        lossy: false,
        recovered_fragments: 0,
        missing_fragments: 0,
        assembly_latency: Default::default(),
    };

    if let Ok(report) = splitter.process(&frame, &mut producer) {
        let mut cursor = 0;
        for unit in &report.units {
            assert_eq!(unit.range.start, cursor);
            assert!(unit.range.end <= body.len());
            cursor = unit.range.end;
        }
        assert_eq!(cursor, body.len());
    }
});
