#![no_main]

use flare_transport::codec::{Completion, FecReconstructor};
use flare_transport::store::{FragmentStore, StoreConfig};
use flare_transport::wire::FragmentRecord;
use libfuzzer_sys::fuzz_target;

/// Fuzz the store + reconstructor with arbitrary record streams.
///
/// Exercises admission (stale, duplicate, layout mismatch), window
/// eviction, peeling over arbitrary parity payloads, and buffer assembly.
/// Every finished frame must be exactly its declared length.
fuzz_target!(|data: &[u8]| {
    let mut store = FragmentStore::new(StoreConfig {
        window: 2,
        max_frame_bytes: 1 << 16,
    });
    let mut fec = FecReconstructor::new();
    let mut buf = data;

    while let Some(record) = FragmentRecord::decode(&mut buf) {
        let Ok(admission) = store.ingest(record) else {
            continue;
        };
        if let Some(mut evicted) = admission.evicted {
            let expected = evicted.layout().frame_byte_length as usize;
            if let Completion::Ready(frame) = fec.try_complete(&mut evicted) {
                assert_eq!(frame.buffer.len(), expected);
            }
        }
        while let Some(group) = store.oldest_mut() {
            let expected = group.layout().frame_byte_length as usize;
            match fec.try_complete(group) {
                Completion::Pending => break,
                Completion::Ready(frame) => {
                    assert_eq!(frame.buffer.len(), expected);
                    store.retire_oldest();
                }
            }
        }
    }
});
