#![no_main]

use flare_transport::wire::{DEFAULT_MAX_FRAME_BYTES, Fragment, FragmentRecord};
use libfuzzer_sys::fuzz_target;

/// Fuzz record decoding and fragment validation.
///
/// Decoding must return `None` for malformed input and validation must
/// reject, never panic on, inconsistent layouts.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    while let Some(record) = FragmentRecord::decode(&mut buf) {
        let _ = Fragment::from_record(record, DEFAULT_MAX_FRAME_BYTES);
    }
});
