//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder and
//! asserts that it never panics, never yields an oversized payload, and
//! accepts bytes cleanly again after a reset.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use crema::link::codec::{DecodeEvent, FrameDecoder, MAX_PAYLOAD_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();

    decoder.feed(data, |event| {
        if let DecodeEvent::Frame { payload, .. } = event {
            assert!(payload.len() <= MAX_PAYLOAD_LEN, "payload exceeds budget");
        }
    });

    // After a reset the decoder must accept bytes cleanly again.
    decoder.reset();
    decoder.feed(data, |_| {});
});
