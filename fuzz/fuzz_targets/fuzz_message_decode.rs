//! Fuzz target: `Message::decode_payload`
//!
//! Every message type against arbitrary payload bytes: decoding must
//! reject cleanly or produce a value, never panic, and any accepted
//! value must re-encode.
//!
//! cargo fuzz run fuzz_message_decode

#![no_main]

use crema::link::messages::{Message, MessageType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((first, payload)) = data.split_first() else {
        return;
    };
    let Some(ty) = MessageType::from_u8(*first) else {
        return;
    };

    if let Ok(msg) = Message::decode_payload(ty, payload) {
        let mut buf = [0u8; 128];
        let _ = msg.encode_payload(&mut buf);
    }
});
