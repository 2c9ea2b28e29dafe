#![no_main]

//! Fuzz target for wire frame decoding.
//!
//! Frames come from untrusted clients. Decoding must never panic, and
//! anything that decodes must re-encode and decode to the same frame.

use libfuzzer_sys::fuzz_target;
use stubgate::remote::{ReplyPayload, WireMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(message) = WireMessage::decode(text) else {
        return;
    };
    let encoded = message.encode().expect("decoded frame re-encodes");
    assert_eq!(WireMessage::decode(&encoded).ok(), Some(message.clone()));

    match message {
        WireMessage::Rpc { payload, .. } => {
            let _ = payload.into_request();
        }
        WireMessage::Reply { payload, .. } => {
            let _ = ReplyPayload::into_decision(payload);
        }
        WireMessage::Control(_) => {}
    }
});
