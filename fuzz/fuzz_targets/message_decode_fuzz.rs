//! Fuzz test for invalidation message decoding
//!
//! Arbitrary bytes arriving from the broadcast channel must decode to an
//! error or a message, never a panic. Decoded messages must survive
//! conversion to an event and re-encoding.
//!
//! Run with: cargo +nightly fuzz run message_decode_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use stratum_events::InvalidationMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = InvalidationMessage::decode(data) {
        let sender = message.sender;
        if let Ok(event) = message.into_event() {
            let encoded = InvalidationMessage::new(sender, event)
                .encode()
                .expect("decoded message must re-encode");
            assert!(InvalidationMessage::decode(&encoded).is_ok());
        }
    }
});
