#![no_main]
use libfuzzer_sys::fuzz_target;
use undertow::PeerMessage;

fuzz_target!(|data: &[u8]| {
    // decode() should never panic on arbitrary frame bodies, and anything
    // it does decode must re-encode without panicking
    if let Ok(message) = PeerMessage::decode(data) {
        let _ = message.encode();
    }
});
