#![no_main]
use libfuzzer_sys::fuzz_target;
use shield_federation::store::backend::decode_frames;

fuzz_target!(|data: &[u8]| {
    // A torn or corrupt log must decode to a valid prefix, never panic
    if let Ok((_records, valid_len)) = decode_frames(data) {
        assert!(valid_len <= data.len());
    }
});
