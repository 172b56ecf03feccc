#![no_main]
use libfuzzer_sys::fuzz_target;
use shield_federation::Event;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder or the structural check
    let Ok(event) = Event::from_bytes(data) else {
        return;
    };
    let _ = event.check_structure();
    let _ = event.state_slot();
    let _ = event.to_bytes();
});
