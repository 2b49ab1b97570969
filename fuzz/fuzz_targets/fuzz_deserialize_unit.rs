#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis::consensus::Unit;

fuzz_target!(|data: &[u8]| {
    // Units arrive from untrusted peers. Decoding must never panic, and a
    // decoded unit must hash without panicking whatever its field sizes.
    if let Ok(unit) = trellis::deserialize::<Unit>(data) {
        let _ = unit.content_id();
        let _ = unit.references();
    }
});
