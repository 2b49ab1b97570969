#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis::consensus::UnitProps;
use trellis::node::dependencies::UnhandledUnit;

fuzz_target!(|data: &[u8]| {
    // Stored records are decoded on every open; a corrupted store must
    // surface as an error, not a panic.
    let _ = trellis::deserialize::<UnitProps>(data);
    let _ = trellis::deserialize::<UnhandledUnit>(data);
});
