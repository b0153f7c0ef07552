#![no_main]
use fotadelta::compress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Bounded output regardless of input.
    if let Ok(out) = compress::inflate(data, 4096) {
        assert!(out.len() <= 4096);
    }
});
