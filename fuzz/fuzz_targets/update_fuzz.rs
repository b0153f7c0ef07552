#![no_main]
use fotadelta::engine::{self, ImageClass, UpdateConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The engine must never panic, only return errors.
    if data.len() < 2 {
        return;
    }
    let packet_size = usize::from(data[0]) + 1;
    let class = if data[1] & 1 == 0 {
        ImageClass::Raw
    } else {
        ImageClass::Preamble {
            binary_header_len: usize::from(data[1] >> 1),
        }
    };
    let config = UpdateConfig {
        block_size: 64,
        packet_size,
        image_class: class,
        ..Default::default()
    };

    // Split the rest into an old image and a patch stream, and also try the
    // stream with a valid signature so fuzzing reaches the block records.
    let rest = &data[2..];
    let (old, patch) = rest.split_at(rest.len() / 3);
    let _ = engine::apply_update(old, patch, config.clone());

    let mut signed = b"BLCKDIFF".to_vec();
    signed.extend_from_slice(patch);
    let _ = engine::apply_update(old, &signed, config);
});
