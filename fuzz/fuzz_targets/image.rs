#![no_main]

use libfuzzer_sys::fuzz_target;
use pescope::{rebuild::RebuildConfig, Image};

fuzz_target!(|data: &[u8]| {
    if let Ok(mut image) = Image::from_mem(data.to_vec()) {
        let _ = image.validate();
        let _ = image.rebuild(&RebuildConfig::default());
    }
});
