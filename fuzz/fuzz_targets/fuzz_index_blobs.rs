#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = quiver::index::IvfModel::from_bytes(data);
    let _ = quiver::index::ProductQuantizer::from_bytes(data);
});
