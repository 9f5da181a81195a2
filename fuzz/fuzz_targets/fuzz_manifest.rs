#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = quiver::dataset::DatasetManifest::from_bytes(data);
    let _ = quiver::index::SegmentMetadata::from_bytes(data);
});
