#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = quiver::index::PostingList::from_bytes(data);
    let _ = quiver::dataset::DataFragment::from_bytes(data);
});
