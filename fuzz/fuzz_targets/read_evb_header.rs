#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = emblem_core::format::EvbHeader::from_bytes(data);
});
