#![no_main]

use libfuzzer_sys::fuzz_target;

use confship::header::split_content;

fuzz_target!(|data: &[u8]| {
    // Extraction must never panic, whatever the blob contains.
    let _ = split_content("fuzz/input", data);
});
