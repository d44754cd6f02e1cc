#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;

use confship::inventory::Inventory;

fuzz_target!(|data: &str| {
    let _ = Inventory::parse(Path::new("fuzz/inventory"), data);
});
