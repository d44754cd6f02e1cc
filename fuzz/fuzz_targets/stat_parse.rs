#![no_main]

use libfuzzer_sys::fuzz_target;

use confship::remote::parse_stat_output;

fuzz_target!(|data: &str| {
    let _ = parse_stat_output(data);
});
