#![no_main]

use libfuzzer_sys::fuzz_target;

use confship_output_sanitizer::{has_line_breaks, sanitize_line};

fuzz_target!(|data: &str| {
    let sanitized = sanitize_line(data);
    assert!(!has_line_breaks(&sanitized));
    // Idempotence: sanitizing clean input changes nothing.
    assert_eq!(sanitize_line(&sanitized), sanitized);
});
