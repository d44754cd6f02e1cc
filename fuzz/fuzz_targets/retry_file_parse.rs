#![no_main]

use libfuzzer_sys::fuzz_target;

use confship_retry::RetryFile;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = RetryFile::parse(data) {
        // Anything that parses must render and parse back identically.
        let rendered = parsed.render();
        let reparsed = RetryFile::parse(&rendered).expect("render output parses");
        assert_eq!(parsed, reparsed);
    }
});
