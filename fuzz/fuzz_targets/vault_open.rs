#![no_main]

use libfuzzer_sys::fuzz_target;

use confship_vault::Vault;

fuzz_target!(|data: &str| {
    let _ = Vault::open_blob(data, "fuzz-passphrase");
});
