//! Fuzz target: TOML configuration parsing and validation.
//!
//! Arbitrary text goes through environment expansion, parsing, and
//! validation. Errors are expected; panics are not.

#![no_main]

use firepool_core::config::expand_env;
use firepool_core::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let expanded = expand_env(text, |_| None);
    assert!(expanded.len() <= text.len(), "empty expansion must not grow the input");

    if let Ok(config) = Config::parse(text) {
        let _ = config.validate();
        for pool in &config.pools {
            let _ = config.kernel_path_for(pool);
        }
    }
});
