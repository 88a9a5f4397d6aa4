//! Fuzz target: guest metadata document decoding.
//!
//! Decodes arbitrary JSON as the runner document the guest reads at boot
//! and wraps the raw object the way the host publishes it.

#![no_main]

use firepool_core::RunnerMetadata;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(metadata) = serde_json::from_slice::<RunnerMetadata>(data) {
        if metadata.missing_field().is_none() {
            assert!(!metadata.runner_token.is_empty());
        }
        let json = serde_json::to_vec(&metadata).expect("re-encode must not fail");
        let again: RunnerMetadata = serde_json::from_slice(&json).expect("re-decode must not fail");
        assert_eq!(again, metadata);
    }

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(data) {
        let document = firepool_executor::mmds::build_document(&map);
        assert!(document.get("latest").is_some());
    }
});
