//! Fuzz target: OCI chain id computation.
//!
//! Splits arbitrary input into diff ids and checks that the chain id is
//! the first diff id for one layer and a `sha256:` digest for more.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let diff_ids: Vec<&str> = text.split('\n').collect();

    let Some(chain) = firepool_executor::image::chain_id(&diff_ids) else {
        panic!("non-empty input must yield a chain id");
    };
    if diff_ids.len() == 1 {
        assert_eq!(chain, diff_ids[0]);
    } else {
        assert_eq!(chain.len(), "sha256:".len() + 64);
        assert!(chain.starts_with("sha256:"));
    }
});
