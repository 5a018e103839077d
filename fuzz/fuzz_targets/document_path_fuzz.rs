//! Fuzz test for dotted-path document access
//!
//! Splits the input into a path and a JSON value, then drives put, get,
//! contains and remove. None of them may panic, and a successful put must
//! be readable at the same path.
//!
//! Run with: cargo +nightly fuzz run document_path_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use stratum_core::Document;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (path, raw) = input.split_once('\n').unwrap_or((input, "null"));
    let value: Value = serde_json::from_str(raw).unwrap_or(Value::Null);

    let mut doc = Document::new();
    if doc.put(path, value.clone()).is_ok() {
        assert_eq!(doc.get(path), Some(&value), "put value must read back");
        assert!(doc.contains(path));
        assert_eq!(doc.remove(path), Some(value));
    }
    let _ = doc.fields();
});
