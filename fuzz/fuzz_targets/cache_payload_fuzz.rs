//! Fuzz target for the shared-tier payload decoder
//!
//! Feeds arbitrary bytes through `decode_payload` and the record codec.
//!
//! Run with: cargo +nightly fuzz run cache_payload_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_core::{codec, decode_payload, encode_payload, Record, Schema, Structure};

#[derive(Debug, Clone, Default)]
struct Sample {
    id: i64,
    name: String,
    tags: Vec<String>,
    score: f64,
}

impl Structure for Sample {
    fn describe(s: &mut Schema<Self>) {
        s.numeric_id(|r| &r.id, |r| &mut r.id);
        s.field("name", |r| &r.name, |r| &mut r.name).indexed();
        s.field("tags", |r| &r.tags, |r| &mut r.tags);
        s.field("score", |r| &r.score, |r| &mut r.score);
    }
}

impl Record for Sample {
    const KIND: &'static str = "Sample";
}

fuzz_target!(|data: &[u8]| {
    // Arbitrary shared-tier bytes must decode or fail, never panic
    let Ok(properties) = decode_payload(data) else {
        return;
    };
    if let Ok(reencoded) = encode_payload(&properties) {
        let _ = decode_payload(&reencoded);
    }
    if let Ok(codec) = codec::<Sample>() {
        let _ = codec.decode(properties);
    }
});
