//! Benchmark for `SerdeCompact` encode/decode (C1) over a realistic
//! conversation-shaped payload — the form built on every agent call and every
//! research synthesis step.
//!
//! This benchmark demonstrates that compact-form conversion overhead is
//! negligible compared to the network round trip and LLM processing time it
//! precedes.
//!
//! Run with: cargo run --release --bin payload_conversion_bench

use std::time::Instant;

use agentmesh::serde_compact::{decode, encode};
use serde_json::json;

fn conversation_payload() -> serde_json::Value {
    let mut turns = Vec::new();
    for i in 0..10 {
        turns.push(json!({
            "role": "user",
            "content": format!(
                "User message {} - this is a question or statement from the user that might be short or long depending on what they're asking about",
                i
            ),
        }));
        turns.push(json!({
            "role": "assistant",
            "content": format!(
                "Assistant response {} - this is typically longer as the assistant provides detailed answers explaining concepts with examples and context",
                i
            ),
        }));
    }
    json!({
        "system": "You are a helpful assistant.",
        "conversation": turns,
    })
}

fn main() {
    let payload = conversation_payload();
    let encoded = encode(&payload).expect("payload has no cycles or non-finite numbers");

    println!("SerdeCompact Conversion Benchmark");
    println!("==================================\n");
    println!("Encoded form size: {} bytes\n", encoded.len());

    let iterations = 100_000;

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = encode(&payload).unwrap();
    }
    let encode_duration = start.elapsed();

    println!("encode():");
    println!("  {} iterations", iterations);
    println!("  Total time: {:?}", encode_duration);
    println!(
        "  Per call: {:.2}µs",
        encode_duration.as_micros() as f64 / iterations as f64
    );

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = decode(&encoded).unwrap();
    }
    let decode_duration = start.elapsed();

    println!("\ndecode():");
    println!("  {} iterations", iterations);
    println!("  Total time: {:?}", decode_duration);
    println!(
        "  Per call: {:.2}µs",
        decode_duration.as_micros() as f64 / iterations as f64
    );

    println!("\n\nContext:");
    println!("========");
    println!("Network latency: ~100,000µs (100ms)");
    println!("LLM processing: ~1,000,000µs+ (1+ seconds)");
    println!(
        "Round-trip (encode+decode) cost: {:.2}µs",
        (encode_duration.as_micros() + decode_duration.as_micros()) as f64 / iterations as f64
    );
}
