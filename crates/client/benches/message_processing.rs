//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the per-request hot paths:
//! - Passthrough envelope encryption and decryption
//! - KLAP seal/open under the running sequence
//! - Discovery frame encoding and CRC validation

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tapo_protocol::klap::auth_hash;
use tapo_protocol::{DiscoveryFrame, KlapCipher, PacketType, PassthroughCipher, TapoRequest};

fn sample_request(padding: usize) -> String {
    TapoRequest::set_device_info(json!({ "nickname": "x".repeat(padding), "device_on": true }))
        .with_request_id(1_234_567)
        .with_request_time_millis(1_700_000_000_000)
        .to_json()
        .unwrap_or_default()
}

/// Benchmark passthrough encryption as done for every request.
fn bench_passthrough_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("passthrough_cipher");
    let cipher = PassthroughCipher::new([7u8; 16], [9u8; 16]);

    for (name, padding) in [("small", 16), ("medium", 1024), ("large", 16 * 1024)] {
        let request = sample_request(padding);
        let encrypted = cipher.encrypt(&request).unwrap_or_default();
        group.throughput(Throughput::Bytes(request.len() as u64));

        group.bench_function(format!("encrypt_{}", name), |b| {
            b.iter(|| cipher.encrypt(black_box(&request)))
        });
        group.bench_function(format!("decrypt_{}", name), |b| {
            b.iter(|| cipher.decrypt(black_box(&encrypted)))
        });
    }

    group.finish();
}

/// Benchmark KLAP payload sealing and opening.
fn bench_klap_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("klap_cipher");
    let auth = auth_hash("user@example.com", "secret");

    // Handshake key derivation
    group.bench_function("derive", |b| {
        b.iter(|| KlapCipher::new(black_box(&[1u8; 16]), black_box(&[2u8; 16]), &auth))
    });

    let request = sample_request(1024);
    group.throughput(Throughput::Bytes(request.len() as u64));

    let mut cipher = KlapCipher::new(&[1u8; 16], &[2u8; 16], &auth);
    group.bench_function("encrypt_1KB", |b| {
        b.iter(|| cipher.encrypt(black_box(request.as_bytes())))
    });

    let cipher = KlapCipher::new(&[1u8; 16], &[2u8; 16], &auth);
    let sealed = cipher.seal(42, request.as_bytes()).unwrap_or_default();
    group.bench_function("open_1KB", |b| {
        b.iter(|| cipher.open(42, black_box(&sealed)))
    });
    group.bench_function("verify_1KB", |b| {
        b.iter(|| cipher.verify(42, black_box(&sealed)))
    });

    group.finish();
}

/// Benchmark discovery frame encoding and decoding.
fn bench_discovery_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery_frame");
    let reply = json!({
        "error_code": 0,
        "result": {
            "device_type": "SMART.TAPOPLUG",
            "device_model": "P110",
            "ip": "192.168.1.40",
            "mac": "AA-BB-CC-DD-EE-FF",
            "mgt_encrypt_schm": {"is_support_https": false, "encrypt_type": "KLAP", "http_port": 80, "lv": 2}
        }
    });
    let frame = match DiscoveryFrame::from_json(PacketType::Response, &reply) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let encoded = frame.encode().unwrap_or_default();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(&frame).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| DiscoveryFrame::decode(black_box(&encoded)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_passthrough_cipher,
    bench_klap_cipher,
    bench_discovery_frame,
);

criterion_main!(benches);
