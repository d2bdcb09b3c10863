//! コーデックベンチマーク
//!
//! フレームと HPACK のエンコード/デコードを測定します。
//!
//! 使用方法:
//!   cargo bench --bench codec

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use zerocopy_h2::http2::frame::{FrameDecoder, FrameEncoder};
use zerocopy_h2::http2::hpack::{HeaderField, HpackDecoder, HpackEncoder};

fn request_headers() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":authority", "www.example.com"),
        HeaderField::new(":path", "/index.html?query=1"),
        HeaderField::new("user-agent", "Mozilla/5.0 (X11; Linux x86_64) bench/1.0"),
        HeaderField::new("accept", "text/html,application/xhtml+xml"),
        HeaderField::new("accept-encoding", "gzip, deflate, br"),
        HeaderField::new("cookie", "session=0123456789abcdef"),
    ]
}

/// DATA フレームのエンコードとデコード
fn benchmark_data_frames(c: &mut Criterion) {
    let encoder = FrameEncoder::new(16_384);
    let decoder = FrameDecoder::new(16_384);

    let mut group = c.benchmark_group("data_frame");
    for size in [64usize, 1024, 16_384] {
        let payload = vec![0xabu8; size];
        let wire = encoder.encode_data(1, &payload, false);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| encoder.encode_data(black_box(1), black_box(payload), false));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &wire, |b, wire| {
            b.iter(|| decoder.read_frame(black_box(wire)).ok());
        });
    }
    group.finish();
}

/// 制御フレームの連続デコード
fn benchmark_control_frames(c: &mut Criterion) {
    let encoder = FrameEncoder::default();
    let decoder = FrameDecoder::default();

    let mut wire = Vec::new();
    wire.extend(encoder.encode_settings(&[(0x3, 100), (0x4, 65_535)], false));
    wire.extend(encoder.encode_ping(b"01234567", false));
    wire.extend(encoder.encode_window_update(0, 65_535));
    wire.extend(encoder.encode_rst_stream(3, 0x8));

    c.bench_function("control_frames_decode", |b| {
        b.iter(|| {
            let mut pos = 0;
            while let Ok(Some((frame, used))) = decoder.read_frame(&wire[pos..]) {
                black_box(frame);
                pos += used;
            }
            pos
        });
    });
}

/// HPACK ヘッダーブロック
fn benchmark_hpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack");

    group.bench_function("encode_response", |b| {
        let mut encoder = HpackEncoder::new();
        let mut buf = vec![0u8; 16_384];
        b.iter(|| {
            let headers = vec![
                HeaderField::new("content-type", "text/html; charset=utf-8"),
                HeaderField::new("content-length", "1024"),
                HeaderField::new("server", "zerocopy-h2"),
            ];
            encoder.begin_encode(200, headers, &mut buf).ok()
        });
    });

    let block = {
        let mut encoder = HpackEncoder::new();
        let mut buf = vec![0u8; 16_384];
        let written = match encoder.begin_encode_trailers(request_headers(), &mut buf) {
            Ok((_, written)) => written,
            Err(_) => 0,
        };
        buf.truncate(written);
        buf
    };
    group.throughput(Throughput::Bytes(block.len() as u64));
    group.bench_function("decode_request", |b| {
        let mut decoder = HpackDecoder::default();
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(16);
        b.iter(|| {
            fields.clear();
            let _ = decoder.decode(black_box(&block), true, &mut fields);
            fields.len()
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_data_frames, benchmark_control_frames, benchmark_hpack);
criterion_main!(benches);
