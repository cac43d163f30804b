//! Throughput benchmarks

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

use kamstrup_core::core::protocol::checksum::crc16;
use kamstrup_core::core::protocol::framing::{escape, unescape, FrameAccumulator};
use kamstrup_core::core::protocol::kamstrup::{build_read_request, parse_read_response};
use kamstrup_core::{ReadResponse, RegisterId, UnitCode};

fn crc_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("crc");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("crc16", |b| b.iter(|| black_box(crc16(black_box(&data)))));

    group.bench_function("escape_unescape", |b| {
        b.iter(|| {
            let escaped = escape(black_box(&data));
            black_box(unescape(&escaped))
        })
    });

    group.finish();
}

fn frame_benchmark(c: &mut Criterion) {
    let register = RegisterId(0x041e);
    let frame = ReadResponse::new(register, UnitCode(0), 2301, -1, false).to_frame();

    let mut group = c.benchmark_group("frame");

    group.bench_function("build_request", |b| {
        b.iter(|| black_box(build_read_request(black_box(register))))
    });

    group.bench_function("receive_and_decode", |b| {
        b.iter(|| {
            let mut acc = FrameAccumulator::new();
            let mut value = None;
            for &byte in black_box(&frame) {
                if let Ok(Some(raw)) = acc.push(byte) {
                    value = parse_read_response(&raw, register).ok().map(|r| r.value());
                }
            }
            black_box(value)
        })
    });

    group.finish();
}

criterion_group!(benches, crc_benchmark, frame_benchmark);
criterion_main!(benches);
