//! Benchmarks for the SIO codec
//!
//! The status decoder runs once per bulk-IN packet and the divisor search
//! runs on every baud rate change, so both sit on hot paths.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{ChipType, baudrate_divisor, parse_modem_status};

fn benchmark_baudrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("baudrate_divisor");

    for baud in [300u32, 9600, 115_200, 921_600, 3_000_000] {
        group.bench_with_input(BenchmarkId::new("ft4232h", baud), &baud, |b, &baud| {
            b.iter(|| baudrate_divisor(black_box(baud), ChipType::Variant4232H))
        });
    }

    group.finish();
}

fn benchmark_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("modem_status");

    // One full-speed packet worth of status headers
    let packets: Vec<[u8; 2]> = (0..64u8).map(|i| [i, i.wrapping_mul(16)]).collect();
    group.throughput(Throughput::Elements(packets.len() as u64));
    group.bench_function("parse_64", |b| {
        b.iter(|| {
            for status in &packets {
                black_box(parse_modem_status(black_box(*status)));
            }
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_baudrate, benchmark_status);
criterion_main!(benches);
