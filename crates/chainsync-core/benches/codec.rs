use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chainsync_core::chain::{ChainRecord, ChainScanner, FieldWrite};
use chainsync_core::codec::{read_inv_u64, write_inv_u64};

fn bench_codec(c: &mut Criterion) {
    c.bench_function("inv_u64_roundtrip", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(16);
            for v in [0u64, 300, 1 << 20, 1 << 42, u64::MAX] {
                buf.clear();
                write_inv_u64(black_box(v), &mut buf);
                let mut idx = 0;
                black_box(read_inv_u64(&buf, &mut idx).unwrap());
            }
        })
    });
}

fn bench_scan(c: &mut Criterion) {
    let mut stream = Vec::new();
    for k in 0..1_000u64 {
        ChainRecord::SetFields {
            definition_id: 1 + (k % 8),
            fields: vec![FieldWrite {
                field_id: 1 + (k % 16),
                value: vec![0xAB; 64],
            }],
        }
        .encode(&mut stream);
    }

    c.bench_function("scan_1k_records", |b| {
        b.iter(|| {
            let mut scanner = ChainScanner::new();
            let records = scanner.feed(black_box(&stream)).unwrap();
            assert_eq!(records.len(), 1_000);
        })
    });
}

criterion_group!(benches, bench_codec, bench_scan);
criterion_main!(benches);
