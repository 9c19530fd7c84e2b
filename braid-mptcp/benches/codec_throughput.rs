//! Codec and reassembly hot-path benchmarks.

use braid_core::segment::Segment;
use braid_mptcp::codec::{decode_options, dss_checksum, encode_options, Dss, DssMapping, MptcpOption};
use braid_mptcp::reassembly::MetaReceiver;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_dss_roundtrip(c: &mut Criterion) {
    let opt = MptcpOption::Dss(Dss {
        data_ack: Some(0x1000_0000),
        mapping: Some(DssMapping {
            data_seq: 0x2000_0000,
            sub_seq: 512,
            data_len: 1400,
            checksum: Some(0xbeef),
        }),
        data_fin: false,
    });

    c.bench_function("dss_encode", |b| {
        b.iter(|| encode_options(black_box(std::slice::from_ref(&opt))))
    });

    let wire = encode_options(std::slice::from_ref(&opt));
    c.bench_function("dss_decode", |b| {
        b.iter(|| decode_options(black_box(&wire)))
    });
}

fn bench_checksum(c: &mut Criterion) {
    let payload = vec![0xa5u8; 1400];
    c.bench_function("dss_checksum_1400", |b| {
        b.iter(|| dss_checksum(black_box(1), black_box(2), 1400, black_box(&payload)))
    });
}

fn bench_reassembly_in_order(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 1400]);
    c.bench_function("reassembly_ingest_1400", |b| {
        b.iter_with_setup(
            || MetaReceiver::new(0, 1 << 24),
            |mut rx| {
                let mut dsn = 0u32;
                for _ in 0..64 {
                    let mut seg = Segment::new(payload.clone());
                    seg.data_seq = dsn;
                    dsn = dsn.wrapping_add(1400);
                    seg.end_data_seq = dsn;
                    black_box(rx.ingest(seg));
                }
            },
        )
    });
}

criterion_group!(
    benches,
    bench_dss_roundtrip,
    bench_checksum,
    bench_reassembly_in_order
);
criterion_main!(benches);
