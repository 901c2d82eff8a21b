use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bkp::encoder::{Encoder, ZlibEncoder};
use bkp::hash::{Digester, Md5Generator};

fn bench_chunk_pipeline(c: &mut Criterion) {
    // One backup read window of mixed-entropy data.
    let data: Vec<u8> = (0..bkp::CHUNK_SIZE).map(|i| (i * 31 % 251) as u8).collect();
    let digester = Md5Generator;
    let encoder = ZlibEncoder;

    c.bench_function("md5_digest_64k", |b| b.iter(|| digester.digest(black_box(&data))));
    c.bench_function("zlib_encode_64k", |b| b.iter(|| encoder.encode(black_box(&data))));

    let compressed = encoder.encode(&data).unwrap();
    c.bench_function("zlib_decode_64k", |b| {
        b.iter(|| encoder.decode(black_box(&compressed), data.len()))
    });
}

criterion_group!(benches, bench_chunk_pipeline);
criterion_main!(benches);
