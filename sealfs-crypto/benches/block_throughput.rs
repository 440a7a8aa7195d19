use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sealfs_crypto::{BlockPosition, decrypt_block, encrypt_block, generate_file_key};

fn benchmark_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("block");
    let key = generate_file_key(1);

    for size in [1024usize, 8192, 65536] {
        let plaintext = vec![0x5Au8; size];
        let position = BlockPosition {
            index: 42,
            generation: 7,
            is_final: false,
        };
        let sealed = encrypt_block(&plaintext, &key, position).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &plaintext, |b, p| {
            b.iter(|| encrypt_block(black_box(p), &key, position).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &sealed, |b, s| {
            b.iter(|| decrypt_block(black_box(s), &key).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_blocks);
criterion_main!(benches);
