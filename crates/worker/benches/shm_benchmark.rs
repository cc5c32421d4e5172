//! Shared-memory channel throughput
//!
//! ```bash
//! cargo bench -p tensorbridge-worker
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tensorbridge_worker::{ShmChannel, Tensor};

fn bench_input_roundtrip(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    let channel = ShmChannel::new(dir.path(), false).expect("channel");

    let mut group = c.benchmark_group("shm_input_roundtrip");
    for elements in [1_024usize, 65_536, 1_048_576] {
        let tensor = Tensor::new("x", vec![elements], vec![0.5f32; elements]).expect("tensor");
        group.throughput(Throughput::Bytes(tensor.byte_len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(elements), &tensor, |b, tensor| {
            b.iter(|| {
                let mut scope = channel.scope();
                let descriptor = channel.encode_input(tensor, &mut scope).expect("encode");
                let decoded = channel.decode(&descriptor).expect("decode");
                black_box(decoded);
                scope.release_all()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_input_roundtrip);
criterion_main!(benches);
