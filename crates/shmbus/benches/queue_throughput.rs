use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shmbus::{OpenMode, SharedCircularQueue};

fn bench_name(tag: &str) -> String {
    format!("/shmbus_qbench_{tag}_{}", std::process::id())
}

fn benchmark_queue_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_cycle");

    let sizes = [(16, "16B"), (256, "256B"), (4096, "4KB")];

    for (size, label) in sizes.iter() {
        let name = bench_name(label);
        let queue = SharedCircularQueue::create(&name, *size, 64, OpenMode::ReadWrite).unwrap();
        let data = vec![7u8; *size];

        group.bench_with_input(BenchmarkId::new("write_read", label), size, |b, _| {
            b.iter(|| {
                assert!(queue.try_write(black_box(&data)).unwrap());
                let element = queue.try_read().unwrap();
                black_box(element);
            });
        });

        SharedCircularQueue::unlink(&name).unwrap();
    }

    group.finish();
}

fn benchmark_queue_len(c: &mut Criterion) {
    let name = bench_name("len");
    let queue = SharedCircularQueue::create(&name, 64, 64, OpenMode::ReadWrite).unwrap();
    queue.try_write(&[1u8; 32]).unwrap();

    c.bench_function("queue_len", |b| {
        b.iter(|| {
            let len = queue.len();
            black_box(len);
        });
    });

    SharedCircularQueue::unlink(&name).unwrap();
}

criterion_group!(benches, benchmark_queue_cycle, benchmark_queue_len);
criterion_main!(benches);
