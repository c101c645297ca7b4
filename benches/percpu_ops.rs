use std::alloc::Layout;
use std::ptr::NonNull;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use percpu_slab::{percpu, PerCpuSlab, Shift};

const NUM_CLASSES: usize = 4;
const CAP: u16 = 64;

fn region_alloc(size: usize, align: usize) -> *mut u8 {
    unsafe { std::alloc::alloc_zeroed(Layout::from_size_align(size, align).unwrap()) }
}

fn ready_slab() -> &'static PerCpuSlab<NUM_CLASSES> {
    let slab: &'static PerCpuSlab<NUM_CLASSES> = Box::leak(Box::new(PerCpuSlab::new()));
    slab.init(region_alloc, |_| CAP, Shift(18));
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, |_| CAP);
    slab.grow(cpu, 0, CAP, |_| CAP);
    slab
}

fn bench_cpu_id(c: &mut Criterion) {
    let slab = ready_slab();
    let mut group = c.benchmark_group("cpu_id");
    group.throughput(Throughput::Elements(1));
    group.bench_function("current_cpu", |b| b.iter(|| black_box(slab.current_cpu())));
    group.finish();
}

fn bench_push_pop(c: &mut Criterion) {
    let slab = ready_slab();
    let item = NonNull::new(0x10000usize as *mut u8).unwrap();

    let mut group = c.benchmark_group("push_pop");
    group.throughput(Throughput::Elements(2));
    group.bench_function("round_trip", |b| {
        b.iter(|| unsafe {
            slab.push(0, item, percpu::noop_overflow, std::ptr::null_mut());
            black_box(slab.pop(0, percpu::noop_underflow, std::ptr::null_mut()))
        })
    });
    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    const BATCH: usize = 32;

    let slab = ready_slab();
    let items: Vec<*mut u8> = (0..BATCH).map(|i| (0x20000 + i * 8) as *mut u8).collect();
    let mut out = vec![std::ptr::null_mut(); BATCH];

    let mut group = c.benchmark_group("batches");
    group.throughput(Throughput::Elements(2 * BATCH as u64));
    group.bench_function("push_pop_batch_x32", |b| {
        b.iter(|| unsafe {
            let pushed = slab.push_batch(0, &items);
            let popped = slab.pop_batch(0, &mut out[..pushed]);
            black_box(popped)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_cpu_id, bench_push_pop, bench_batches);
criterion_main!(benches);
