//! Benchmarks for the frame path hot spots
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use frame_coordinator::arbiter::ResourceArbiter;
use frame_coordinator::buffer::{BufferPool, BufferSpec, HeapAllocator, ImageFormat};
use frame_coordinator::capture::{CaptureSource, SyntheticCaptureSource};
use frame_coordinator::scenario::{FeatureFlags, PolicyTable, ScenarioKind, ScenarioParam};
use frame_coordinator::task_queue::{TaskQueue, TaskQueueConfig};
use frame_coordinator::{CoordinatorConfig, FrameCoordinator, SensorId, SensorPathStateMachine};
use std::sync::Arc;
use std::time::Duration;

fn bench_pool_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");

    for (width, height) in [(640u32, 480u32), (1920, 1080), (4000, 3000)] {
        let spec = BufferSpec::new("bench", ImageFormat::Raw10, width, height);
        let pool = BufferPool::new(spec, 4, Arc::new(HeapAllocator::new())).unwrap();
        // Warm the pool so the benchmark measures reuse, not allocation.
        drop(pool.acquire().unwrap());

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("acquire_release", format!("{}x{}", width, height)),
            &pool,
            |b, pool| {
                b.iter(|| {
                    let buffer = pool.acquire().unwrap();
                    black_box(buffer.len());
                })
            },
        );
    }

    group.finish();
}

fn bench_state_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("sensor_path");
    let machine = SensorPathStateMachine::new(&SensorId::ALL, SensorId::Wide, 2).unwrap();

    group.bench_function("need_enque_active", |b| {
        b.iter(|| black_box(machine.need_enque(SensorId::Wide, false)))
    });

    group.bench_function("switch_round_trip", |b| {
        b.iter(|| {
            black_box(machine.switch_to(SensorId::Tele));
            black_box(machine.switch_to(SensorId::Wide));
        })
    });

    group.finish();
}

fn bench_arbiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbiter");
    let arbiter = ResourceArbiter::create("bench", Duration::from_millis(100));

    group.bench_function("uncontended_lease", |b| {
        b.iter(|| {
            let lease = arbiter.lease().unwrap();
            black_box(lease.client());
        })
    });

    group.finish();
}

fn bench_policy_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy");
    let table = PolicyTable::default();
    let params: Vec<ScenarioParam> = ScenarioKind::ALL
        .iter()
        .map(|&kind| {
            ScenarioParam::new(kind, 4000, 3000, 30)
                .with_features(FeatureFlags::ADV_EIS)
                .with_bandwidth_control(true)
        })
        .collect();

    group.throughput(Throughput::Elements(params.len() as u64));
    group.bench_function("directive_for_all_kinds", |b| {
        b.iter(|| {
            for param in &params {
                black_box(table.directive_for(param));
            }
        })
    });

    group.finish();
}

fn bench_task_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");

    for workers in [1usize, 2, 4] {
        let queue = TaskQueue::new(
            "bench",
            TaskQueueConfig {
                max_workers: workers,
                idle_wait: Duration::from_millis(10),
                max_pending: None,
            },
        );

        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::new("submit_100", workers), &queue, |b, queue| {
            b.iter(|| {
                for i in 0..100u64 {
                    queue.submit(move || {
                        black_box(i.wrapping_mul(31));
                    })
                    .unwrap();
                }
                queue.wait_idle(Duration::from_secs(5));
            })
        });
    }

    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");
    group.sample_size(20);

    let mut config = CoordinatorConfig::default();
    config.pipeline.output_width = 640;
    config.pipeline.output_height = 480;
    config.pipeline.output_buffers = 32;
    config.pipeline.node_idle_wait_ms = 5;

    let coordinator = FrameCoordinator::builder(config).build().unwrap();
    coordinator.start().unwrap();
    let spec = BufferSpec::new("sensor", ImageFormat::Raw10, 640, 480);
    let pool = BufferPool::new(spec, 32, Arc::new(HeapAllocator::new())).unwrap();
    let results = coordinator.results();

    group.throughput(Throughput::Elements(16));
    group.bench_function("frames_16", |b| {
        b.iter(|| {
            let mut source =
                SyntheticCaptureSource::new(Arc::clone(&pool), SensorId::Wide, 30).with_limit(16);
            while let Some(frame) = source.next_frame().unwrap() {
                coordinator.submit_frame(frame).unwrap();
            }
            for _ in 0..16 {
                black_box(results.recv_timeout(Duration::from_secs(5)).unwrap());
            }
            coordinator.wait_idle(Duration::from_secs(5));
        })
    });

    group.finish();
    coordinator.shutdown().unwrap();
}

criterion_group!(
    benches,
    bench_pool_acquire_release,
    bench_state_machine,
    bench_arbiter,
    bench_policy_lookup,
    bench_task_queue,
    bench_end_to_end
);
criterion_main!(benches);
