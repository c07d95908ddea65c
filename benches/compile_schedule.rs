use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tessera::runtime::manager::{Device, DeviceRegistry, HostDevice};
use tessera::{
    Access, ExecutionContext, GraphBuilder, GraphCompiler, HostBuffer, InvocationRecorder, RuntimeConfig, RuntimeManager,
    SchedulableTask, SketchRegistry, TaskSchedule, Value,
};

/// A chain of `tasks` invocations over a ring of buffers: task i reads
/// buffer i and writes buffer i + 1.
fn record_chain(tasks: usize) -> (ExecutionContext, InvocationRecorder) {
    let buffers: Vec<_> = (0..8).map(|i| HostBuffer::zeroed(format!("b{i}"), 1024)).collect();
    let mut ctx = ExecutionContext::new("bench");
    let mut recorder = InvocationRecorder::new();
    for i in 0..tasks {
        let src = &buffers[i % buffers.len()];
        let dst = &buffers[(i + 1) % buffers.len()];
        let task = SchedulableTask::prebuilt(
            format!("t{i}"),
            "step",
            "",
            vec![Value::object(src), Value::object(dst), Value::from(i as i32)],
            vec![Access::Read, Access::ReadWrite, Access::Read],
        );
        recorder.record(&mut ctx, task);
    }
    (ctx, recorder)
}

fn bench_compile(c: &mut Criterion) {
    let config = RuntimeConfig::default();
    let sketches = SketchRegistry::new();
    let mut registry = DeviceRegistry::new();
    registry.add_driver("host", vec![HostDevice::new("host-0") as Arc<dyn Device>]);

    let mut group = c.benchmark_group("compile_schedule");
    for tasks in [16usize, 128, 1024] {
        let (mut ctx, recorder) = record_chain(tasks);
        ctx.assign_to_devices(&registry, &config).unwrap();

        group.bench_with_input(BenchmarkId::new("build_graph", tasks), &tasks, |bencher, _| {
            bencher.iter(|| {
                GraphBuilder::new(&ctx, &sketches, &config)
                    .build(black_box(recorder.bytes()))
                    .unwrap()
            });
        });

        let graph = GraphBuilder::new(&ctx, &sketches, &config).build(recorder.bytes()).unwrap();
        group.bench_with_input(BenchmarkId::new("compile", tasks), &tasks, |bencher, _| {
            bencher.iter(|| GraphCompiler::new(&config).compile(black_box(&graph), &ctx).unwrap());
        });
    }
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let device = HostDevice::new("host-0");
    device.register_kernel("step", |frame| {
        let src = frame.f32s(0)?;
        let dst: Vec<f32> = frame.f32s(1)?.iter().zip(&src).map(|(d, s)| d + s).collect();
        frame.set_f32s(1, &dst)
    });
    let runtime = RuntimeManager::with_host_devices(vec![device], RuntimeConfig::default());

    let buffers: Vec<_> = (0..8).map(|i| HostBuffer::from_f32(format!("b{i}"), &[1.0; 256])).collect();
    let mut schedule = TaskSchedule::new("bench", runtime);
    for i in 0..64 {
        schedule.task(SchedulableTask::prebuilt(
            format!("t{i}"),
            "step",
            "",
            vec![Value::object(&buffers[i % 8]), Value::object(&buffers[(i + 1) % 8])],
            vec![Access::Read, Access::ReadWrite],
        ));
    }
    schedule.warmup().unwrap();

    c.bench_function("execute_host_64", |bencher| {
        bencher.iter(|| schedule.execute().unwrap());
    });
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
