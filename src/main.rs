use std::sync::Arc;

use tessera::runtime::manager::HostDevice;
use tessera::{Access, HostBuffer, RuntimeConfig, RuntimeManager, SchedulableTask, TaskSchedule, Value};

fn main() -> tessera::Result<()> {
    tessera::init_logging();

    // Optional JSON config as the first argument, then environment overrides.
    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();

    let devices: Vec<Arc<HostDevice>> = (0..2).map(|i| HostDevice::new(format!("host-{i}"))).collect();
    for device in &devices {
        device.register_kernel("saxpy", |frame| {
            let a = frame.scalar(0)?.as_f64().unwrap_or_default() as f32;
            let x = frame.f32s(1)?;
            let y: Vec<f32> = frame.f32s(2)?.iter().zip(&x).map(|(y, x)| a * x + y).collect();
            frame.set_f32s(2, &y)
        });
    }
    let runtime = RuntimeManager::with_host_devices(devices, config);

    let x = HostBuffer::from_f32("x", &[1.0, 2.0, 3.0, 4.0]);
    let y = HostBuffer::from_f32("y", &[0.0; 4]);
    let z = HostBuffer::from_f32("z", &[0.0; 4]);

    let mut schedule = TaskSchedule::new("demo", runtime);
    schedule
        .task(SchedulableTask::prebuilt(
            "scale-x",
            "saxpy",
            "",
            vec![Value::from(2.0f32), Value::object(&x), Value::object(&y)],
            vec![Access::Read, Access::Read, Access::ReadWrite],
        ))
        .task(SchedulableTask::prebuilt(
            "accumulate",
            "saxpy",
            "",
            vec![Value::from(0.5f32), Value::object(&y), Value::object(&z)],
            vec![Access::Read, Access::Read, Access::ReadWrite],
        ))
        .stream_out(&[&z]);

    for _ in 0..3 {
        let stats = schedule.execute()?;
        println!(
            "run {}: z = {:?} ({} launches, {} transfers)",
            stats.invocations,
            z.to_f32_vec(),
            stats.launches,
            stats.transfers
        );
    }
    println!("{}", schedule.dump());
    Ok(())
}
