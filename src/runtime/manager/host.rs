//! In-process reference device.
//!
//! Buffers are plain byte vectors, kernels are Rust closures registered by
//! name, and every operation completes at once. Each call is appended to an
//! operation log so tests can assert on exactly what the VM issued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BufferId, Device, Event, KernelArg, KernelId};
use crate::core::device::BackendType;
use crate::core::task::SchedulableTask;
use crate::core::value::Primitive;
use crate::error::{Error, Result};

pub type HostKernel = Arc<dyn Fn(&mut KernelFrame) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum HostArg {
    Buffer(Vec<u8>),
    Scalar(Primitive),
}

/// Arguments of one kernel invocation on the host device.
#[derive(Debug)]
pub struct KernelFrame {
    args: Vec<HostArg>,
}

impl KernelFrame {
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn scalar(&self, index: usize) -> Result<Primitive> {
        match self.args.get(index) {
            Some(HostArg::Scalar(p)) => Ok(*p),
            _ => Err(Error::execution(format!("argument {index} is not a scalar"))),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.args.get(index) {
            Some(HostArg::Buffer(b)) => Ok(b),
            _ => Err(Error::execution(format!("argument {index} is not a buffer"))),
        }
    }

    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut Vec<u8>> {
        match self.args.get_mut(index) {
            Some(HostArg::Buffer(b)) => Ok(b),
            _ => Err(Error::execution(format!("argument {index} is not a buffer"))),
        }
    }

    pub fn f32s(&self, index: usize) -> Result<Vec<f32>> {
        Ok(self
            .bytes(index)?
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn set_f32s(&mut self, index: usize, values: &[f32]) -> Result<()> {
        self.store(index, bytemuck::cast_slice(values))
    }

    pub fn i32s(&self, index: usize) -> Result<Vec<i32>> {
        Ok(self
            .bytes(index)?
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn set_i32s(&mut self, index: usize, values: &[i32]) -> Result<()> {
        self.store(index, bytemuck::cast_slice(values))
    }

    fn store(&mut self, index: usize, src: &[u8]) -> Result<()> {
        let out = self.bytes_mut(index)?;
        if src.len() != out.len() {
            return Err(Error::execution(format!(
                "argument {index} holds {} bytes, kernel wrote {}",
                out.len(),
                src.len()
            )));
        }
        out.copy_from_slice(src);
        Ok(())
    }
}

/// One entry of the host device's operation log.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    Install { code: String, kernel: KernelId },
    Allocate { buffer: BufferId, bytes: usize },
    Write { buffer: BufferId, bytes: usize, wait: Vec<Event> },
    Read { buffer: BufferId, bytes: usize, blocking: bool, wait: Vec<Event> },
    Launch { code: String, args: usize, wait: Vec<Event> },
    Barrier { wait: Vec<Event> },
}

#[derive(Default)]
struct HostState {
    loaded: bool,
    buffers: HashMap<BufferId, Vec<u8>>,
    kernels: HashMap<String, HostKernel>,
    installed: HashMap<KernelId, String>,
    next_buffer: u64,
    next_kernel: u64,
    next_event: u64,
    log: Vec<DeviceOp>,
}

impl HostState {
    fn event(&mut self) -> Event {
        let e = Event(self.next_event);
        self.next_event += 1;
        e
    }
}

pub struct HostDevice {
    name: String,
    state: Mutex<HostState>,
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HostDevice")
            .field("name", &self.name)
            .field("buffers", &state.buffers.len())
            .field("kernels", &state.kernels.len())
            .finish()
    }
}

impl HostDevice {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(HostState::default()),
        })
    }

    /// Makes `code` launchable; tasks whose code key matches run `kernel`.
    pub fn register_kernel<F>(&self, code: impl Into<String>, kernel: F)
    where
        F: Fn(&mut KernelFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.state.lock().kernels.insert(code.into(), Arc::new(kernel));
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.state.lock().log.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().log.clear();
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    fn check_events(&self, state: &HostState, wait: &[Event]) -> Result<()> {
        match wait.iter().find(|e| e.0 >= state.next_event) {
            Some(e) => Err(Error::device(&self.name, format!("wait on unknown event {}", e.0))),
            None => Ok(()),
        }
    }

    fn missing(&self, buffer: BufferId) -> Error {
        Error::device(&self.name, format!("unknown buffer {}", buffer.0))
    }
}

impl Device for HostDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn backend(&self) -> BackendType {
        BackendType::Host
    }

    fn ensure_loaded(&self) -> Result<()> {
        self.state.lock().loaded = true;
        Ok(())
    }

    fn install_code(&self, task: &SchedulableTask) -> Result<KernelId> {
        let mut state = self.state.lock();
        let code = task.code_key().to_string();
        if !state.kernels.contains_key(&code) {
            return Err(Error::device(&self.name, format!("no kernel registered for `{code}`")));
        }
        let kernel = KernelId(state.next_kernel);
        state.next_kernel += 1;
        state.installed.insert(kernel, code.clone());
        state.log.push(DeviceOp::Install { code, kernel });
        Ok(kernel)
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let mut state = self.state.lock();
        let buffer = BufferId(state.next_buffer);
        state.next_buffer += 1;
        state.buffers.insert(buffer, vec![0; bytes]);
        state.log.push(DeviceOp::Allocate { buffer, bytes });
        Ok(buffer)
    }

    fn write(&self, buffer: BufferId, data: &[u8], wait: &[Event]) -> Result<Event> {
        let mut state = self.state.lock();
        self.check_events(&state, wait)?;
        let dst = state.buffers.get_mut(&buffer).ok_or_else(|| self.missing(buffer))?;
        dst.clear();
        dst.extend_from_slice(data);
        state.log.push(DeviceOp::Write {
            buffer,
            bytes: data.len(),
            wait: wait.to_vec(),
        });
        Ok(state.event())
    }

    fn read(&self, buffer: BufferId, out: &mut [u8], wait: &[Event], blocking: bool) -> Result<Event> {
        let mut state = self.state.lock();
        self.check_events(&state, wait)?;
        let src = state.buffers.get(&buffer).ok_or_else(|| self.missing(buffer))?;
        if src.len() != out.len() {
            return Err(Error::device(
                &self.name,
                format!("read of {} bytes from a {} byte buffer", out.len(), src.len()),
            ));
        }
        out.copy_from_slice(src);
        state.log.push(DeviceOp::Read {
            buffer,
            bytes: out.len(),
            blocking,
            wait: wait.to_vec(),
        });
        Ok(state.event())
    }

    fn launch(&self, kernel: KernelId, args: &[KernelArg], wait: &[Event]) -> Result<Event> {
        let (code, func, mut frame) = {
            let mut state = self.state.lock();
            self.check_events(&state, wait)?;
            let code = state
                .installed
                .get(&kernel)
                .cloned()
                .ok_or_else(|| Error::device(&self.name, format!("kernel {} not installed", kernel.0)))?;
            let func = state
                .kernels
                .get(&code)
                .cloned()
                .ok_or_else(|| Error::device(&self.name, format!("no kernel registered for `{code}`")))?;
            let mut host_args = Vec::with_capacity(args.len());
            for arg in args {
                host_args.push(match arg {
                    KernelArg::Scalar(p) => HostArg::Scalar(*p),
                    KernelArg::Buffer(b) => {
                        HostArg::Buffer(state.buffers.get(b).cloned().ok_or_else(|| self.missing(*b))?)
                    }
                });
            }
            (code, func, KernelFrame { args: host_args })
        };

        func(&mut frame)?;

        let mut state = self.state.lock();
        for (arg, value) in args.iter().zip(frame.args) {
            if let (KernelArg::Buffer(b), HostArg::Buffer(bytes)) = (arg, value) {
                state.buffers.insert(*b, bytes);
            }
        }
        state.log.push(DeviceOp::Launch {
            code,
            args: args.len(),
            wait: wait.to_vec(),
        });
        Ok(state.event())
    }

    fn barrier(&self, wait: &[Event]) -> Result<Event> {
        let mut state = self.state.lock();
        self.check_events(&state, wait)?;
        state.log.push(DeviceOp::Barrier { wait: wait.to_vec() });
        Ok(state.event())
    }

    fn resolve(&self, event: Event) -> Result<()> {
        let state = self.state.lock();
        self.check_events(&state, &[event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Access;
    use crate::core::value::Value;

    #[test]
    fn launch_runs_registered_kernel() {
        let device = HostDevice::new("host");
        device.register_kernel("double", |frame| {
            let v: Vec<f32> = frame.f32s(0)?.iter().map(|x| x * 2.0).collect();
            frame.set_f32s(0, &v)
        });
        let task = SchedulableTask::prebuilt("t", "double", "", vec![Value::from(0i32)], vec![Access::ReadWrite]);
        let kernel = device.install_code(&task).unwrap();

        let buffer = device.allocate(8).unwrap();
        let data: &[u8] = bytemuck::cast_slice(&[1.0f32, 3.0]);
        let e = device.write(buffer, data, &[]).unwrap();
        let e = device.launch(kernel, &[KernelArg::Buffer(buffer)], &[e]).unwrap();

        let mut out = vec![0u8; 8];
        device.read(buffer, &mut out, &[e], true).unwrap();
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![2.0, 6.0]);
        assert!(matches!(device.ops().last(), Some(DeviceOp::Read { blocking: true, .. })));
    }

    #[test]
    fn unknown_kernel_and_events_are_errors() {
        let device = HostDevice::new("host");
        let task = SchedulableTask::compilable("t", "missing", vec![]);
        assert!(matches!(device.install_code(&task), Err(Error::Device { .. })));
        assert!(device.resolve(Event(7)).is_err());
    }
}
