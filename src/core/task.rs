use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::device::DeviceId;
use crate::core::value::Value;

/// How a task touches one of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    Unknown,
}

impl Access {
    /// Unknown accesses are treated as writes.
    pub fn writes(self) -> bool {
        !matches!(self, Access::Read)
    }

    pub fn reads(self) -> bool {
        !matches!(self, Access::Write)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Compiled from a method; accesses come from the method's sketch.
    Compilable { method: String },
    /// Shipped as device code; accesses are declared up front.
    Prebuilt {
        entry_point: String,
        source: String,
        accesses: Vec<Access>,
    },
}

/// One schedulable invocation: what to run, with which arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulableTask {
    id: String,
    kind: TaskKind,
    args: Vec<Value>,
    device: Option<DeviceId>,
}

impl SchedulableTask {
    pub fn compilable(id: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Compilable {
                method: method.into(),
            },
            args,
            device: None,
        }
    }

    pub fn prebuilt(
        id: impl Into<String>,
        entry_point: impl Into<String>,
        source: impl Into<String>,
        args: Vec<Value>,
        accesses: Vec<Access>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Prebuilt {
                entry_point: entry_point.into(),
                source: source.into(),
                accesses,
            },
            args,
            device: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Pins the task to a device; per-task config overrides still win.
    pub fn map_to(&mut self, device: DeviceId) {
        self.device = Some(device);
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.map_to(device);
        self
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Identifies the device code this task needs: the method for compilable
    /// tasks, the entry point for prebuilt ones.
    pub fn code_key(&self) -> &str {
        match &self.kind {
            TaskKind::Compilable { method } => method,
            TaskKind::Prebuilt { entry_point, .. } => entry_point,
        }
    }

    pub fn declared_accesses(&self) -> Option<&[Access]> {
        match &self.kind {
            TaskKind::Compilable { .. } => None,
            TaskKind::Prebuilt { accesses, .. } => Some(accesses),
        }
    }
}

impl fmt::Display for SchedulableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({} args)", self.id, self.code_key(), self.args.len())
    }
}
