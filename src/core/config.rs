use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// When the graph builder copies written objects back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyOutPolicy {
    /// One copy-out after every task that writes an object.
    EveryWrite,
    /// A single copy-out per stream-out object, after its last writer.
    StreamOutOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device used by tasks with no override, as `driver:device`.
    pub default_device: String,
    /// Per-task device overrides keyed by task id.
    pub task_devices: HashMap<String, String>,
    /// Allow graphs spanning several device contexts.
    pub multi_context: bool,
    pub copy_out_policy: CopyOutPolicy,
    /// Turn a trailing STREAM_OUT into a blocking one and drop the barrier.
    pub blocking_final_stream_out: bool,
    /// Pass dependency wait lists to devices. When off, ops are issued in
    /// program order without waits.
    pub use_dependencies: bool,
    /// Capacity of each VM event list.
    pub max_events: usize,
    /// Log the context table, graph and program after compiling.
    pub dump_schedule: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_device: "0:0".to_string(),
            task_devices: HashMap::new(),
            multi_context: true,
            copy_out_policy: CopyOutPolicy::EveryWrite,
            blocking_final_stream_out: false,
            use_dependencies: true,
            max_events: 32,
            dump_schedule: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Applies `TESSERA_DEFAULT_DEVICE`, `TESSERA_MULTI_CONTEXT` and
    /// `TESSERA_DUMP_SCHEDULE` from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("TESSERA_DEFAULT_DEVICE") {
            self.default_device = device;
        }
        if let Some(flag) = env_flag("TESSERA_MULTI_CONTEXT") {
            self.multi_context = flag;
        }
        if let Some(flag) = env_flag("TESSERA_DUMP_SCHEDULE") {
            self.dump_schedule = flag;
        }
        self
    }

    pub fn with_task_device(mut self, task: impl Into<String>, device: impl Into<String>) -> Self {
        self.task_devices.insert(task.into(), device.into());
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(var = name, value = %value, "ignoring unrecognised boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "default_device": "1:0", "task_devices": { "s0.t1": "0:2" } }"#,
        )
        .unwrap();
        assert_eq!(config.default_device, "1:0");
        assert_eq!(config.task_devices["s0.t1"], "0:2");
        assert!(config.multi_context);
        assert_eq!(config.copy_out_policy, CopyOutPolicy::EveryWrite);
        assert_eq!(config.max_events, 32);
    }

    #[test]
    fn rejects_bad_json() {
        assert!(RuntimeConfig::from_json_str("{ default_device: }").is_err());
    }
}
