//! Precomputed argument-access summaries for compilable methods.
//!
//! A sketch is produced once per method by the (external) front-end analysis
//! and looked up at graph-build time instead of re-deriving accesses. The
//! registry can be persisted as a JSON file so that analysis results survive
//! across runs.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::task::{Access, SchedulableTask};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sketch {
    pub method: String,
    pub accesses: Vec<Access>,
}

#[derive(Serialize, Deserialize, Default)]
struct SketchFile {
    entries: HashMap<String, Vec<Access>>,
}

#[derive(Debug, Default)]
pub struct SketchRegistry {
    sketches: RwLock<HashMap<String, Sketch>>,
}

impl SketchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: impl Into<String>, accesses: Vec<Access>) {
        let method = method.into();
        tracing::debug!(method = %method, args = accesses.len(), "registering sketch");
        self.sketches
            .write()
            .insert(method.clone(), Sketch { method, accesses });
    }

    pub fn lookup(&self, method: &str) -> Result<Sketch> {
        self.sketches
            .read()
            .get(method)
            .cloned()
            .ok_or_else(|| Error::MissingSketch(method.to_string()))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.sketches.read().contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.sketches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Argument accesses for a task: its sketch when compilable, its own
    /// declaration when prebuilt.
    pub fn accesses_for(&self, task: &SchedulableTask) -> Result<Vec<Access>> {
        match task.declared_accesses() {
            Some(accesses) => Ok(accesses.to_vec()),
            None => Ok(self.lookup(task.code_key())?.accesses),
        }
    }

    pub fn load_json(&self, path: impl AsRef<Path>) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        let file: SketchFile = serde_json::from_str(&content)?;
        let count = file.entries.len();
        let mut sketches = self.sketches.write();
        for (method, accesses) in file.entries {
            sketches.insert(method.clone(), Sketch { method, accesses });
        }
        Ok(count)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = SketchFile {
            entries: self
                .sketches
                .read()
                .values()
                .map(|s| (s.method.clone(), s.accesses.clone()))
                .collect(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    #[test]
    fn compilable_tasks_use_sketches() {
        let registry = SketchRegistry::new();
        let task = SchedulableTask::compilable("t0", "saxpy", vec![Value::from(2.0f32)]);
        assert!(matches!(
            registry.accesses_for(&task),
            Err(Error::MissingSketch(m)) if m == "saxpy"
        ));

        registry.register("saxpy", vec![Access::Read]);
        assert_eq!(registry.accesses_for(&task).unwrap(), vec![Access::Read]);
    }

    #[test]
    fn prebuilt_tasks_use_declared_accesses() {
        let registry = SketchRegistry::new();
        let task = SchedulableTask::prebuilt("t0", "k", "src", vec![], vec![Access::Write]);
        assert_eq!(registry.accesses_for(&task).unwrap(), vec![Access::Write]);
    }

    #[test]
    fn json_round_trip() {
        let path = std::env::temp_dir().join(format!("tessera-sketches-{}.json", std::process::id()));
        let registry = SketchRegistry::new();
        registry.register("scale", vec![Access::Read, Access::ReadWrite]);
        registry.save_json(&path).unwrap();

        let loaded = SketchRegistry::new();
        assert_eq!(loaded.load_json(&path).unwrap(), 1);
        assert_eq!(
            loaded.lookup("scale").unwrap().accesses,
            vec![Access::Read, Access::ReadWrite]
        );
        let _ = fs::remove_file(path);
    }
}
