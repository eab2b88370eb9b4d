//! Engine state carried across restarts of a process-local engine.
use serde::{Deserialize, Serialize};
use sluice_queue::Task;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::manager::{CounterSnapshot, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot<D: Clone> {
    pub gated_tasks: Vec<Task<D>>,
    pub ungated_tasks: Vec<Task<D>>,
    pub gated_fingerprints: Vec<String>,
    pub ungated_fingerprints: Vec<String>,
    pub counter: CounterSnapshot,
}

impl<D: Clone> Default for EngineSnapshot<D> {
    fn default() -> Self {
        Self {
            gated_tasks: Vec::new(),
            ungated_tasks: Vec::new(),
            gated_fingerprints: Vec::new(),
            ungated_fingerprints: Vec::new(),
            counter: CounterSnapshot::default(),
        }
    }
}

impl<D> EngineSnapshot<D>
where
    D: Clone + Serialize + for<'de> Deserialize<'de>,
{
    pub fn task_count(&self) -> usize {
        self.gated_tasks.len() + self.ungated_tasks.len()
    }

    /// Write the snapshot next to `path` and rename it into place, so a
    /// crash never leaves a half-written file behind.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp_file);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        std::fs::rename(tmp_path, path)?;
        Ok(())
    }

    /// `None` when nothing was saved at `path`.
    pub fn load(path: &Path) -> Result<Option<Self>, EngineError> {
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::FamilyCounts;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded =
            EngineSnapshot::<String>::load(&dir.path().join("sluice.none.json"))
                .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn saved_snapshot_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sluice.test.json");

        let mut snapshot = EngineSnapshot::<String>::default();
        snapshot
            .gated_tasks
            .push(Task::new("a".to_string()).with_resource_key("example.com"));
        snapshot.ungated_tasks.push(Task::new("b".to_string()).with_group("g"));
        snapshot.gated_fingerprints.push("fp-a".into());
        snapshot.counter.counts.insert(
            "Task".into(),
            FamilyCounts {
                success: 4,
                failure: 1,
            },
        );
        snapshot.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = EngineSnapshot::<String>::load(&path).unwrap().unwrap();
        assert_eq!(loaded.task_count(), 2);
        assert_eq!(loaded.gated_tasks[0].task_id, snapshot.gated_tasks[0].task_id);
        assert_eq!(loaded.ungated_tasks[0].group_id, "g");
        assert_eq!(loaded.gated_fingerprints, vec!["fp-a".to_string()]);
        assert_eq!(loaded.counter, snapshot.counter);
    }
}
