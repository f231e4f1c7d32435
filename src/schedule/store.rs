use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use fs2::FileExt;
use log::{info, warn};
use serde_json::Value;

use super::scenario::{Scenario, ScenarioDraft, ScenarioPatch};
use crate::error::{CleanerError, Result};

/// CRUD over the scenario document (a JSON array).
///
/// Every mutation is a read-modify-write of the whole document under an
/// exclusive advisory lock on `<store>.lock`; the document itself is replaced
/// by rename. Records that fail validation stay on disk untouched and are
/// left out of typed reads.
#[derive(Debug, Clone)]
pub struct ScheduleManager {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ScheduleManager {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let manager = ScheduleManager {
            lock_path: path.with_file_name(lock_name),
            path,
        };
        if !manager.path.exists() {
            manager.mutate(|_| Ok(()))?;
        }
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, draft: ScenarioDraft) -> Result<Scenario> {
        let scenario = Scenario::from_draft(draft, Local::now().naive_local())?;
        let value = serde_json::to_value(&scenario)?;
        self.mutate(|records| {
            records.push(value);
            Ok(())
        })?;
        info!("Created schedule: {} ({})", scenario.name, scenario.id);
        Ok(scenario)
    }

    pub fn get_all(&self) -> Result<Vec<Scenario>> {
        let records = self.with_lock(false, || self.read_records())?;
        Ok(typed(records))
    }

    pub fn get(&self, id: &str) -> Result<Option<Scenario>> {
        Ok(self.get_all()?.into_iter().find(|s| s.id == id))
    }

    pub fn get_active(&self) -> Result<Vec<Scenario>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub fn update(&self, id: &str, patch: ScenarioPatch) -> Result<Scenario> {
        let updated = self.modify(id, |s| s.apply(patch))?;
        info!("Updated schedule: {} ({})", updated.name, id);
        Ok(updated)
    }

    pub fn toggle(&self, id: &str) -> Result<Scenario> {
        let toggled = self.modify(id, |s| s.enabled = !s.enabled)?;
        info!(
            "Schedule {} is now {}",
            toggled.name,
            if toggled.enabled { "enabled" } else { "disabled" }
        );
        Ok(toggled)
    }

    pub fn mark_as_run(&self, id: &str, at: NaiveDateTime) -> Result<Scenario> {
        self.modify(id, |s| s.last_run = Some(at))
    }

    /// Returns whether a record was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.mutate(|records| {
            let before = records.len();
            records.retain(|r| record_id(r) != Some(id));
            Ok(records.len() < before)
        })?;
        if removed {
            info!("Deleted schedule: {}", id);
        } else {
            warn!("Schedule not found: {}", id);
        }
        Ok(removed)
    }

    fn modify<F>(&self, id: &str, change: F) -> Result<Scenario>
    where
        F: FnOnce(&mut Scenario),
    {
        self.mutate(|records| {
            let slot = records
                .iter_mut()
                .find(|r| record_id(r) == Some(id))
                .ok_or_else(|| CleanerError::NotFound(format!("schedule {}", id)))?;
            let mut scenario: Scenario = serde_json::from_value(slot.clone())
                .map_err(|e| CleanerError::InvalidScenario(format!("{}: {}", id, e)))?;
            change(&mut scenario);
            scenario.validate()?;
            *slot = serde_json::to_value(&scenario)?;
            Ok(scenario)
        })
    }

    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Value>) -> Result<T>,
    {
        self.with_lock(true, || {
            let mut records = self.read_records()?;
            let out = f(&mut records)?;
            self.write_records(&records)?;
            Ok(out)
        })
    }

    fn with_lock<T, F>(&self, exclusive: bool, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        if exclusive {
            lock.lock_exclusive()?;
        } else {
            FileExt::lock_shared(&lock)?;
        }
        let out = f();
        // Released when `lock` is dropped
        drop(lock);
        out
    }

    fn read_records(&self) -> Result<Vec<Value>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_records(&self, records: &[Value]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&file, records)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn typed(records: Vec<Value>) -> Vec<Scenario> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record_id(&record).unwrap_or("?").to_string();
            match serde_json::from_value::<Scenario>(record) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Skipping invalid schedule record {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}
