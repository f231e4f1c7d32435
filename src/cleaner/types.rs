use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a `Delete` action turns its path pattern into targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    File,
    Glob,
    WalkFiles,
    WalkAll,
    WalkTop,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::File => "file",
            SearchType::Glob => "glob",
            SearchType::WalkFiles => "walk.files",
            SearchType::WalkAll => "walk.all",
            SearchType::WalkTop => "walk.top",
        }
    }
}

impl FromStr for SearchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SearchType::File),
            "glob" => Ok(SearchType::Glob),
            "walk.files" => Ok(SearchType::WalkFiles),
            "walk.all" => Ok(SearchType::WalkAll),
            "walk.top" => Ok(SearchType::WalkTop),
            other => Err(format!("unknown search type '{}'", other)),
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Delete,
    RegistryDeleteKey,
    RegistryDeleteValue,
    ExternalScript,
}

/// Shell an external script is allowed to run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptHost {
    PowerShell,
    Cmd,
    Regedit,
    Execute,
}

impl FromStr for ScriptHost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "powershell" => Ok(ScriptHost::PowerShell),
            "cmd" => Ok(ScriptHost::Cmd),
            "regedit" => Ok(ScriptHost::Regedit),
            "execute" => Ok(ScriptHost::Execute),
            other => Err(format!("unknown script host '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub host: ScriptHost,
    pub code: String,
}

/// A single step of a cleaning option. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleaningAction {
    Delete { search: SearchType, path: String },
    RegistryDeleteKey { key: String },
    RegistryDeleteValue { key: String, value: String },
    ExternalScript(ScriptSpec),
}

impl CleaningAction {
    pub fn delete(search: SearchType, path: impl Into<String>) -> Self {
        CleaningAction::Delete {
            search,
            path: path.into(),
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            CleaningAction::Delete { .. } => ActionType::Delete,
            CleaningAction::RegistryDeleteKey { .. } => ActionType::RegistryDeleteKey,
            CleaningAction::RegistryDeleteValue { .. } => ActionType::RegistryDeleteValue,
            CleaningAction::ExternalScript(_) => ActionType::ExternalScript,
        }
    }

    /// `None` for registry and script actions.
    pub fn search_type(&self) -> Option<SearchType> {
        match self {
            CleaningAction::Delete { search, .. } => Some(*search),
            _ => None,
        }
    }
}

/// A user-selectable cleaning category from a rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub warning: Option<String>,
    pub actions: Vec<CleaningAction>,
}

/// Per-item outcome of a deletion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub removed: Vec<PathBuf>,
    pub bytes: u64,
    /// Existed at preview time, gone at execution. Already clean.
    pub vanished: Vec<PathBuf>,
    pub whitelisted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Registry keys or values removed.
    pub registry_entries: usize,
    pub scripts: Vec<ExecutionResult>,
}

impl ActionReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len() + self.registry_entries
    }

    pub fn merge(&mut self, other: ActionReport) {
        self.removed.extend(other.removed);
        self.bytes += other.bytes;
        self.vanished.extend(other.vanished);
        self.whitelisted.extend(other.whitelisted);
        self.failed.extend(other.failed);
        self.registry_entries += other.registry_entries;
        self.scripts.extend(other.scripts);
    }
}

/// Captured outcome of an external script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>) -> Self {
        ExecutionResult {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
        }
    }
}

/// Progress callback: (fraction done, stage, current item).
pub type ProgressFn<'a> = &'a (dyn Fn(f32, &str, &str) + Send + Sync);
