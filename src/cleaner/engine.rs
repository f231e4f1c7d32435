use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
#[cfg(feature = "parallel-scan")]
use rayon::prelude::*;
use log::{debug, info, warn};
use walkdir::WalkDir;

use super::paths::PathResolver;
use super::platform::Platform;
use super::registry;
use super::safety::{system_whitelist, Whitelist};
use super::script::ScriptRunner;
use super::types::{
    ActionReport, CleaningAction, CleaningOption, ExecutionResult, ProgressFn, ScriptSpec,
    SearchType,
};

/// Resolves cleaning actions to concrete targets and removes them.
///
/// Deletion never follows symlinks, never touches whitelisted paths and
/// never aborts a batch because one item failed.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    resolver: PathResolver,
    whitelist: Whitelist,
    platform: Platform,
    scripts: ScriptRunner,
}

impl ActionExecutor {
    pub fn new(platform: Platform, script_timeout: Duration) -> Self {
        ActionExecutor {
            resolver: PathResolver::new(),
            whitelist: system_whitelist().clone(),
            scripts: ScriptRunner::new(platform.clone(), script_timeout),
            platform,
        }
    }

    pub fn with_resolver(mut self, resolver: PathResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Paths the action would remove, sorted and deduplicated. No side effects.
    pub fn preview(&self, action: &CleaningAction) -> Vec<PathBuf> {
        match action {
            CleaningAction::Delete { search, path } => {
                let found: BTreeSet<PathBuf> = self.search(*search, path).into_iter().collect();
                found.into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn execute(&self, action: &CleaningAction) -> (usize, u64) {
        let report = self.execute_report(action);
        (report.removed_count(), report.bytes)
    }

    pub fn execute_report(&self, action: &CleaningAction) -> ActionReport {
        match action {
            CleaningAction::Delete { .. } => self.delete_targets(&self.preview(action)),
            CleaningAction::RegistryDeleteKey { key } => ActionReport {
                registry_entries: registry::delete_key(&self.platform, key) as usize,
                ..Default::default()
            },
            CleaningAction::RegistryDeleteValue { key, value } => ActionReport {
                registry_entries: registry::delete_value(&self.platform, key, value) as usize,
                ..Default::default()
            },
            CleaningAction::ExternalScript(spec) if !self.platform.is_windows() => {
                debug!("{:?} script ignored on {:?}", spec.host, self.platform);
                ActionReport::default()
            }
            CleaningAction::ExternalScript(spec) => ActionReport {
                scripts: vec![self.run_script(spec)],
                ..Default::default()
            },
        }
    }

    pub fn run_script(&self, spec: &ScriptSpec) -> ExecutionResult {
        self.scripts.run_blocking(spec)
    }

    /// Deletes an already previewed plan, deepest paths first so files go
    /// before the directories holding them.
    pub fn delete_targets(&self, targets: &[PathBuf]) -> ActionReport {
        let mut ordered: Vec<&PathBuf> = targets.iter().collect();
        ordered.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        ordered.dedup();

        let mut report = ActionReport::default();
        for path in ordered {
            self.delete_one(path, &mut report);
        }

        if !report.removed.is_empty() || !report.failed.is_empty() {
            info!(
                "Removed {} items ({}), {} vanished, {} protected, {} failed",
                report.removed.len(),
                ByteSize(report.bytes),
                report.vanished.len(),
                report.whitelisted.len(),
                report.failed.len()
            );
        }
        report
    }

    pub fn preview_option(&self, option: &CleaningOption) -> Vec<PathBuf> {
        #[cfg(feature = "parallel-scan")]
        let found: BTreeSet<PathBuf> = option
            .actions
            .par_iter()
            .map(|action| self.preview(action))
            .flatten_iter()
            .collect();
        #[cfg(not(feature = "parallel-scan"))]
        let found: BTreeSet<PathBuf> = option
            .actions
            .iter()
            .flat_map(|action| self.preview(action))
            .collect();
        found.into_iter().collect()
    }

    pub fn execute_option(
        &self,
        option: &CleaningOption,
        progress: Option<ProgressFn<'_>>,
    ) -> ActionReport {
        let total = option.actions.len().max(1) as f32;
        let mut report = ActionReport::default();

        for (i, action) in option.actions.iter().enumerate() {
            if let Some(cb) = progress {
                cb(i as f32 / total, &option.label, &describe(action));
            }
            report.merge(self.execute_report(action));
        }

        if let Some(cb) = progress {
            cb(1.0, &option.label, "done");
        }
        report
    }

    fn search(&self, search: SearchType, pattern: &str) -> Vec<PathBuf> {
        let bases = self.resolver.expand(pattern);
        match search {
            SearchType::File | SearchType::Glob => bases,
            SearchType::WalkFiles => bases.iter().flat_map(|b| walk(b, false, false)).collect(),
            SearchType::WalkAll => bases.iter().flat_map(|b| walk(b, true, false)).collect(),
            SearchType::WalkTop => bases.iter().flat_map(|b| walk(b, true, true)).collect(),
        }
    }

    fn delete_one(&self, path: &Path, report: &mut ActionReport) {
        if self.whitelist.is_protected(path) {
            warn!("Refusing to delete protected path: {}", path.display());
            report.whitelisted.push(path.to_path_buf());
            return;
        }

        let metadata = match fs::symlink_metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Already gone: {}", path.display());
                report.vanished.push(path.to_path_buf());
                return;
            }
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                report.failed.push((path.to_path_buf(), e.to_string()));
                return;
            }
        };

        let (size, result) = if metadata.is_dir() {
            let (size, protected) = self.measure_dir(path);
            if let Some(inner) = protected {
                warn!(
                    "Refusing to delete {}: contains protected path {}",
                    path.display(),
                    inner.display()
                );
                report.whitelisted.push(path.to_path_buf());
                return;
            }
            (size, fs::remove_dir_all(path))
        } else {
            (metadata.len(), fs::remove_file(path))
        };

        match result {
            Ok(()) => {
                debug!("Deleted {} ({})", path.display(), ByteSize(size));
                report.removed.push(path.to_path_buf());
                report.bytes += size;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.vanished.push(path.to_path_buf());
            }
            Err(e) => {
                if e.kind() == ErrorKind::PermissionDenied {
                    warn!("Permission denied deleting {}", path.display());
                } else {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
                report.failed.push((path.to_path_buf(), e.to_string()));
            }
        }
    }

    /// Total file bytes under `dir` without following symlinks, plus the
    /// first protected descendant if any.
    fn measure_dir(&self, dir: &Path) -> (u64, Option<PathBuf>) {
        let mut total = 0u64;
        for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if self.whitelist.is_protected(entry.path()) {
                return (total, Some(entry.path().to_path_buf()));
            }
            if !entry.file_type().is_dir() {
                if let Ok(md) = entry.metadata() {
                    total += md.len();
                }
            }
        }
        (total, None)
    }
}

/// Non-directory entries below `base` (and `base` itself when it is not a
/// directory). With `dirs`, subdirectories too, children before parents;
/// with `include_base`, the base directory last.
fn walk(base: &Path, dirs: bool, include_base: bool) -> Vec<PathBuf> {
    let is_dir = fs::symlink_metadata(base)
        .map(|md| md.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return vec![base.to_path_buf()];
    }

    let min_depth = if include_base { 0 } else { 1 };
    WalkDir::new(base)
        .follow_links(false)
        .contents_first(true)
        .min_depth(min_depth)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                debug!("Skipping unreadable entry under {}: {}", base.display(), err);
                None
            }
        })
        .filter(|e| dirs || !e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}

fn describe(action: &CleaningAction) -> String {
    match action {
        CleaningAction::Delete { search, path } => format!("{} {}", search, path),
        CleaningAction::RegistryDeleteKey { key } => key.clone(),
        CleaningAction::RegistryDeleteValue { key, value } => format!("{}\\{}", key, value),
        CleaningAction::ExternalScript(spec) => format!("{:?} script", spec.host),
    }
}
