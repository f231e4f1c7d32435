use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;

use super::sample_data;
use super::scenario::Scenario;
use super::scheduler::ScenarioRunner;
use super::store::ScheduleManager;
use crate::backup::{BackupContext, BackupManager};
use crate::catalog;
use crate::cleaner::{load_rule_file, ActionExecutor, ActionReport, CleaningAction, Platform, SearchType};
use crate::config::AppConfig;
use crate::error::Result;
use crate::notify::{Notification, NotificationSink};
use crate::probe::ProgramProbe;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Simulation,
    Real,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBrowser {
    pub name: String,
    pub reason: String,
}

/// Outcome of one scenario fire.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario_id: String,
    pub scenario_name: String,
    pub mode: RunMode,
    /// Browsers that were counted (simulation) or cleaned (real).
    pub browsers: Vec<String>,
    pub skipped: Vec<SkippedBrowser>,
    /// Files found: sample files in simulation, planned targets otherwise.
    pub file_count: usize,
    pub total_size: u64,
    pub deleted_files: usize,
    pub deleted_bytes: u64,
    pub failed: usize,
    pub backup_id: Option<String>,
    #[serde(skip)]
    pub duration: Duration,
}

impl RunSummary {
    fn new(scenario: &Scenario, mode: RunMode) -> Self {
        RunSummary {
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            mode,
            browsers: Vec::new(),
            skipped: Vec::new(),
            file_count: 0,
            total_size: 0,
            deleted_files: 0,
            deleted_bytes: 0,
            failed: 0,
            backup_id: None,
            duration: Duration::ZERO,
        }
    }

    pub fn deleted_size_mb(&self) -> f64 {
        self.deleted_bytes as f64 / BYTES_PER_MB
    }

    fn skip(&mut self, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Skipping {}: {}", name, reason);
        self.skipped.push(SkippedBrowser {
            name: name.to_string(),
            reason,
        });
    }
}

/// Runs a scenario end to end and reports through the notification sink.
///
/// In dev mode a run only counts the sample files generated for each browser.
/// Otherwise it probes each browser, plans targets from its rule file, backs
/// them up, then deletes them. Nothing a run does escapes as an error or a
/// panic; failures become [`Notification::Error`].
pub struct ScheduleExecutor {
    config: AppConfig,
    store: Option<Arc<ScheduleManager>>,
    probe: Arc<dyn ProgramProbe>,
    notifier: Arc<dyn NotificationSink>,
    actions: ActionExecutor,
    backups: BackupManager,
    downloads_dir: Option<PathBuf>,
}

impl ScheduleExecutor {
    pub fn new(
        config: AppConfig,
        probe: Arc<dyn ProgramProbe>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let actions = ActionExecutor::new(
            Platform::current(),
            Duration::from_secs(config.script_timeout_secs),
        );
        ScheduleExecutor {
            backups: BackupManager::from_config(&config),
            downloads_dir: dirs::download_dir(),
            store: None,
            probe,
            notifier,
            actions,
            config,
        }
    }

    /// Store that receives `last_run` after every fire.
    pub fn with_store(mut self, store: Arc<ScheduleManager>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_actions(mut self, actions: ActionExecutor) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_downloads_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.downloads_dir = dir;
        self
    }

    pub fn execute_scenario(&self, scenario: &Scenario) -> Option<RunSummary> {
        info!("Executing schedule: {}", scenario.name);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.perform(scenario)));
        let message = match outcome {
            Ok(Ok(summary)) => {
                self.notify_summary(&summary);
                self.record_run(scenario);
                return Some(summary);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };

        error!("Schedule {} failed: {}", scenario.name, message);
        self.notifier.notify(Notification::Error {
            scenario_name: scenario.name.clone(),
            message,
        });
        self.record_run(scenario);
        None
    }

    fn perform(&self, scenario: &Scenario) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = if self.config.dev_mode {
            self.simulate(scenario)
        } else {
            self.clean(scenario)?
        };
        summary.duration = started.elapsed();
        Ok(summary)
    }

    fn simulate(&self, scenario: &Scenario) -> RunSummary {
        let mut summary = RunSummary::new(scenario, RunMode::Simulation);
        for browser in &scenario.browsers {
            let (files, size) = sample_data::count_files(&self.config.sample_data_dir, browser);
            info!("[dev] {}: {} files ({}), simulated", browser, files, ByteSize(size));
            summary.browsers.push(browser.clone());
            summary.file_count += files;
            summary.total_size += size;
        }
        summary
    }

    fn clean(&self, scenario: &Scenario) -> Result<RunSummary> {
        let mut summary = RunSummary::new(scenario, RunMode::Real);
        let wanted = catalog::cleaner_options(scenario.delete_bookmarks, scenario.delete_downloads);

        let mut plan: BTreeSet<PathBuf> = BTreeSet::new();
        let mut side_actions: Vec<CleaningAction> = Vec::new();

        for browser in &scenario.browsers {
            let Some(spec) = catalog::find(browser) else {
                summary.skip(browser, "unknown browser");
                continue;
            };
            let program = self.probe.probe(spec.id);
            if !program.present {
                summary.skip(spec.id, "not installed");
                continue;
            }
            if program.running && self.config.skip_running_browsers {
                summary.skip(spec.id, "browser is running");
                continue;
            }

            let rule_path = spec.rule_path(&self.config.rules_dir);
            let options = match load_rule_file(&rule_path, self.actions.platform()) {
                Ok(options) => options,
                Err(e) => {
                    error!("{}", e);
                    summary.skip(spec.id, format!("rule file unavailable: {}", e));
                    continue;
                }
            };

            let before = plan.len();
            for option in options.iter().filter(|o| wanted.contains(&o.id.as_str())) {
                plan.extend(self.actions.preview_option(option));
                side_actions.extend(
                    option
                        .actions
                        .iter()
                        .filter(|a| !matches!(a, CleaningAction::Delete { .. }))
                        .cloned(),
                );
            }
            info!("{}: {} targets", spec.display_name, plan.len() - before);
            summary.browsers.push(spec.id.to_string());
        }

        if scenario.delete_downloads_folder {
            match &self.downloads_dir {
                Some(dir) => {
                    let action = CleaningAction::delete(SearchType::WalkFiles, dir.to_string_lossy());
                    plan.extend(self.actions.preview(&action));
                }
                None => warn!("No downloads folder on this system"),
            }
        }

        let targets: Vec<PathBuf> = plan.into_iter().collect();
        summary.file_count = targets.len();

        if self.config.backup_before_clean && !targets.is_empty() {
            let context = BackupContext {
                browsers: summary.browsers.clone(),
                delete_bookmarks: scenario.delete_bookmarks,
                delete_downloads: scenario.delete_downloads,
                delete_downloads_folder: scenario.delete_downloads_folder,
            };
            summary.backup_id = self.backups.create_backup(&targets, &context)?;
        }

        let mut report: ActionReport = self.actions.delete_targets(&targets);
        for action in &side_actions {
            report.merge(self.actions.execute_report(action));
        }
        for script in report.scripts.iter().filter(|s| !s.success) {
            warn!("Cleanup script failed: {}", script.stderr.trim());
        }

        if self.config.backup_before_clean {
            self.backups.cleanup_old_backups();
        }

        summary.deleted_files = report.removed_count();
        summary.deleted_bytes = report.bytes;
        summary.failed = report.failed.len();
        summary.total_size = report.bytes;
        Ok(summary)
    }

    fn notify_summary(&self, summary: &RunSummary) {
        let notification = match summary.mode {
            RunMode::Simulation => Notification::Simulation {
                scenario_name: summary.scenario_name.clone(),
                browsers: summary.browsers.clone(),
                file_count: summary.file_count,
                total_size: summary.total_size,
            },
            RunMode::Real => Notification::Completed {
                scenario_name: summary.scenario_name.clone(),
                deleted_files: summary.deleted_files,
                deleted_size_mb: summary.deleted_size_mb(),
                duration: summary.duration,
            },
        };
        self.notifier.notify(notification);
    }

    fn record_run(&self, scenario: &Scenario) {
        if let Some(store) = &self.store {
            if let Err(e) = store.mark_as_run(&scenario.id, Local::now().naive_local()) {
                warn!("Could not record last run of {}: {}", scenario.name, e);
            }
        }
    }
}

impl ScenarioRunner for ScheduleExecutor {
    fn run(&self, scenario: &Scenario) {
        self.execute_scenario(scenario);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
