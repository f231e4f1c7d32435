pub mod backup;
pub mod catalog;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod notify;
pub mod probe;
pub mod schedule;

pub use backup::{BackupContext, BackupEntry, BackupManager, BackupMetadata, RestoreResult};
pub use cleaner::{
    ActionExecutor, ActionReport, CleaningAction, CleaningOption, PathResolver, Platform,
    SearchType, Whitelist,
};
pub use config::AppConfig;
pub use error::{CleanerError, Result};
pub use notify::{ChannelNotifier, LogNotifier, Notification, NotificationSink};
pub use probe::{ProgramInfo, ProgramProbe, SystemProbe};
pub use schedule::{
    Cadence, RunSummary, Scenario, ScenarioDraft, ScenarioPatch, ScenarioRunner, ScheduleExecutor,
    ScheduleManager, Scheduler,
};
