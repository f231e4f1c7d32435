pub mod executor;
pub mod jobs;
pub mod sample_data;
pub mod scenario;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use executor::{RunMode, RunSummary, ScheduleExecutor, SkippedBrowser};
pub use jobs::{JobRegistry, JobState, JobStatus};
pub use sample_data::{count_files, SampleDataGenerator, SampleStats};
pub use scenario::{parse_time, Cadence, Scenario, ScenarioDraft, ScenarioPatch};
pub use scheduler::{ScenarioRunner, Scheduler};
pub use store::ScheduleManager;
pub use trigger::{build_trigger, weekday_from_index, CalendarDays, Trigger};
