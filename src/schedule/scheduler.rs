use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::jobs::{JobRegistry, JobState, JobStatus};
use super::scenario::Scenario;
use super::store::ScheduleManager;
use super::trigger::{build_trigger, Trigger};
use crate::config::AppConfig;
use crate::error::{CleanerError, Result};

/// Runs one fire of a scenario. Called on a blocking worker thread.
pub trait ScenarioRunner: Send + Sync {
    fn run(&self, scenario: &Scenario);
}

/// Owns the timer jobs for registered scenarios.
///
/// Jobs live on the runtime given at construction. Each registered scenario
/// gets one task that sleeps until its next fire, runs the scenario on the
/// blocking pool (bounded by `scheduler_workers`), then computes the next
/// fire from the time the run returned.
pub struct Scheduler {
    handle: Handle,
    store: Arc<ScheduleManager>,
    runner: Arc<dyn ScenarioRunner>,
    jobs: JobRegistry,
    dev_mode: bool,
    fast_mode: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        handle: Handle,
        config: &AppConfig,
        store: Arc<ScheduleManager>,
        runner: Arc<dyn ScenarioRunner>,
    ) -> Self {
        Scheduler {
            handle,
            store,
            runner,
            jobs: JobRegistry::new(config.scheduler_workers),
            dev_mode: config.dev_mode,
            fast_mode: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Binds to the runtime the caller is running on.
    pub fn from_current(
        config: &AppConfig,
        store: Arc<ScheduleManager>,
        runner: Arc<dyn ScenarioRunner>,
    ) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CleanerError::Runtime(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle, config, store, runner))
    }

    /// Registers every enabled scenario. Returns how many were registered.
    pub fn start(&self) -> Result<usize> {
        self.started.store(true, Ordering::SeqCst);
        let count = self.reload_schedules()?;
        info!("Scheduler started with {} job(s)", count);
        Ok(count)
    }

    pub fn stop(&self) {
        let cancelled = self.jobs.cancel_all();
        self.started.store(false, Ordering::SeqCst);
        info!("Scheduler stopped ({} job(s) cancelled)", cancelled);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_fast_mode(&self) -> bool {
        self.fast_mode.load(Ordering::SeqCst)
    }

    /// Registers `scenario`, replacing any job already held for its id.
    /// A disabled scenario is unregistered instead. Returns the first fire.
    pub fn add_schedule(&self, scenario: &Scenario) -> Result<Option<NaiveDateTime>> {
        if !scenario.enabled {
            self.remove_schedule(&scenario.id);
            debug!("Schedule {} is disabled, not registering", scenario.name);
            return Ok(None);
        }

        let now = Local::now().naive_local();
        let trigger = build_trigger(scenario, now, self.is_fast_mode())?;
        let first = trigger.next_after(now);

        let (registration, token) = self.jobs.register(&scenario.id, &scenario.name, &self.shutdown);
        self.jobs
            .update(&scenario.id, &registration, |s| s.next_run = first);

        let job = Job {
            jobs: self.jobs.clone(),
            runner: Arc::clone(&self.runner),
            scenario: scenario.clone(),
            trigger,
            registration,
            token,
        };
        self.handle.spawn(job.run(now));

        match first {
            Some(at) => info!(
                "Schedule added: {} ({}), next run {}",
                scenario.name, scenario.cadence, at
            ),
            None => warn!("Schedule {} has no upcoming run", scenario.name),
        }
        Ok(first)
    }

    pub fn remove_schedule(&self, scenario_id: &str) -> bool {
        let removed = self.jobs.cancel(scenario_id);
        if removed {
            info!("Schedule removed: {}", scenario_id);
        }
        removed
    }

    /// Drops every job and re-registers the enabled scenarios from the store.
    /// Scenarios whose trigger cannot be built are logged and skipped.
    pub fn reload_schedules(&self) -> Result<usize> {
        self.jobs.cancel_all();
        let mut count = 0;
        for scenario in self.store.get_active()? {
            match self.add_schedule(&scenario) {
                Ok(_) => count += 1,
                Err(e) => error!("Failed to register schedule {}: {}", scenario.name, e),
            }
        }
        Ok(count)
    }

    /// Switches every cadence to its accelerated interval. Only allowed in
    /// dev mode; reloads registered jobs when the scheduler is started.
    pub fn set_fast_mode(&self, enabled: bool) -> Result<()> {
        if enabled && !self.dev_mode {
            return Err(CleanerError::Runtime(
                "fast mode is only available in dev mode".into(),
            ));
        }
        let previous = self.fast_mode.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Fast mode {}", if enabled { "enabled" } else { "disabled" });
            if self.is_running() {
                self.reload_schedules()?;
            }
        }
        Ok(())
    }

    pub fn next_run_time(&self, scenario_id: &str) -> Option<NaiveDateTime> {
        self.jobs.get(scenario_id).and_then(|j| j.next_run)
    }

    pub fn jobs(&self) -> Vec<JobState> {
        self.jobs.list()
    }

    pub fn is_executing(&self, scenario_id: &str) -> bool {
        self.jobs.is_running(scenario_id)
    }

    /// Runs a stored scenario immediately, outside its trigger. Returns
    /// `false` when a run of that scenario is already in flight.
    pub async fn run_now(&self, scenario_id: &str) -> Result<bool> {
        let scenario = self
            .store
            .get(scenario_id)?
            .ok_or_else(|| CleanerError::NotFound(format!("schedule {}", scenario_id)))?;
        info!("Running schedule now: {}", scenario.name);
        Ok(execute(&self.jobs, &self.runner, &scenario).await)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Job {
    jobs: JobRegistry,
    runner: Arc<dyn ScenarioRunner>,
    scenario: Scenario,
    trigger: Trigger,
    registration: String,
    token: CancellationToken,
}

impl Job {
    async fn run(self, registered_at: NaiveDateTime) {
        let id = self.scenario.id.clone();
        let clock = JobClock::new(registered_at);
        let mut after = registered_at;

        while let Some(next) = self.trigger.next_after(after) {
            self.jobs
                .update(&id, &self.registration, |s| s.next_run = Some(next));

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(clock.deadline(next)) => {}
            }

            let fired_at = Local::now().naive_local();
            self.jobs.update(&id, &self.registration, |s| {
                s.status = JobStatus::Running;
                s.last_fired = Some(fired_at);
                s.runs += 1;
            });
            execute(&self.jobs, &self.runner, &self.scenario).await;
            self.jobs
                .update(&id, &self.registration, |s| s.status = JobStatus::Waiting);

            if self.token.is_cancelled() {
                return;
            }
            // Fires missed while running collapse into the next one
            after = next.max(clock.now());
        }

        debug!("Schedule {} has no further runs", self.scenario.name);
        self.jobs.finish(&id, &self.registration);
    }
}

/// Maps trigger times onto the runtime's monotonic clock. The wall clock is
/// read once, at registration; every later deadline is an offset from it.
struct JobClock {
    wall: NaiveDateTime,
    instant: Instant,
}

impl JobClock {
    fn new(wall: NaiveDateTime) -> Self {
        JobClock {
            wall,
            instant: Instant::now(),
        }
    }

    fn now(&self) -> NaiveDateTime {
        let elapsed = ChronoDuration::from_std(self.instant.elapsed())
            .unwrap_or_else(|_| ChronoDuration::zero());
        self.wall + elapsed
    }

    /// Deadlines before registration are due immediately.
    fn deadline(&self, at: NaiveDateTime) -> Instant {
        self.instant + (at - self.wall).to_std().unwrap_or_default()
    }
}

async fn execute(jobs: &JobRegistry, runner: &Arc<dyn ScenarioRunner>, scenario: &Scenario) -> bool {
    let Some(guard) = jobs.try_begin_run(&scenario.id, Local::now().naive_local()) else {
        warn!("Schedule {} is still running, skipping this fire", scenario.name);
        return false;
    };
    let permit = match Arc::clone(&jobs.worker_sem).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return false,
    };

    let runner = Arc::clone(runner);
    let owned = scenario.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _guard = guard;
        runner.run(&owned);
    })
    .await;

    if let Err(e) = outcome {
        error!("Run of schedule {} aborted: {}", scenario.name, e);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::scenario::{Cadence, ScenarioDraft, ScenarioPatch};
    use chrono::{Datelike, NaiveTime};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct CountingRunner {
        runs: AtomicUsize,
        delay: Duration,
        tx: Option<mpsc::UnboundedSender<String>>,
    }

    impl CountingRunner {
        fn new() -> Arc<Self> {
            Arc::new(CountingRunner {
                runs: AtomicUsize::new(0),
                delay: Duration::ZERO,
                tx: None,
            })
        }
    }

    impl ScenarioRunner for CountingRunner {
        fn run(&self, scenario: &Scenario) {
            std::thread::sleep(self.delay);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = &self.tx {
                let _ = tx.send(scenario.id.clone());
            }
        }
    }

    struct Fixture {
        _temp: TempDir,
        store: Arc<ScheduleManager>,
        config: AppConfig,
    }

    fn fixture(dev_mode: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::with_data_dir(temp.path());
        config.dev_mode = dev_mode;
        let store = Arc::new(ScheduleManager::open(config.schedules_path()).unwrap());
        Fixture {
            _temp: temp,
            store,
            config,
        }
    }

    fn draft(name: &str, cadence: Cadence) -> ScenarioDraft {
        ScenarioDraft::new(name, cadence, NaiveTime::from_hms_opt(3, 30, 0).unwrap())
            .browsers(["chrome"])
    }

    #[tokio::test]
    async fn start_registers_enabled_scenarios_only() {
        let fx = fixture(false);
        let a = fx.store.create(draft("a", Cadence::Daily)).unwrap();
        let b = fx.store.create(draft("b", Cadence::Hourly)).unwrap();
        fx.store.toggle(&b.id).unwrap();

        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()).unwrap();
        assert_eq!(scheduler.start().unwrap(), 1);
        assert!(scheduler.is_running());

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scenario_id, a.id);
        let next = scheduler.next_run_time(&a.id).unwrap();
        assert_eq!(next.time(), NaiveTime::from_hms_opt(3, 30, 0).unwrap());
        assert!(next > Local::now().naive_local());

        scheduler.stop();
        assert!(scheduler.jobs().is_empty());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn add_schedule_replaces_existing_job() {
        let fx = fixture(false);
        let scenario = fx.store.create(draft("a", Cadence::Hourly)).unwrap();
        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()).unwrap();

        scheduler.add_schedule(&scenario).unwrap();
        let updated = fx
            .store
            .update(
                &scenario.id,
                ScenarioPatch {
                    cadence: Some(Cadence::Daily),
                    ..Default::default()
                },
            )
            .unwrap();
        let next = scheduler.add_schedule(&updated).unwrap().unwrap();

        assert_eq!(scheduler.jobs().len(), 1);
        assert_eq!(scheduler.next_run_time(&scenario.id), Some(next));
        assert_eq!(next.time(), NaiveTime::from_hms_opt(3, 30, 0).unwrap());

        assert!(scheduler.remove_schedule(&scenario.id));
        assert!(!scheduler.remove_schedule(&scenario.id));
        assert_eq!(scheduler.next_run_time(&scenario.id), None);
    }

    #[tokio::test]
    async fn fast_mode_is_refused_outside_dev_mode() {
        let fx = fixture(false);
        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()).unwrap();
        assert!(matches!(
            scheduler.set_fast_mode(true),
            Err(CleanerError::Runtime(_))
        ));
        assert!(!scheduler.is_fast_mode());
        scheduler.set_fast_mode(false).unwrap();
    }

    #[tokio::test]
    async fn fast_mode_reloads_with_short_intervals() {
        let fx = fixture(true);
        let scenario = fx.store.create(draft("a", Cadence::weekly([0]))).unwrap();
        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()).unwrap();
        scheduler.start().unwrap();

        let before = Local::now().naive_local();
        scheduler.set_fast_mode(true).unwrap();
        let next = scheduler.next_run_time(&scenario.id).unwrap();
        assert!(next > before);
        assert!(next <= Local::now().naive_local() + ChronoDuration::minutes(5));

        scheduler.set_fast_mode(false).unwrap();
        let next = scheduler.next_run_time(&scenario.id).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_hourly_job_keeps_firing() {
        let fx = fixture(true);
        let scenario = fx.store.create(draft("a", Cadence::Hourly)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
            delay: Duration::ZERO,
            tx: Some(tx),
        });
        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), runner.clone()).unwrap();
        scheduler.set_fast_mode(true).unwrap();
        scheduler.start().unwrap();

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), scenario.id);
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(25), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(40), "{:?}", elapsed);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.jobs()[0].runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn job_clock_follows_runtime_time() {
        let wall = Local::now().naive_local();
        let clock = JobClock::new(wall);
        let start = Instant::now();

        assert_eq!(clock.deadline(wall - ChronoDuration::minutes(1)), start);
        assert_eq!(
            clock.deadline(wall + ChronoDuration::seconds(10)),
            start + Duration::from_secs(10)
        );

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), wall + ChronoDuration::seconds(90));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_now_refuses_overlapping_runs() {
        let fx = fixture(false);
        let scenario = fx.store.create(draft("slow", Cadence::Daily)).unwrap();
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
            tx: None,
        });
        let scheduler = Arc::new(
            Scheduler::from_current(&fx.config, fx.store.clone(), runner.clone()).unwrap(),
        );

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let id = scenario.id.clone();
            tokio::spawn(async move { scheduler.run_now(&id).await })
        };
        while !scheduler.is_executing(&scenario.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!scheduler.run_now(&scenario.id).await.unwrap());
        assert!(first.await.unwrap().unwrap());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        assert!(scheduler.run_now(&scenario.id).await.unwrap());
        assert!(matches!(
            scheduler.run_now("missing").await,
            Err(CleanerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn disabled_scenario_is_unregistered() {
        let fx = fixture(false);
        let scenario = fx.store.create(draft("a", Cadence::Daily)).unwrap();
        let scheduler = Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()).unwrap();
        scheduler.add_schedule(&scenario).unwrap();

        let disabled = fx.store.toggle(&scenario.id).unwrap();
        assert_eq!(scheduler.add_schedule(&disabled).unwrap(), None);
        assert!(scheduler.jobs().is_empty());
    }

    #[test]
    fn from_current_needs_a_runtime() {
        let fx = fixture(false);
        assert!(matches!(
            Scheduler::from_current(&fx.config, fx.store.clone(), CountingRunner::new()),
            Err(CleanerError::Runtime(_))
        ));
    }
}
