use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub type RegistrationId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub scenario_id: String,
    pub scenario_name: String,
    pub next_run: Option<NaiveDateTime>,
    pub last_fired: Option<NaiveDateTime>,
    pub runs: u64,
    pub status: JobStatus,
}

#[derive(Debug)]
struct JobHandle {
    registration: RegistrationId,
    token: CancellationToken,
}

/// Registered jobs keyed by scenario id, the set of scenarios currently
/// executing, and the worker pool that bounds concurrent runs.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<DashMap<String, (JobState, Arc<JobHandle>)>>,
    running: Arc<DashMap<String, NaiveDateTime>>,
    pub worker_sem: Arc<Semaphore>,
}

impl JobRegistry {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            worker_sem: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Registers a job for `scenario_id`, cancelling any job already held
    /// under that id.
    pub fn register(
        &self,
        scenario_id: &str,
        scenario_name: &str,
        parent: &CancellationToken,
    ) -> (RegistrationId, CancellationToken) {
        let registration = uuid::Uuid::new_v4().to_string();
        let token = parent.child_token();
        let state = JobState {
            scenario_id: scenario_id.to_string(),
            scenario_name: scenario_name.to_string(),
            next_run: None,
            last_fired: None,
            runs: 0,
            status: JobStatus::Waiting,
        };
        let handle = Arc::new(JobHandle {
            registration: registration.clone(),
            token: token.clone(),
        });
        if let Some((_, (_, previous))) = self.inner.remove(scenario_id) {
            previous.token.cancel();
        }
        self.inner.insert(scenario_id.to_string(), (state, handle));
        (registration, token)
    }

    /// Applies `f` only while `registration` is still the live job for the id.
    pub fn update(&self, scenario_id: &str, registration: &str, f: impl FnOnce(&mut JobState)) {
        if let Some(mut entry) = self.inner.get_mut(scenario_id) {
            if entry.1.registration == registration {
                f(&mut entry.0);
            }
        }
    }

    pub fn get(&self, scenario_id: &str) -> Option<JobState> {
        self.inner.get(scenario_id).map(|e| e.0.clone())
    }

    pub fn contains(&self, scenario_id: &str) -> bool {
        self.inner.contains_key(scenario_id)
    }

    /// Snapshot ordered by next run; jobs without one sort last.
    pub fn list(&self) -> Vec<JobState> {
        let mut jobs: Vec<JobState> = self.inner.iter().map(|e| e.0.clone()).collect();
        jobs.sort_by(|a, b| match (a.next_run, b.next_run) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.scenario_name.cmp(&b.scenario_name),
        });
        jobs
    }

    pub fn cancel(&self, scenario_id: &str) -> bool {
        match self.inner.remove(scenario_id) {
            Some((_, (_, handle))) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Drops a job whose trigger is exhausted, unless it was replaced meanwhile.
    pub fn finish(&self, scenario_id: &str, registration: &str) {
        self.inner
            .remove_if(scenario_id, |_, (_, handle)| handle.registration == registration);
    }

    /// Claims the per-scenario run slot. `None` while a run is in flight.
    pub fn try_begin_run(&self, scenario_id: &str, at: NaiveDateTime) -> Option<RunGuard> {
        use dashmap::mapref::entry::Entry;
        match self.running.entry(scenario_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(at);
                Some(RunGuard {
                    running: Arc::clone(&self.running),
                    scenario_id: scenario_id.to_string(),
                })
            }
        }
    }

    pub fn is_running(&self, scenario_id: &str) -> bool {
        self.running.contains_key(scenario_id)
    }
}

/// Releases the run slot on drop, including when the run panics.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<DashMap<String, NaiveDateTime>>,
    scenario_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.scenario_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn register_replaces_and_cancels_previous() {
        let registry = JobRegistry::new(2);
        let root = CancellationToken::new();
        let (first, first_token) = registry.register("a", "A", &root);
        let (second, second_token) = registry.register("a", "A", &root);

        assert_ne!(first, second);
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(registry.list().len(), 1);

        // A stale registration cannot touch or remove the replacement
        registry.update("a", &first, |s| s.runs = 99);
        registry.finish("a", &first);
        assert_eq!(registry.get("a").unwrap().runs, 0);

        registry.finish("a", &second);
        assert!(!registry.contains("a"));
    }

    #[test]
    fn run_slot_is_exclusive_per_scenario() {
        let registry = JobRegistry::new(1);
        let now = Local::now().naive_local();
        let guard = registry.try_begin_run("a", now).unwrap();
        assert!(registry.try_begin_run("a", now).is_none());
        assert!(registry.try_begin_run("b", now).is_some());
        assert!(registry.is_running("a"));
        drop(guard);
        assert!(!registry.is_running("a"));
        assert!(registry.try_begin_run("a", now).is_some());
    }

    #[test]
    fn cancel_all_follows_parent_token() {
        let registry = JobRegistry::new(2);
        let root = CancellationToken::new();
        let (_, a) = registry.register("a", "A", &root);
        let (_, b) = registry.register("b", "B", &root);
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.list().is_empty());

        let (_, c) = registry.register("c", "C", &root);
        root.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn list_orders_by_next_run() {
        let registry = JobRegistry::new(2);
        let root = CancellationToken::new();
        let now = Local::now().naive_local();
        let (ra, _) = registry.register("a", "A", &root);
        let (rb, _) = registry.register("b", "B", &root);
        registry.register("c", "C", &root);
        registry.update("a", &ra, |s| s.next_run = Some(now + chrono::Duration::hours(2)));
        registry.update("b", &rb, |s| s.next_run = Some(now + chrono::Duration::hours(1)));
        let order: Vec<String> = registry.list().into_iter().map(|j| j.scenario_id).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
