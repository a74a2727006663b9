//! Storage definitions and their cron timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common::Catalog;
use common::model::{Project, StorageDefinition};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulingError};
use crate::queue::{JobOutcome, JobQueue};
use crate::rule;

/// Builds the job a timer (or a manual trigger) runs for a storage.
pub trait JobLauncher: Send + Sync {
    fn launch(&self, storage: StorageDefinition) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// How a storage was registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Scheduled { expression: String },
    /// Runs only when triggered explicitly
    Manual,
}

type Storages = Arc<RwLock<HashMap<i32, StorageDefinition>>>;

/// Timer of a storage, tagged with the registration that owns the slot.
/// Only the latest registration of an id may install its timer.
struct TimerSlot {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Registered storages, one timer per storage id, and the job queue the
/// timers feed.
pub struct ScheduleRegistry {
    storages: Storages,
    timers: Mutex<HashMap<i32, TimerSlot>>,
    generations: AtomicU64,
    queue: Arc<JobQueue>,
    launcher: Arc<dyn JobLauncher>,
    timezone: Tz,
}

impl ScheduleRegistry {
    pub fn new(launcher: Arc<dyn JobLauncher>, timezone: Tz) -> Self {
        Self {
            storages: Arc::default(),
            timers: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            queue: Arc::new(JobQueue::new()),
            launcher,
            timezone,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Register every storage of a batch. Storages that cannot be scheduled
    /// are reported and skipped; the rest of the batch goes on.
    pub async fn register_batch(
        &self,
        storages: Vec<StorageDefinition>,
        projects: &[Project],
        catalog: &dyn Catalog,
    ) -> Vec<(i32, Result<Registration>)> {
        let mut outcomes = Vec::with_capacity(storages.len());
        for storage in storages {
            let id = storage.id;
            let outcome = self.register(storage, projects, catalog).await;
            match &outcome {
                Ok(Registration::Scheduled { expression }) => {
                    info!(storage_id = id, expression = %expression, "Storage scheduled")
                }
                Ok(Registration::Manual) => {
                    info!(storage_id = id, "Storage registered for manual runs")
                }
                Err(e) => warn!(storage_id = id, reason = %e, "Storage not scheduled"),
            }
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Store the definition and (re)arm its timer. Any previous timer of the
    /// same storage is retired first; when registrations of one id overlap,
    /// the one that started last owns the timer.
    pub async fn register(
        &self,
        storage: StorageDefinition,
        projects: &[Project],
        catalog: &dyn Catalog,
    ) -> Result<Registration> {
        let id = storage.id;
        let generation = self.claim_slot(&storage);

        if !storage.active {
            return Err(SchedulingError::InactiveStorage(id));
        }
        if let Some(project_id) = storage.project_id {
            if !project_active(project_id, projects, catalog).await? {
                return Err(SchedulingError::InactiveProject(project_id));
            }
        }

        if storage.is_manual() {
            self.set_timer(id, generation, None)?;
            return Ok(Registration::Manual);
        }

        // is_manual covers a missing schedule id
        let schedule_id = storage.schedule_id.unwrap_or_default();
        let rule = catalog
            .schedule(schedule_id)
            .await?
            .ok_or(SchedulingError::MissingSchedule(schedule_id))?;
        let (expression, schedule) = rule::compile(&rule)?;

        let timer = tokio::spawn(run_timer(
            id,
            schedule,
            self.timezone,
            self.storages.clone(),
            self.queue.clone(),
            self.launcher.clone(),
        ));
        self.set_timer(id, generation, Some(timer))?;
        Ok(Registration::Scheduled { expression })
    }

    /// Queue a run of a registered storage now.
    pub fn trigger(&self, storage_id: i32) -> Result<oneshot::Receiver<JobOutcome>> {
        let storage = self
            .get(storage_id)
            .ok_or(SchedulingError::UnknownStorage(storage_id))?;
        Ok(self.queue.enqueue(storage_id, self.launcher.launch(storage)))
    }

    pub fn get(&self, storage_id: i32) -> Option<StorageDefinition> {
        self.storages.read().ok()?.get(&storage_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.storages.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_timer(&self, storage_id: i32) -> bool {
        self.timers
            .lock()
            .map(|t| t.get(&storage_id).is_some_and(|slot| slot.timer.is_some()))
            .unwrap_or(false)
    }

    /// Number of live cron timers.
    pub fn timer_count(&self) -> usize {
        self.timers
            .lock()
            .map(|t| t.values().filter(|slot| slot.timer.is_some()).count())
            .unwrap_or(0)
    }

    /// Abort every timer. Jobs already queued keep running.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for timer in timers.drain().filter_map(|(_, slot)| slot.timer) {
                timer.abort();
            }
        }
    }

    /// Open a new registration of the storage: retire its timer, store the
    /// definition and return the generation that owns the slot from now on.
    fn claim_slot(&self, storage: &StorageDefinition) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut timers) = self.timers.lock() {
            let previous = timers.insert(
                storage.id,
                TimerSlot {
                    generation,
                    timer: None,
                },
            );
            if let Some(timer) = previous.and_then(|slot| slot.timer) {
                debug!(storage_id = storage.id, "Retiring previous timer");
                timer.abort();
            }
            if let Ok(mut storages) = self.storages.write() {
                storages.insert(storage.id, storage.clone());
            }
        }
        generation
    }

    /// Install the timer unless a newer registration took the slot, in which
    /// case the timer is aborted.
    fn set_timer(
        &self,
        storage_id: i32,
        generation: u64,
        timer: Option<JoinHandle<()>>,
    ) -> Result<()> {
        let Ok(mut timers) = self.timers.lock() else {
            if let Some(timer) = timer {
                timer.abort();
            }
            return Err(SchedulingError::Superseded(storage_id));
        };
        match timers.get_mut(&storage_id) {
            Some(slot) if slot.generation == generation => {
                if let Some(previous) = std::mem::replace(&mut slot.timer, timer) {
                    previous.abort();
                }
                Ok(())
            }
            _ => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                Err(SchedulingError::Superseded(storage_id))
            }
        }
    }
}

impl Drop for ScheduleRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The batch's own project list wins; projects it does not carry are
/// looked up in the catalog. Unknown projects count as inactive.
async fn project_active(
    project_id: i32,
    projects: &[Project],
    catalog: &dyn Catalog,
) -> Result<bool> {
    if let Some(project) = projects.iter().find(|p| p.id == project_id) {
        return Ok(project.active);
    }
    Ok(catalog.project_active(project_id).await?.unwrap_or(false))
}

/// Fire the storage's job at every schedule tick, waiting for each run to
/// finish before arming again.
async fn run_timer(
    storage_id: i32,
    schedule: Schedule,
    timezone: Tz,
    storages: Storages,
    queue: Arc<JobQueue>,
    launcher: Arc<dyn JobLauncher>,
) {
    let mut last_fire: Option<DateTime<Tz>> = None;
    loop {
        let now = Utc::now().with_timezone(&timezone);
        let from = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule.after(&from).next() else {
            warn!(storage_id, "Schedule has no upcoming ticks, timer stopped");
            return;
        };

        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::time::sleep(wait).await;
        last_fire = Some(next);

        let storage = storages
            .read()
            .ok()
            .and_then(|storages| storages.get(&storage_id).cloned());
        let Some(storage) = storage else {
            debug!(storage_id, "Storage no longer registered, timer stopped");
            return;
        };
        if !storage.active {
            debug!(storage_id, "Storage deactivated, timer stopped");
            return;
        }

        debug!(storage_id, tick = %next, "Timer fired");
        let done = queue.enqueue(storage_id, launcher.launch(storage));
        if let Ok(outcome) = done.await {
            debug!(storage_id, ?outcome, "Scheduled run finished");
        }
    }
}
