use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify, Semaphore};

use crate::error::ApiError;
use crate::progress::JobProgress;

const EVENT_BUFFER: usize = 256;
const KEEP_FINISHED: usize = 256;

pub type JobId = String;

/// What a job writes to. At most one job per key is active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum JobKey {
    Game(String),
    Proton(String),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Game(id) => write!(f, "game `{id}`"),
            JobKey::Proton(v) => write!(f, "proton `{v}`"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    InstallGame,
    UninstallGame,
    InstallProton,
    UninstallProton,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::InstallGame => "install",
            JobKind::UninstallGame => "uninstall",
            JobKind::InstallProton => "proton install",
            JobKind::UninstallProton => "proton uninstall",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// Snapshot of a job as seen by callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub key: JobKey,
    pub kind: JobKind,
    pub state: JobState,
    /// 0.0..=1.0
    pub progress: f64,
    pub detail: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What happens when a job is submitted for a key that already has one running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPolicy {
    /// Fail with `Conflict`.
    Reject,
    /// Hand back the active job when it is of the same kind, else `Conflict`.
    Coalesce,
}

struct JobEntry {
    tx: watch::Sender<Job>,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

#[derive(Default)]
struct Table {
    jobs: HashMap<JobId, JobEntry>,
    active: HashMap<JobKey, JobId>,
    order: VecDeque<JobId>,
}

struct EngineInner {
    table: Mutex<Table>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<Job>,
}

/// Handed to the work of a running job.
pub struct JobContext {
    id: JobId,
    cancel: Arc<AtomicBool>,
    engine: Arc<EngineInner>,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn check_cancelled(&self) -> Result<(), ApiError> {
        if self.is_cancelled() {
            Err(ApiError::install("cancelled"))
        } else {
            Ok(())
        }
    }

    pub fn report(&self, progress: JobProgress) {
        self.engine.publish(&self.id, |job| {
            job.progress = progress.fraction();
            job.detail = Some(progress);
        });
    }
}

/// Runs install/uninstall work in the background, one active job per key.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

impl JobEngine {
    pub fn new(max_parallel: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(EngineInner {
                table: Mutex::new(Table::default()),
                permits: Arc::new(Semaphore::new(max_parallel.max(1))),
                events,
            }),
        }
    }

    /// Registers a job for `key` and starts `work` on its own task.
    ///
    /// Returns immediately with the `Pending` snapshot.
    pub fn submit<F, Fut>(
        &self,
        key: JobKey,
        kind: JobKind,
        policy: SubmitPolicy,
        work: F,
    ) -> Result<Job, ApiError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let (job, ctx, notify) = {
            let mut table = self.inner.lock();
            if let Some(active_id) = table.active.get(&key) {
                let existing = table
                    .jobs
                    .get(active_id)
                    .map(|e| e.tx.borrow().clone())
                    .ok_or_else(|| ApiError::NotFound(active_id.clone()))?;
                if policy == SubmitPolicy::Coalesce && existing.kind == kind {
                    log::debug!("joining active {kind} job {} for {key}", existing.id);
                    return Ok(existing);
                }
                return Err(ApiError::conflict(format!(
                    "a {} job for {key} is already active ({})",
                    existing.kind, existing.id
                )));
            }

            let job = Job {
                id: uuid::Uuid::new_v4().to_string(),
                key: key.clone(),
                kind,
                state: JobState::Pending,
                progress: 0.0,
                detail: None,
                created_at: Utc::now(),
                finished_at: None,
            };
            let cancel = Arc::new(AtomicBool::new(false));
            let cancel_notify = Arc::new(Notify::new());
            let (tx, _) = watch::channel(job.clone());
            table.jobs.insert(
                job.id.clone(),
                JobEntry {
                    tx,
                    cancel: cancel.clone(),
                    cancel_notify: cancel_notify.clone(),
                },
            );
            table.active.insert(key, job.id.clone());
            table.order.push_back(job.id.clone());
            table.prune();

            let ctx = JobContext {
                id: job.id.clone(),
                cancel,
                engine: self.inner.clone(),
            };
            (job, ctx, cancel_notify)
        };

        log::info!("{} job {} queued for {}", job.kind, job.id, job.key);
        let _ = self.inner.events.send(job.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(ctx, notify, work).await;
        });
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        let table = self.inner.lock();
        table.jobs.get(id).map(|e| e.tx.borrow().clone())
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let table = self.inner.lock();
        table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .map(|e| e.tx.borrow().clone())
            .collect()
    }

    pub fn running(&self) -> Vec<Job> {
        self.list()
            .into_iter()
            .filter(|j| j.state == JobState::Running)
            .collect()
    }

    /// The non-terminal job holding `key`, if any.
    pub fn active_for(&self, key: &JobKey) -> Option<Job> {
        let table = self.inner.lock();
        let id = table.active.get(key)?;
        table.jobs.get(id).map(|e| e.tx.borrow().clone())
    }

    /// Every snapshot change of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.inner.events.subscribe()
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<Job, ApiError> {
        let mut rx = {
            let table = self.inner.lock();
            table
                .jobs
                .get(id)
                .map(|e| e.tx.subscribe())
                .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?
        };
        let job = rx
            .wait_for(|j| j.state.is_terminal())
            .await
            .map_err(|_| ApiError::NotFound(format!("job {id}")))?;
        Ok(job.clone())
    }

    /// Asks a job to stop. Finished jobs are returned unchanged.
    pub fn cancel(&self, id: &str) -> Result<Job, ApiError> {
        let table = self.inner.lock();
        let entry = table
            .jobs
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("job {id}")))?;
        let job = entry.tx.borrow().clone();
        if !job.state.is_terminal() {
            log::info!("cancel requested for job {id}");
            entry.cancel.store(true, Ordering::Relaxed);
            entry.cancel_notify.notify_one();
        }
        Ok(job)
    }
}

impl Table {
    /// Drops the oldest finished jobs beyond `KEEP_FINISHED`.
    fn prune(&mut self) {
        let mut finished = self
            .order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .is_some_and(|e| e.tx.borrow().state.is_terminal())
            })
            .count();
        while finished > KEEP_FINISHED {
            let Some(pos) = self.order.iter().position(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|e| e.tx.borrow().state.is_terminal())
            }) else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.jobs.remove(&id);
            }
            finished -= 1;
        }
    }
}

impl EngineInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, id: &str, f: impl FnOnce(&mut Job)) {
        let snapshot = {
            let table = self.lock();
            let Some(entry) = table.jobs.get(id) else {
                return;
            };
            entry.tx.send_modify(f);
            let job = entry.tx.borrow().clone();
            job
        };
        let _ = self.events.send(snapshot);
    }

    async fn run<F, Fut>(self: Arc<Self>, ctx: JobContext, cancel_notify: Arc<Notify>, work: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let id = ctx.id.clone();

        // Pending until a slot frees up or the job is cancelled.
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = cancel_notify.notified() => None,
        };
        let Some(permit) = permit.filter(|_| !ctx.is_cancelled()) else {
            self.finish(&id, Err(ApiError::install("cancelled")));
            return;
        };

        self.publish(&id, |job| job.state = JobState::Running);
        log::info!("job {id} running");

        // Run on a nested task so a panic in the work still settles the job.
        let outcome = match tokio::spawn(work(ctx)).await {
            Ok(result) => result,
            Err(e) => Err(ApiError::install(format!("job aborted: {e}"))),
        };
        drop(permit);
        self.finish(&id, outcome);
    }

    fn finish(&self, id: &str, outcome: Result<(), ApiError>) {
        let snapshot = {
            let mut table = self.lock();
            let Some(entry) = table.jobs.get(id) else {
                return;
            };
            entry.tx.send_modify(|job| {
                job.finished_at = Some(Utc::now());
                match &outcome {
                    Ok(()) => {
                        job.state = JobState::Succeeded;
                        job.progress = 1.0;
                    }
                    Err(e) => job.state = JobState::Failed(e.reason()),
                }
            });
            let job = entry.tx.borrow().clone();
            if table.active.get(&job.key).is_some_and(|a| a == id) {
                table.active.remove(&job.key);
            }
            job
        };

        match &snapshot.state {
            JobState::Failed(reason) => {
                log::warn!("{} job {} for {} failed: {reason}", snapshot.kind, id, snapshot.key)
            }
            _ => log::info!("{} job {} for {} succeeded", snapshot.kind, id, snapshot.key),
        }
        let _ = self.events.send(snapshot);
    }
}
