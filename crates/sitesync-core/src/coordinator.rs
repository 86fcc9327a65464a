//! Serialized, retrying publish runs per site.
//!
//! Per-site state machine:
//! ```text
//! Idle -> Queued -> Running -> Completed -> Idle
//!                      |
//!                      +-> Failed -> Queued   (retryable error, attempts left)
//!                      +-> Failed -> Idle     (terminal)
//! ```
//! A site has at most one active job; a second request is rejected with
//! `SyncError::SyncBusy` until the first one is terminal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::TargetDescriptor;
use crate::deadline::with_deadline;
use crate::error::SyncError;
use crate::events::{EventLevel, EventSink, Phase};
use crate::lock::SiteLocks;
use crate::publish::{PublishOutcome, Publisher, WorkspaceSnapshot};
use crate::workspace::WorkspaceRegistry;

/// Default number of terminal jobs kept for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Automatic retry of connectivity and timeout failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles for each further attempt
    pub base_delay: Duration,
    /// Upper bound of a single delay
    pub max_delay: Duration,
    /// Deadline of one publish attempt when the request does not set one
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// Synchronization state of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteSyncState {
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
}

/// One publish attempt of a job.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<SyncError>,
}

/// One synchronization request and everything that happened to it.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub id: Uuid,
    pub site_key: String,
    pub target_key: String,
    pub target_type: String,
    /// Workspace that was published (set once an attempt took a snapshot)
    pub workspace_key: Option<String>,
    pub attempt_count: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<SyncError>,
    pub outcome: Option<PublishOutcome>,
    pub attempts: Vec<AttemptRecord>,
}

impl PublishJob {
    fn new(site_key: &str, target: &TargetDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_key: site_key.to_string(),
            target_key: target.effective_key().to_string(),
            target_type: target.target_type.clone(),
            workspace_key: None,
            attempt_count: 0,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            outcome: None,
            attempts: Vec::new(),
        }
    }
}

/// Caller's view of a submitted job.
#[derive(Debug)]
pub struct PublishHandle {
    job_id: Uuid,
    site_key: String,
    rx: watch::Receiver<PublishJob>,
    cancel: CancellationToken,
}

impl PublishHandle {
    pub fn id(&self) -> Uuid {
        self.job_id
    }

    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    /// Latest state of the job.
    pub fn current(&self) -> PublishJob {
        self.rx.borrow().clone()
    }

    /// Ask the job to stop. Pending jobs abort right away; a running publisher
    /// stops at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job is terminal.
    pub async fn wait(mut self) -> PublishJob {
        let waited = self
            .rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .map(|job| job.clone());
        waited.unwrap_or_else(|_| self.rx.borrow().clone())
    }
}

struct ActiveJob {
    job_id: Uuid,
    state: SiteSyncState,
    cancel: CancellationToken,
    rx: watch::Receiver<PublishJob>,
}

struct Inner {
    workspaces: Arc<WorkspaceRegistry>,
    locks: Arc<SiteLocks>,
    events: EventSink,
    policy: RetryPolicy,
    history_limit: AtomicUsize,
    /// site_key -> the site's only active job
    active: DashMap<String, ActiveJob>,
    /// Terminal jobs, oldest first
    history: Mutex<VecDeque<PublishJob>>,
}

/// Runs publish jobs, one at a time per site.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        workspaces: Arc<WorkspaceRegistry>,
        locks: Arc<SiteLocks>,
        events: EventSink,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspaces,
                locks,
                events,
                policy,
                history_limit: AtomicUsize::new(DEFAULT_HISTORY_LIMIT),
                active: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Change how many terminal jobs are retained.
    ///
    /// The limit is shared by every clone of this coordinator.
    pub fn with_history_limit(self, history_limit: usize) -> Self {
        self.inner
            .history_limit
            .store(history_limit, Ordering::Relaxed);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Submit a publish run for `site_key` and start it in the background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `SyncError::SyncBusy` if the site already has an active job; no job is
    /// created in that case.
    pub fn request_publish(
        &self,
        site_key: &str,
        publisher: Arc<dyn Publisher>,
        target: TargetDescriptor,
        deadline: Option<Duration>,
    ) -> Result<PublishHandle, SyncError> {
        let job = PublishJob::new(site_key, &target);
        let job_id = job.id;
        let (tx, rx) = watch::channel(job.clone());
        let cancel = CancellationToken::new();

        match self.inner.active.entry(site_key.to_string()) {
            Entry::Occupied(_) => {
                self.inner.events.emit(
                    site_key,
                    Phase::Queue,
                    EventLevel::Warn,
                    format!(
                        "Rejected publish to {}: another publish is in progress",
                        target.effective_key()
                    ),
                );
                return Err(SyncError::SyncBusy {
                    site_key: site_key.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveJob {
                    job_id,
                    state: SiteSyncState::Queued,
                    cancel: cancel.clone(),
                    rx: rx.clone(),
                });
            }
        }

        self.inner.events.emit(
            site_key,
            Phase::Queue,
            EventLevel::Info,
            format!(
                "Queued publish {} to {} ({})",
                job_id,
                target.effective_key(),
                target.target_type
            ),
        );

        let deadline = deadline.or(self.inner.policy.attempt_timeout);
        let inner = self.inner.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            inner
                .run(job, publisher, target, deadline, tx, task_cancel)
                .await;
        });

        Ok(PublishHandle {
            job_id,
            site_key: site_key.to_string(),
            rx,
            cancel,
        })
    }

    /// Current synchronization state of a site.
    pub fn site_state(&self, site_key: &str) -> SiteSyncState {
        self.inner
            .active
            .get(site_key)
            .map(|a| a.state)
            .unwrap_or(SiteSyncState::Idle)
    }

    /// Look up an active or retained job.
    pub fn job(&self, job_id: Uuid) -> Option<PublishJob> {
        if let Some(active) = self.inner.active.iter().find(|a| a.job_id == job_id) {
            return Some(active.rx.borrow().clone());
        }
        self.inner
            .history()
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Retained terminal jobs, oldest first.
    pub fn history(&self) -> Vec<PublishJob> {
        self.inner.history().iter().cloned().collect()
    }

    /// Cancel a job. Cancelling a job that already finished does nothing.
    ///
    /// # Errors
    /// `SyncError::NotFound` if the job is neither active nor retained.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), SyncError> {
        if let Some(active) = self.inner.active.iter().find(|a| a.job_id == job_id) {
            active.cancel.cancel();
            return Ok(());
        }
        if self.inner.history().iter().any(|j| j.id == job_id) {
            return Ok(());
        }
        Err(SyncError::NotFound(format!("publish job {}", job_id)))
    }
}

impl Inner {
    fn history(&self) -> std::sync::MutexGuard<'_, VecDeque<PublishJob>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_site_state(&self, site_key: &str, job_id: Uuid, state: SiteSyncState) {
        if let Some(mut active) = self.active.get_mut(site_key) {
            if active.job_id == job_id {
                active.state = state;
            }
        }
    }

    #[instrument(
        skip(self, job, publisher, target, tx, cancel),
        fields(site = %job.site_key, job_id = %job.id),
        level = "debug"
    )]
    async fn run(
        self: Arc<Self>,
        mut job: PublishJob,
        publisher: Arc<dyn Publisher>,
        target: TargetDescriptor,
        deadline: Option<Duration>,
        tx: watch::Sender<PublishJob>,
        cancel: CancellationToken,
    ) {
        let site_key = job.site_key.clone();

        loop {
            let guard = tokio::select! {
                guard = self.locks.acquire(&site_key) => guard,
                _ = cancel.cancelled() => {
                    job.status = JobStatus::Aborted;
                    break;
                }
            };

            if cancel.is_cancelled() {
                job.status = JobStatus::Aborted;
                break;
            }

            job.attempt_count += 1;
            job.status = JobStatus::Running;
            job.started_at.get_or_insert_with(Utc::now);
            self.set_site_state(&site_key, job.id, SiteSyncState::Running);
            tx.send_replace(job.clone());

            self.events.emit(
                &site_key,
                Phase::Publish,
                EventLevel::Info,
                format!(
                    "Publishing to {} (attempt {}/{})",
                    job.target_key, job.attempt_count, self.policy.max_attempts
                ),
            );

            let attempt_started = Utc::now();
            let result = self
                .attempt(&mut job, publisher.as_ref(), &target, deadline, &cancel)
                .await;
            drop(guard);

            job.attempts.push(AttemptRecord {
                attempt: job.attempt_count,
                started_at: attempt_started,
                finished_at: Utc::now(),
                error: result.as_ref().err().cloned(),
            });

            match result {
                Ok(outcome) => {
                    self.events.emit(
                        &site_key,
                        Phase::Complete,
                        EventLevel::Info,
                        format!(
                            "Published to {}: {} file(s) changed, {} byte(s) transferred",
                            job.target_key, outcome.files_changed, outcome.bytes_transferred
                        ),
                    );
                    for warning in &outcome.warnings {
                        self.events
                            .emit(&site_key, Phase::Complete, EventLevel::Warn, warning.clone());
                    }
                    job.status = JobStatus::Succeeded;
                    job.last_error = None;
                    job.outcome = Some(outcome);
                    break;
                }
                Err(SyncError::Cancelled) => {
                    job.status = JobStatus::Aborted;
                    job.last_error = Some(SyncError::Cancelled);
                    break;
                }
                Err(e) if e.is_retryable() && job.attempt_count < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(job.attempt_count);
                    self.events.emit(
                        &site_key,
                        Phase::Retry,
                        EventLevel::Warn,
                        format!(
                            "Attempt {} failed ({}), retrying in {}ms",
                            job.attempt_count,
                            e,
                            delay.as_millis()
                        ),
                    );
                    job.status = JobStatus::Pending;
                    job.last_error = Some(e);
                    self.set_site_state(&site_key, job.id, SiteSyncState::Queued);
                    tx.send_replace(job.clone());

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            job.status = JobStatus::Aborted;
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.events.emit(
                        &site_key,
                        Phase::Fail,
                        EventLevel::Error,
                        format!(
                            "Publish to {} failed after {} attempt(s): {}",
                            job.target_key, job.attempt_count, e
                        ),
                    );
                    job.status = JobStatus::Failed;
                    job.last_error = Some(e);
                    break;
                }
            }
        }

        if job.status == JobStatus::Aborted {
            self.events.emit(
                &site_key,
                Phase::Cancel,
                EventLevel::Warn,
                format!("Publish to {} cancelled", job.target_key),
            );
        }

        let final_state = if job.status == JobStatus::Succeeded {
            SiteSyncState::Completed
        } else {
            SiteSyncState::Failed
        };
        self.set_site_state(&site_key, job.id, final_state);
        job.finished_at = Some(Utc::now());
        self.finish(job, tx);
    }

    /// Snapshot the workspace and run the publisher once. Called with the
    /// site lock held.
    async fn attempt(
        &self,
        job: &mut PublishJob,
        publisher: &dyn Publisher,
        target: &TargetDescriptor,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, SyncError> {
        let workspace = match target.workspace.as_deref() {
            Some(key) => self.workspaces.get(&job.site_key, key)?,
            None => self.workspaces.first_mounted(&job.site_key).ok_or_else(|| {
                SyncError::NotFound(format!("no mounted workspace for site '{}'", job.site_key))
            })?,
        };

        let content = match (&workspace.content, workspace.is_mounted()) {
            (Some(content), true) => content.clone(),
            _ => {
                return Err(SyncError::NotMounted {
                    site_key: job.site_key.clone(),
                    workspace: workspace.key.clone(),
                })
            }
        };

        job.workspace_key = Some(workspace.key.clone());
        let snapshot = WorkspaceSnapshot {
            site_key: job.site_key.clone(),
            workspace_key: workspace.key,
            root: content.root,
            revision: content.revision,
        };

        debug!(
            "Publishing {} of site {} from {}",
            snapshot.workspace_key,
            snapshot.site_key,
            snapshot.root.display()
        );

        with_deadline(
            "publish",
            deadline,
            publisher.publish(&snapshot, target, cancel),
        )
        .await
    }

    /// Retain the terminal job, free the site and notify waiters, in that
    /// order, so a finished job is always findable and the site is free by
    /// the time `wait()` returns.
    fn finish(&self, job: PublishJob, tx: watch::Sender<PublishJob>) {
        {
            let mut history = self.history();
            history.push_back(job.clone());
            let limit = self.history_limit.load(Ordering::Relaxed);
            while history.len() > limit {
                history.pop_front();
            }
        }

        self.active
            .remove_if(&job.site_key, |_, active| active.job_id == job.id);

        debug!(
            "Publish job {} for site {} finished as {:?}",
            job.id, job.site_key, job.status
        );
        tx.send_replace(job);
    }
}
