use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

pub const PRODUCT_UPLOAD: &str = "product_upload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    ReceiveImage,
    ProcessImage,
    PromptForText,
    ReceiveData,
    CreateListing,
    PublishFeedPost,
    NotifySender,
}

impl StepName {
    pub fn order(&self) -> u32 {
        match self {
            StepName::ReceiveImage => 1,
            StepName::ProcessImage => 2,
            StepName::PromptForText => 3,
            StepName::ReceiveData => 4,
            StepName::CreateListing => 5,
            StepName::PublishFeedPost => 6,
            StepName::NotifySender => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::ReceiveImage => "receive-image",
            StepName::ProcessImage => "process-image",
            StepName::PromptForText => "prompt-for-text",
            StepName::ReceiveData => "receive-data",
            StepName::CreateListing => "create-listing",
            StepName::PublishFeedPost => "publish-feed-post",
            StepName::NotifySender => "notify-sender",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    InProgress,
    Done,
    Degraded,
    Rejected,
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStep {
    pub name: StepName,
    pub order: u32,
    pub status: StepStatus,
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub workflow_id: Uuid,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sender_id: String,
    pub outcome: RunOutcome,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn is_open(&self) -> bool {
        self.outcome == RunOutcome::InProgress
    }

    pub fn step(&self, name: StepName) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.name == name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("workflow {0} not found")]
    UnknownRun(Uuid),
    #[error("workflow {0} already finished")]
    Finished(Uuid),
    #[error("step `{step}` cannot follow `{last}`")]
    OutOfOrder {
        step: &'static str,
        last: &'static str,
    },
    #[error("step `{0}` was never started")]
    UnknownStep(&'static str),
    #[error("step `{0}` already settled")]
    AlreadySettled(&'static str),
}

/// Observational record of upload attempts. Callers log errors and carry on;
/// nothing here may change an orchestration outcome.
#[async_trait]
pub trait WorkflowTracker: Send + Sync {
    async fn start_run(&self, sender_id: &str) -> Result<Uuid, TrackerError>;

    async fn begin_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError>;

    async fn complete_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError>;

    async fn fail_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError>;

    async fn finish_run(&self, run: Uuid, outcome: RunOutcome) -> Result<(), TrackerError>;

    async fn get(&self, run: Uuid) -> Option<WorkflowRun>;
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

struct Tracked {
    run: WorkflowRun,
    touched: Instant,
}

/// Runs idle past `stale_after` are abandoned by the sweep; finished runs are
/// dropped once `retention` has passed.
#[derive(Clone)]
pub struct InMemoryWorkflowTracker {
    runs: Arc<Mutex<HashMap<Uuid, Tracked>>>,
    retention: Duration,
    stale_after: Duration,
}

impl Default for InMemoryWorkflowTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION, DEFAULT_STALE_AFTER)
    }
}

impl InMemoryWorkflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration, stale_after: Duration) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            retention,
            stale_after,
        }
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = tracker.sweep().await;
                if removed > 0 {
                    debug!(target = "intake.workflow", removed, "finished workflow runs evicted");
                }
            }
        })
    }

    /// Abandons stale open runs and evicts expired finished ones.
    /// Returns how many runs were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.runs.lock().await;
        for tracked in guard.values_mut() {
            if tracked.run.is_open() && now.duration_since(tracked.touched) >= self.stale_after {
                tracked.run.outcome = RunOutcome::Abandoned;
                tracked.run.finished_at = Some(Utc::now());
                tracked.touched = now;
            }
        }
        let before = guard.len();
        guard.retain(|_, tracked| {
            tracked.run.is_open() || now.duration_since(tracked.touched) < self.retention
        });
        before - guard.len()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    fn open_record<'a>(
        guard: &'a mut HashMap<Uuid, Tracked>,
        run: Uuid,
    ) -> Result<&'a mut Tracked, TrackerError> {
        let tracked = guard.get_mut(&run).ok_or(TrackerError::UnknownRun(run))?;
        if !tracked.run.is_open() {
            return Err(TrackerError::Finished(run));
        }
        tracked.touched = Instant::now();
        Ok(tracked)
    }

    async fn settle(
        &self,
        run: Uuid,
        name: StepName,
        status: StepStatus,
        metadata: Value,
    ) -> Result<(), TrackerError> {
        let mut guard = self.runs.lock().await;
        let record = &mut Self::open_record(&mut guard, run)?.run;
        let step = record
            .steps
            .iter_mut()
            .find(|step| step.name == name)
            .ok_or(TrackerError::UnknownStep(name.as_str()))?;
        if step.status != StepStatus::Pending {
            return Err(TrackerError::AlreadySettled(name.as_str()));
        }
        step.status = status;
        step.finished_at = Some(Utc::now());
        merge_metadata(&mut step.metadata, metadata);
        Ok(())
    }
}

#[async_trait]
impl WorkflowTracker for InMemoryWorkflowTracker {
    async fn start_run(&self, sender_id: &str) -> Result<Uuid, TrackerError> {
        let id = Uuid::new_v4();
        let run = WorkflowRun {
            workflow_id: id,
            kind: PRODUCT_UPLOAD,
            sender_id: sender_id.to_string(),
            outcome: RunOutcome::InProgress,
            steps: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.runs.lock().await.insert(
            id,
            Tracked {
                run,
                touched: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn begin_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError> {
        let mut guard = self.runs.lock().await;
        let record = &mut Self::open_record(&mut guard, run)?.run;
        if let Some(last) = record.steps.last()
            && last.order >= step.order()
        {
            return Err(TrackerError::OutOfOrder {
                step: step.as_str(),
                last: last.name.as_str(),
            });
        }
        record.steps.push(WorkflowStep {
            name: step,
            order: step.order(),
            status: StepStatus::Pending,
            metadata,
            started_at: Utc::now(),
            finished_at: None,
        });
        Ok(())
    }

    async fn complete_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError> {
        self.settle(run, step, StepStatus::Completed, metadata).await
    }

    async fn fail_step(
        &self,
        run: Uuid,
        step: StepName,
        metadata: Value,
    ) -> Result<(), TrackerError> {
        self.settle(run, step, StepStatus::Failed, metadata).await
    }

    async fn finish_run(&self, run: Uuid, outcome: RunOutcome) -> Result<(), TrackerError> {
        let mut guard = self.runs.lock().await;
        let record = &mut Self::open_record(&mut guard, run)?.run;
        record.outcome = outcome;
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, run: Uuid) -> Option<WorkflowRun> {
        self.runs
            .lock()
            .await
            .get(&run)
            .map(|tracked| tracked.run.clone())
    }
}

fn merge_metadata(target: &mut Value, extra: Value) {
    match (target, extra) {
        (Value::Object(target), Value::Object(extra)) => {
            target.extend(extra);
        }
        (_, Value::Null) => {}
        (target, extra) => *target = extra,
    }
}

/// Wraps a tracker so every recording error is logged and swallowed.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<dyn WorkflowTracker>,
}

impl Recorder {
    pub fn new(inner: Arc<dyn WorkflowTracker>) -> Self {
        Self { inner }
    }

    pub async fn start(&self, sender_id: &str) -> Option<Uuid> {
        match self.inner.start_run(sender_id).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target = "intake.workflow", sender = %sender_id, error = %err, "workflow_start_failed");
                None
            }
        }
    }

    /// Returns the run when it exists and is still open.
    pub async fn open_run(&self, run: Uuid) -> Option<Uuid> {
        self.inner
            .get(run)
            .await
            .filter(WorkflowRun::is_open)
            .map(|record| record.workflow_id)
    }

    pub async fn begin(&self, run: Option<Uuid>, step: StepName, metadata: Value) {
        let Some(run) = run else { return };
        log_failure(run, step, self.inner.begin_step(run, step, metadata).await);
    }

    pub async fn complete(&self, run: Option<Uuid>, step: StepName, metadata: Value) {
        let Some(run) = run else { return };
        log_failure(run, step, self.inner.complete_step(run, step, metadata).await);
    }

    pub async fn fail(&self, run: Option<Uuid>, step: StepName, metadata: Value) {
        let Some(run) = run else { return };
        log_failure(run, step, self.inner.fail_step(run, step, metadata).await);
    }

    /// Begins and immediately settles a step whose work already happened.
    pub async fn record(&self, run: Option<Uuid>, step: StepName, metadata: Value) {
        self.begin(run, step, Value::Null).await;
        self.complete(run, step, metadata).await;
    }

    pub async fn finish(&self, run: Option<Uuid>, outcome: RunOutcome) {
        let Some(run) = run else { return };
        if let Err(err) = self.inner.finish_run(run, outcome).await {
            warn!(target = "intake.workflow", workflow = %run, error = %err, "workflow_finish_failed");
        }
    }
}

fn log_failure(run: Uuid, step: StepName, result: Result<(), TrackerError>) {
    if let Err(err) = result {
        warn!(
            target = "intake.workflow",
            workflow = %run,
            step = step.as_str(),
            error = %err,
            "workflow_record_failed"
        );
    }
}
