use crate::{
    config::WorkersConfig,
    correlation::RequestId,
    sink::{CAPTION_KIND, DETECTIONS_KIND},
    telemetry::{Metrics, DELIVERY_ABORTED, DELIVERY_FAILED, DELIVERY_OK, DELIVERY_TIMED_OUT},
};
use std::{fmt::Display, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Caption,
    Detections,
}

impl DeliveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryKind::Caption => CAPTION_KIND,
            DeliveryKind::Detections => DETECTIONS_KIND,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => DELIVERY_OK,
            TaskOutcome::Failed => DELIVERY_FAILED,
            TaskOutcome::TimedOut => DELIVERY_TIMED_OUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Background pool is shutting down")]
    Closed,
}

/// Keeps the in-flight gauge and the outcome counter honest when a task
/// unwinds instead of returning.
struct TaskGuard {
    metrics: Arc<Metrics>,
    kind: DeliveryKind,
    id: RequestId,
    finished: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(id = %self.id, kind = self.kind.as_str(), "Delivery aborted");
            self.metrics
                .record_delivery(self.kind.as_str(), DELIVERY_ABORTED);
        }
        self.metrics.task_finished();
    }
}

/// Bounded set of background delivery tasks.
///
/// Each delivery kind has its own `max_background_tasks` permits, so caption
/// deliveries never queue behind detection deliveries. Submitting never
/// waits: each task is spawned immediately and waits for a permit on its own.
/// A task's timeout runs from submission, time spent queued included.
#[derive(Clone)]
pub struct BackgroundPool {
    tracker: TaskTracker,
    caption_permits: Arc<Semaphore>,
    detection_permits: Arc<Semaphore>,
    task_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl BackgroundPool {
    pub fn new(config: &WorkersConfig, metrics: Arc<Metrics>) -> Self {
        let permits = config.max_background_tasks.max(1);
        Self {
            tracker: TaskTracker::new(),
            caption_permits: Arc::new(Semaphore::new(permits)),
            detection_permits: Arc::new(Semaphore::new(permits)),
            task_timeout: config.get_task_timeout(),
            metrics,
        }
    }

    fn permits(&self, kind: DeliveryKind) -> Arc<Semaphore> {
        match kind {
            DeliveryKind::Caption => self.caption_permits.clone(),
            DeliveryKind::Detections => self.detection_permits.clone(),
        }
    }

    pub fn spawn<F, E>(
        &self,
        kind: DeliveryKind,
        id: RequestId,
        task: F,
    ) -> Result<JoinHandle<TaskOutcome>, PoolError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.tracker.is_closed() {
            tracing::warn!(%id, kind = kind.as_str(), "Rejecting background task, pool is closed");
            return Err(PoolError::Closed);
        }

        let permits = self.permits(kind);
        let task_timeout = self.task_timeout;
        self.metrics.task_started();
        let mut guard = TaskGuard {
            metrics: self.metrics.clone(),
            kind,
            id,
            finished: false,
        };

        Ok(self.tracker.spawn(async move {
            let started = Instant::now();
            let run = async move {
                let _permit = permits.acquire_owned().await.ok();
                task.await
            };

            let outcome = match timeout(task_timeout, run).await {
                Ok(Ok(())) => {
                    tracing::info!(%id, kind = kind.as_str(), "Delivery completed");
                    TaskOutcome::Completed
                }
                Ok(Err(e)) => {
                    tracing::error!(%id, kind = kind.as_str(), "Delivery failed: {}", e);
                    TaskOutcome::Failed
                }
                Err(_) => {
                    tracing::error!(
                        %id,
                        kind = kind.as_str(),
                        "Delivery timed out after {:?}",
                        task_timeout
                    );
                    TaskOutcome::TimedOut
                }
            };

            guard.finished = true;
            guard.metrics.record_delivery(kind.as_str(), outcome.as_str());
            guard
                .metrics
                .record_stage_duration(kind.as_str(), started.elapsed());
            outcome
        }))
    }

    /// Tasks submitted and not yet finished, queued ones included.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting tasks and waits up to `grace` for the rest to finish.
    /// Returns `false` when tasks were still running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!("Waiting for {} background tasks to finish", pending);
        }

        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "Shutdown grace period elapsed with {} background tasks still running",
                    self.tracker.len()
                );
                false
            }
        }
    }
}
