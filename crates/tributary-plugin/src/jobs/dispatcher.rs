//! Job dispatcher: claims due jobs and runs them on their plugin's
//! job handler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::{JobQueue, JobRequest};
use crate::error::PluginError;
use crate::invoke::guarded;
use crate::registry::PluginRegistry;

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
}

pub struct JobDispatcher {
    queue: JobQueue,
    registry: Arc<PluginRegistry>,
    poll_interval: Duration,
    batch_size: u64,
    handler_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        queue: JobQueue,
        registry: Arc<PluginRegistry>,
        poll_interval: Duration,
        batch_size: u64,
    ) -> Self {
        let handler_timeout = registry.handler_timeout();
        Self {
            queue,
            registry,
            poll_interval,
            batch_size,
            handler_timeout,
        }
    }

    /// Claim every job due at `now` (up to the batch size) and run them
    /// concurrently. Returns once all claimed jobs are marked done or failed.
    ///
    /// Only store failures are returned as errors; handler failures mark
    /// the job failed and are not retried.
    pub async fn dispatch_due(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<DispatchSummary, PluginError> {
        let mut set = JoinSet::new();
        let claimed = self.spawn_due(&mut set, now, self.batch_size).await?;
        let mut summary = DispatchSummary {
            claimed,
            ..Default::default()
        };

        while let Some(joined) = set.join_next().await {
            match self.settle(joined).await? {
                Some(true) => summary.done += 1,
                Some(false) => summary.failed += 1,
                None => {}
            }
        }

        Ok(summary)
    }

    pub async fn poll_once(&self) -> Result<DispatchSummary, PluginError> {
        self.dispatch_due(Utc::now()).await
    }

    /// Poll until `shutdown` flips to true. Wakes early when a due job is
    /// enqueued. Returns an error only on a runtime fault.
    ///
    /// Claimed jobs run in the background; a slow job holds one of the
    /// `batch_size` slots but does not delay claiming the next due jobs.
    /// On shutdown, jobs already running are awaited and recorded.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), PluginError> {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "job dispatcher started"
        );
        let wake = self.queue.wake().clone();
        let mut running: JoinSet<JobOutcome> = JoinSet::new();

        'poll: loop {
            if *shutdown.borrow() {
                break;
            }

            let free = self.batch_size.saturating_sub(running.len() as u64);
            if free > 0 {
                match self.spawn_due(&mut running, Utc::now(), free).await {
                    Ok(0) => {}
                    Ok(claimed) => {
                        tracing::debug!(claimed, running = running.len(), "jobs claimed");
                    }
                    Err(e) if e.is_runtime_fault() => {
                        tracing::error!(error = %e, "job dispatcher stopping on runtime fault");
                        return Err(e);
                    }
                    Err(e) => tracing::warn!(error = %e, "job dispatch pass failed"),
                }
            }

            let tick = tokio::time::sleep(self.poll_interval);
            tokio::pin!(tick);
            loop {
                tokio::select! {
                    _ = &mut tick => break,
                    _ = wake.notified() => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'poll;
                        }
                        break;
                    }
                    Some(joined) = running.join_next(), if !running.is_empty() => {
                        self.settle_in_loop(joined).await?;
                    }
                }
            }
        }

        if !running.is_empty() {
            tracing::info!(running = running.len(), "waiting for running jobs");
        }
        while let Some(joined) = running.join_next().await {
            self.settle_in_loop(joined).await?;
        }

        tracing::info!("job dispatcher stopped");
        Ok(())
    }

    /// Claim up to `limit` due jobs and spawn each onto `set`.
    async fn spawn_due(
        &self,
        set: &mut JoinSet<JobOutcome>,
        now: chrono::DateTime<Utc>,
        limit: u64,
    ) -> Result<usize, PluginError> {
        let jobs = self.queue.store().claim_due(now, limit).await?;
        let claimed = jobs.len();
        for job in jobs {
            let registry = self.registry.clone();
            let timeout = self.handler_timeout;
            let id = job.id;
            set.spawn(async move {
                let task = tokio::spawn(async move { run_job(&registry, job, timeout).await });
                (id, join_job(task).await)
            });
        }
        Ok(claimed)
    }

    /// Record the outcome of a finished job. `Some(true)` when marked done,
    /// `Some(false)` when marked failed, `None` when the task was aborted
    /// before reporting its job.
    async fn settle(
        &self,
        joined: Result<JobOutcome, tokio::task::JoinError>,
    ) -> Result<Option<bool>, PluginError> {
        let (id, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "job task aborted");
                return Ok(None);
            }
        };

        let store = self.queue.store();
        let finished_at = Utc::now();
        match result {
            Ok(()) => {
                store.mark_done(id, finished_at).await?;
                Ok(Some(true))
            }
            Err(e) => {
                store.mark_failed(id, finished_at, &e.to_string()).await?;
                Ok(Some(false))
            }
        }
    }

    async fn settle_in_loop(
        &self,
        joined: Result<JobOutcome, tokio::task::JoinError>,
    ) -> Result<(), PluginError> {
        match self.settle(joined).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_runtime_fault() => {
                tracing::error!(error = %e, "job dispatcher stopping on runtime fault");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to record job outcome");
                Ok(())
            }
        }
    }
}

type JobOutcome = (Uuid, Result<(), PluginError>);

/// Await a job task. A task that panicked or was cancelled counts as a
/// failed job so it never stays `running`.
async fn join_job(task: JoinHandle<Result<(), PluginError>>) -> Result<(), PluginError> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "job task did not complete");
            Err(PluginError::handler(format!("job task did not complete: {e}")))
        }
    }
}

async fn run_job(
    registry: &PluginRegistry,
    job: JobRequest,
    timeout: Duration,
) -> Result<(), PluginError> {
    let Some(plugin) = registry.get(job.plugin_id).await else {
        tracing::warn!(plugin_id = %job.plugin_id, job = %job.job_name, job_id = %job.id, "job for a plugin that is not loaded");
        return Err(PluginError::NotFound(job.plugin_id.to_string()));
    };

    let Some(handler) = plugin.module.job_handler(&job.job_name).cloned() else {
        tracing::warn!(plugin = %plugin.name, job = %job.job_name, job_id = %job.id, "unknown job");
        return Err(PluginError::UnknownJob {
            plugin: plugin.name.clone(),
            job: job.job_name,
        });
    };

    let function = format!("job {}", job.job_name);
    let fut = handler(job.payload, plugin.context.clone());
    match guarded(&plugin.name, &function, timeout, fut).await {
        Ok(()) => {
            tracing::debug!(plugin = %plugin.name, job = %job.job_name, job_id = %job.id, "job done");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(
                plugin = %plugin.name,
                plugin_id = %plugin.id,
                job = %job.job_name,
                job_id = %job.id,
                error = %e,
                "job failed"
            );
            Err(e)
        }
    }
}
