//! Persistence for job requests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use tributary_db::entities::plugin_job;
use uuid::Uuid;

use super::{JobRequest, JobStatus};
use crate::error::PluginError;

/// Operations all job stores must implement.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &JobRequest) -> Result<(), PluginError>;

    /// Move up to `limit` due pending jobs to `running` and return them.
    ///
    /// The transition is conditional on the job still being pending, so
    /// concurrent callers never receive the same job.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError>;

    async fn mark_done(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PluginError>;

    async fn mark_failed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PluginError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>, PluginError>;

    /// Most recently scheduled jobs of one plugin first.
    async fn list_for_plugin(
        &self,
        plugin_id: Uuid,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError>;

    /// Return jobs left `running` by a previous process to `pending`.
    async fn requeue_running(&self) -> Result<u64, PluginError>;
}

// ─── In-memory store ────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRequest>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), PluginError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| PluginError::JobStore(format!("job {id} not found")))?;
        job.status = status;
        job.finished_at = Some(at);
        job.error = error.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRequest) -> Result<(), PluginError> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError> {
        let mut jobs = self.jobs.lock();
        let mut due: Vec<&mut JobRequest> = jobs.values_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by_key(|j| j.scheduled_at);

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|job| {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn mark_done(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PluginError> {
        self.finish(id, JobStatus::Done, at, None)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PluginError> {
        self.finish(id, JobStatus::Failed, at, Some(error))
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>, PluginError> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn list_for_plugin(
        &self,
        plugin_id: Uuid,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError> {
        let mut jobs: Vec<JobRequest> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.plugin_id == plugin_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(jobs)
    }

    async fn requeue_running(&self) -> Result<u64, PluginError> {
        let mut count = 0;
        for job in self.jobs.lock().values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }
}

// ─── Database store ─────────────────────────────────────────────────

/// Job store over the `plugin_jobs` table.
#[derive(Debug, Clone)]
pub struct DbJobStore {
    db: DatabaseConnection,
}

impl DbJobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, PluginError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| PluginError::JobStore(format!("invalid timestamp {ms}")))
}

fn to_request(model: plugin_job::Model) -> Result<JobRequest, PluginError> {
    Ok(JobRequest {
        id: model.id,
        plugin_id: model.plugin_id,
        job_name: model.job_name,
        payload: model
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        status: model.status.parse()?,
        scheduled_at: from_millis(model.scheduled_at)?,
        created_at: from_millis(model.created_at)?,
        started_at: model.started_at.map(from_millis).transpose()?,
        finished_at: model.finished_at.map(from_millis).transpose()?,
        error: model.error_message,
    })
}

impl DbJobStore {
    async fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), PluginError> {
        let result = plugin_job::Entity::update_many()
            .col_expr(plugin_job::Column::Status, Expr::value(status.as_str()))
            .col_expr(plugin_job::Column::FinishedAt, Expr::value(to_millis(at)))
            .col_expr(
                plugin_job::Column::ErrorMessage,
                Expr::value(error.map(str::to_string)),
            )
            .filter(plugin_job::Column::Id.eq(id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(PluginError::JobStore(format!("job {id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for DbJobStore {
    async fn insert(&self, job: &JobRequest) -> Result<(), PluginError> {
        let payload = job
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        plugin_job::ActiveModel {
            id: Set(job.id),
            plugin_id: Set(job.plugin_id),
            job_name: Set(job.job_name.clone()),
            payload: Set(payload),
            status: Set(job.status.as_str().to_string()),
            scheduled_at: Set(to_millis(job.scheduled_at)),
            created_at: Set(to_millis(job.created_at)),
            started_at: Set(job.started_at.map(to_millis)),
            finished_at: Set(job.finished_at.map(to_millis)),
            error_message: Set(job.error.clone()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError> {
        let now_ms = to_millis(now);
        let candidates = plugin_job::Entity::find()
            .filter(plugin_job::Column::Status.eq(JobStatus::Pending.as_str()))
            .filter(plugin_job::Column::ScheduledAt.lte(now_ms))
            .order_by_asc(plugin_job::Column::ScheduledAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for model in candidates {
            // Conditional transition: another worker may have claimed it first.
            let result = plugin_job::Entity::update_many()
                .col_expr(
                    plugin_job::Column::Status,
                    Expr::value(JobStatus::Running.as_str()),
                )
                .col_expr(plugin_job::Column::StartedAt, Expr::value(now_ms))
                .filter(plugin_job::Column::Id.eq(model.id))
                .filter(plugin_job::Column::Status.eq(JobStatus::Pending.as_str()))
                .exec(&self.db)
                .await?;

            if result.rows_affected == 1 {
                let mut job = to_request(model)?;
                job.status = JobStatus::Running;
                job.started_at = Some(from_millis(now_ms)?);
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), PluginError> {
        self.finish(id, JobStatus::Done, at, None).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), PluginError> {
        self.finish(id, JobStatus::Failed, at, Some(error)).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>, PluginError> {
        plugin_job::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(to_request)
            .transpose()
    }

    async fn list_for_plugin(
        &self,
        plugin_id: Uuid,
        limit: u64,
    ) -> Result<Vec<JobRequest>, PluginError> {
        plugin_job::Entity::find()
            .filter(plugin_job::Column::PluginId.eq(plugin_id))
            .order_by_desc(plugin_job::Column::ScheduledAt)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_request)
            .collect()
    }

    async fn requeue_running(&self) -> Result<u64, PluginError> {
        let result = plugin_job::Entity::update_many()
            .col_expr(
                plugin_job::Column::Status,
                Expr::value(JobStatus::Pending.as_str()),
            )
            .col_expr(plugin_job::Column::StartedAt, Expr::value(Option::<i64>::None))
            .filter(plugin_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
