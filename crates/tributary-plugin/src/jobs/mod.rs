//! Deferred plugin jobs: requests, the durable queue and the trigger
//! handle plugins use to schedule work.

mod dispatcher;
mod store;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::PluginError;

pub use dispatcher::{DispatchSummary, JobDispatcher};
pub use store::{DbJobStore, JobStore, MemoryJobStore};

// ─── Job requests ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PluginError::JobStore(format!("unknown job status '{other}'"))),
        }
    }
}

/// A deferred invocation of a plugin's job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub plugin_id: Uuid,
    pub job_name: String,
    pub payload: Option<Value>,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobRequest {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}

// ─── Time units ─────────────────────────────────────────────────────

/// Units accepted by `runIn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Quarters,
    Years,
}

impl FromStr for TimeUnit {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let unit = match normalized.as_str() {
            "millisecond" | "milliseconds" => TimeUnit::Milliseconds,
            "second" | "seconds" => TimeUnit::Seconds,
            "minute" | "minutes" => TimeUnit::Minutes,
            "hour" | "hours" => TimeUnit::Hours,
            "day" | "days" => TimeUnit::Days,
            "week" | "weeks" => TimeUnit::Weeks,
            "month" | "months" => TimeUnit::Months,
            "quarter" | "quarters" => TimeUnit::Quarters,
            "year" | "years" => TimeUnit::Years,
            _ => return Err(PluginError::InvalidTimeUnit(s.to_string())),
        };
        Ok(unit)
    }
}

impl TimeUnit {
    /// `from` shifted by `amount` units. Months, quarters and years use
    /// calendar arithmetic, clamping to the last day of shorter months.
    pub fn add_to(self, from: DateTime<Utc>, amount: i64) -> Result<DateTime<Utc>, PluginError> {
        let overflow = || PluginError::InvalidTimeUnit(format!("{amount} {self:?} is out of range"));

        let delta = match self {
            TimeUnit::Milliseconds => TimeDelta::try_milliseconds(amount),
            TimeUnit::Seconds => TimeDelta::try_seconds(amount),
            TimeUnit::Minutes => TimeDelta::try_minutes(amount),
            TimeUnit::Hours => TimeDelta::try_hours(amount),
            TimeUnit::Days => TimeDelta::try_days(amount),
            TimeUnit::Weeks => TimeDelta::try_weeks(amount),
            TimeUnit::Months | TimeUnit::Quarters | TimeUnit::Years => {
                let per = match self {
                    TimeUnit::Quarters => 3,
                    TimeUnit::Years => 12,
                    _ => 1,
                };
                let months = amount.checked_mul(per).ok_or_else(overflow)?;
                let magnitude = u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?;
                let shifted = if months >= 0 {
                    from.checked_add_months(Months::new(magnitude))
                } else {
                    from.checked_sub_months(Months::new(magnitude))
                };
                return shifted.ok_or_else(overflow);
            }
        };

        delta
            .and_then(|d| from.checked_add_signed(d))
            .ok_or_else(overflow)
    }
}

// ─── Queue ──────────────────────────────────────────────────────────

/// Durable queue of job requests.
///
/// Enqueue persists before returning. Requests that are already due wake
/// the dispatcher.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    wake: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }

    /// Persist a request to run `job_name` at `when`. Times in the past
    /// are clamped to now.
    pub async fn enqueue(
        &self,
        plugin_id: Uuid,
        job_name: &str,
        payload: Option<Value>,
        when: DateTime<Utc>,
    ) -> Result<JobRequest, PluginError> {
        let now = Utc::now();
        let request = JobRequest {
            id: Uuid::new_v4(),
            plugin_id,
            job_name: job_name.to_string(),
            payload,
            status: JobStatus::Pending,
            scheduled_at: when.max(now),
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
        };

        self.store.insert(&request).await?;

        tracing::debug!(
            plugin_id = %plugin_id,
            job = %job_name,
            job_id = %request.id,
            scheduled_at = %request.scheduled_at,
            "job enqueued"
        );

        if request.scheduled_at <= now {
            self.wake.notify_one();
        }
        Ok(request)
    }

    pub async fn run_now(
        &self,
        plugin_id: Uuid,
        job_name: &str,
        payload: Option<Value>,
    ) -> Result<JobRequest, PluginError> {
        self.enqueue(plugin_id, job_name, payload, Utc::now()).await
    }

    pub async fn run_in(
        &self,
        plugin_id: Uuid,
        job_name: &str,
        payload: Option<Value>,
        amount: i64,
        unit: TimeUnit,
    ) -> Result<JobRequest, PluginError> {
        let when = unit.add_to(Utc::now(), amount)?;
        self.enqueue(plugin_id, job_name, payload, when).await
    }

    pub async fn run_at(
        &self,
        plugin_id: Uuid,
        job_name: &str,
        payload: Option<Value>,
        at: DateTime<Utc>,
    ) -> Result<JobRequest, PluginError> {
        self.enqueue(plugin_id, job_name, payload, at).await
    }
}

// ─── Trigger handle ─────────────────────────────────────────────────

/// The `jobs` handle exposed to plugin code. Only the plugin's own job
/// names can be triggered; job names are scoped by plugin id.
#[derive(Clone)]
pub struct JobTrigger {
    plugin_id: Uuid,
    plugin_name: String,
    job_names: Arc<HashSet<String>>,
    queue: JobQueue,
}

impl JobTrigger {
    pub fn new(
        plugin_id: Uuid,
        plugin_name: impl Into<String>,
        job_names: impl IntoIterator<Item = String>,
        queue: JobQueue,
    ) -> Self {
        Self {
            plugin_id,
            plugin_name: plugin_name.into(),
            job_names: Arc::new(job_names.into_iter().collect()),
            queue,
        }
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.job_names.contains(name)
    }

    /// Start building a trigger for `name`.
    pub fn job(&self, name: impl Into<String>) -> JobCall<'_> {
        JobCall {
            trigger: self,
            name: name.into(),
            payload: None,
        }
    }
}

/// A pending `jobs[name](payload)` call. Each `run_*` method resolves
/// once the request is persisted, not once the job has run.
#[must_use = "a job call does nothing until one of its run methods is awaited"]
pub struct JobCall<'a> {
    trigger: &'a JobTrigger,
    name: String,
    payload: Option<Value>,
}

impl JobCall<'_> {
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    fn check(&self) -> Result<(), PluginError> {
        if self.trigger.has_job(&self.name) {
            Ok(())
        } else {
            Err(PluginError::UnknownJob {
                plugin: self.trigger.plugin_name.clone(),
                job: self.name.clone(),
            })
        }
    }

    pub async fn run_now(self) -> Result<(), PluginError> {
        self.check()?;
        self.trigger
            .queue
            .run_now(self.trigger.plugin_id, &self.name, self.payload)
            .await
            .map(|_| ())
    }

    /// `unit` accepts the singular or plural names, e.g. `"seconds"`.
    pub async fn run_in(self, amount: i64, unit: &str) -> Result<(), PluginError> {
        self.check()?;
        let unit: TimeUnit = unit.parse()?;
        self.trigger
            .queue
            .run_in(self.trigger.plugin_id, &self.name, self.payload, amount, unit)
            .await
            .map(|_| ())
    }

    pub async fn run_at(self, at: DateTime<Utc>) -> Result<(), PluginError> {
        self.check()?;
        self.trigger
            .queue
            .run_at(self.trigger.plugin_id, &self.name, self.payload, at)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn queue() -> (JobQueue, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        (JobQueue::new(store.clone()), store)
    }

    // ── Time units ──────────────────────────────────────────────────

    #[test]
    fn test_parse_units_singular_and_plural() {
        assert_eq!("second".parse::<TimeUnit>().unwrap(), TimeUnit::Seconds);
        assert_eq!("Seconds".parse::<TimeUnit>().unwrap(), TimeUnit::Seconds);
        assert_eq!("quarter".parse::<TimeUnit>().unwrap(), TimeUnit::Quarters);
        assert_eq!("milliseconds".parse::<TimeUnit>().unwrap(), TimeUnit::Milliseconds);
        let err = "fortnights".parse::<TimeUnit>().unwrap_err();
        assert!(matches!(err, PluginError::InvalidTimeUnit(_)));
    }

    #[test]
    fn test_fixed_units() {
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            TimeUnit::Weeks.add_to(from, 2).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 24, 12, 0, 0).unwrap()
        );
        assert_eq!(
            TimeUnit::Milliseconds.add_to(from, 1500).unwrap(),
            from + TimeDelta::milliseconds(1500)
        );
    }

    #[test]
    fn test_calendar_units_clamp_to_month_end() {
        let jan31 = Utc.with_ymd_and_hms(2024, 1, 31, 9, 30, 0).unwrap();
        assert_eq!(
            TimeUnit::Months.add_to(jan31, 1).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 9, 30, 0).unwrap()
        );
        assert_eq!(
            TimeUnit::Quarters.add_to(jan31, 1).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 30, 9, 30, 0).unwrap()
        );
        let leap = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            TimeUnit::Years.add_to(leap, 1).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()
        );
        assert_eq!(
            TimeUnit::Months.add_to(jan31, -2).unwrap(),
            Utc.with_ymd_and_hms(2023, 11, 30, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_overflow_is_an_error() {
        let now = Utc::now();
        assert!(TimeUnit::Years.add_to(now, i64::MAX).is_err());
        assert!(TimeUnit::Days.add_to(now, i64::MAX).is_err());
    }

    // ── Queue ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_in_thirty_seconds() {
        let (queue, store) = queue();
        let plugin = Uuid::new_v4();

        let before = Utc::now();
        let job = queue
            .run_in(plugin, "sync", None, 30, TimeUnit::Seconds)
            .await
            .unwrap();
        let after = Utc::now();

        assert!(job.scheduled_at >= before + TimeDelta::seconds(30));
        assert!(job.scheduled_at <= after + TimeDelta::seconds(30));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.get(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_run_at_in_the_past_is_clamped() {
        let (queue, _) = queue();
        let past = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        let job = queue
            .run_at(Uuid::new_v4(), "sync", Some(json!(1)), past)
            .await
            .unwrap();
        assert!(job.scheduled_at >= job.created_at);
    }

    #[tokio::test]
    async fn test_due_enqueue_wakes_dispatcher() {
        let (queue, _) = queue();
        let notified = queue.wake().clone();
        let waiter = tokio::spawn(async move { notified.notified().await });

        tokio::task::yield_now().await;
        queue.run_now(Uuid::new_v4(), "sync", None).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("dispatcher was not woken")
            .unwrap();
    }

    // ── Trigger ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_trigger_persists_with_payload() {
        let (queue, store) = queue();
        let plugin = Uuid::new_v4();
        let trigger = JobTrigger::new(plugin, "geoip", ["refresh".to_string()], queue);

        trigger
            .job("refresh")
            .payload(json!({"region": "eu"}))
            .run_in(5, "minutes")
            .await
            .unwrap();

        let jobs = store.list_for_plugin(plugin, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name, "refresh");
        assert_eq!(jobs[0].payload, Some(json!({"region": "eu"})));
    }

    #[tokio::test]
    async fn test_trigger_rejects_unknown_job() {
        let (queue, store) = queue();
        let plugin = Uuid::new_v4();
        let trigger = JobTrigger::new(plugin, "geoip", ["refresh".to_string()], queue);

        let err = trigger.job("other").run_now().await.unwrap_err();
        assert!(matches!(err, PluginError::UnknownJob { .. }));
        assert!(store.list_for_plugin(plugin, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_rejects_bad_unit() {
        let (queue, _) = queue();
        let trigger = JobTrigger::new(Uuid::new_v4(), "p", ["j".to_string()], queue);
        let err = trigger.job("j").run_in(1, "lightyears").await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidTimeUnit(_)));
    }
}
