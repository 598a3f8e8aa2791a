//! Recurring `runEveryMinute` / `runEveryHour` / `runEveryDay` tasks.
//!
//! Each (plugin, cadence) pair gets one task that sleeps a full period,
//! runs the handler to completion, then starts the next period. An
//! overrunning handler therefore delays the next run instead of
//! overlapping with it, and missed ticks are never queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::invoke::guarded;
use crate::registry::LoadedPlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Minute,
    Hour,
    Day,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::Minute, Cadence::Hour, Cadence::Day];

    pub fn period(self) -> Duration {
        match self {
            Cadence::Minute => Duration::from_secs(60),
            Cadence::Hour => Duration::from_secs(60 * 60),
            Cadence::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn function_name(self) -> &'static str {
        match self {
            Cadence::Minute => "runEveryMinute",
            Cadence::Hour => "runEveryHour",
            Cadence::Day => "runEveryDay",
        }
    }
}

#[derive(Debug, Default)]
struct TaskState {
    running: AtomicBool,
    runs: AtomicU64,
    last_completed: Mutex<Option<DateTime<Utc>>>,
}

struct ScheduledTask {
    state: Arc<TaskState>,
    handle: JoinHandle<()>,
}

/// Drives the recurring handlers of loaded plugins.
pub struct TaskScheduler {
    tasks: Mutex<HashMap<(Uuid, Cadence), ScheduledTask>>,
    handler_timeout: Duration,
}

impl TaskScheduler {
    /// `handler_timeout` bounds each scheduled invocation.
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            handler_timeout,
        }
    }

    /// Start a task for every cadence the plugin declares a handler for.
    /// Returns the cadences started.
    pub fn start_plugin(&self, plugin: &Arc<LoadedPlugin>) -> Vec<Cadence> {
        let mut started = Vec::new();
        let mut tasks = self.tasks.lock();

        for cadence in Cadence::ALL {
            if plugin.module.scheduled(cadence).is_none() {
                continue;
            }
            let key = (plugin.id, cadence);
            if tasks.contains_key(&key) {
                continue;
            }

            let state = Arc::new(TaskState::default());
            let handle = tokio::spawn(run_task(
                plugin.clone(),
                cadence,
                state.clone(),
                self.handler_timeout,
            ));
            tasks.insert(key, ScheduledTask { state, handle });
            started.push(cadence);
        }

        if !started.is_empty() {
            tracing::debug!(plugin = %plugin.name, cadences = ?started, "scheduled tasks started");
        }
        started
    }

    /// Abort every task of a plugin. An in-flight handler is cancelled.
    pub fn stop_plugin(&self, plugin_id: Uuid) -> usize {
        let mut tasks = self.tasks.lock();
        let keys: Vec<(Uuid, Cadence)> = tasks
            .keys()
            .filter(|(id, _)| *id == plugin_id)
            .copied()
            .collect();
        for key in &keys {
            if let Some(task) = tasks.remove(key) {
                task.handle.abort();
            }
        }
        keys.len()
    }

    pub fn is_scheduled(&self, plugin_id: Uuid, cadence: Cadence) -> bool {
        self.tasks.lock().contains_key(&(plugin_id, cadence))
    }

    /// Whether the handler for (plugin, cadence) is executing right now.
    pub fn is_running(&self, plugin_id: Uuid, cadence: Cadence) -> bool {
        self.tasks
            .lock()
            .get(&(plugin_id, cadence))
            .is_some_and(|t| t.state.running.load(Ordering::SeqCst))
    }

    pub fn last_completed(&self, plugin_id: Uuid, cadence: Cadence) -> Option<DateTime<Utc>> {
        self.tasks
            .lock()
            .get(&(plugin_id, cadence))
            .and_then(|t| *t.state.last_completed.lock())
    }

    /// Completed invocations, successful or not.
    pub fn runs(&self, plugin_id: Uuid, cadence: Cadence) -> u64 {
        self.tasks
            .lock()
            .get(&(plugin_id, cadence))
            .map_or(0, |t| t.state.runs.load(Ordering::SeqCst))
    }

    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.handle.abort();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_task(
    plugin: Arc<LoadedPlugin>,
    cadence: Cadence,
    state: Arc<TaskState>,
    timeout: Duration,
) {
    let function = cadence.function_name();
    let Some(handler) = plugin.module.scheduled(cadence).cloned() else {
        return;
    };

    loop {
        tokio::time::sleep(cadence.period()).await;

        state.running.store(true, Ordering::SeqCst);
        let result = guarded(&plugin.name, function, timeout, handler(plugin.context.clone())).await;
        state.running.store(false, Ordering::SeqCst);

        *state.last_completed.lock() = Some(Utc::now());
        state.runs.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(()) => tracing::debug!(plugin = %plugin.name, function, "scheduled task completed"),
            Err(e) => tracing::warn!(
                plugin = %plugin.name,
                plugin_id = %plugin.id,
                function,
                error = %e,
                "scheduled task failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::module::PluginModule;
    use crate::registry::test_support::{install, registry};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    #[test]
    fn test_cadence_names_and_periods() {
        assert_eq!(Cadence::Minute.function_name(), "runEveryMinute");
        assert_eq!(Cadence::Day.period(), Duration::from_secs(86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_handler_is_debounced() {
        let (registry, _) = registry(Duration::from_secs(600));
        let starts = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let (s, f, m) = (starts.clone(), in_flight.clone(), max_in_flight.clone());
        let module = PluginModule::new().run_every(Cadence::Minute, move |_| {
            let (s, f, m) = (s.clone(), f.clone(), m.clone());
            async move {
                s.lock().push(Instant::now());
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(90)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let plugin = registry.load(install("slow", 0, module)).await.unwrap();
        let scheduler = TaskScheduler::new(registry.handler_timeout());
        let origin = Instant::now();
        assert_eq!(scheduler.start_plugin(&plugin), vec![Cadence::Minute]);

        tokio::time::sleep(Duration::from_secs(400)).await;

        let starts: Vec<u64> = starts
            .lock()
            .iter()
            .map(|t| (*t - origin).as_secs())
            .collect();
        assert_eq!(starts, vec![60, 210, 360]);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.runs(plugin.id, Cadence::Minute), 2);
        assert!(scheduler.is_running(plugin.id, Cadence::Minute));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_keeps_schedule() {
        let (registry, _) = registry(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let module = PluginModule::new().run_every(Cadence::Minute, move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run blows up");
                }
                Err(PluginError::handler("still failing"))
            }
        });

        let plugin = registry.load(install("flaky", 0, module)).await.unwrap();
        let scheduler = TaskScheduler::new(registry.handler_timeout());
        scheduler.start_plugin(&plugin);

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.runs(plugin.id, Cadence::Minute), 3);
        assert!(scheduler.last_completed(plugin.id, Cadence::Minute).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_plugin_halts_tasks() {
        let (registry, _) = registry(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let module = PluginModule::new()
            .run_every(Cadence::Minute, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .run_every(Cadence::Hour, |_| async { Ok(()) });

        let plugin = registry.load(install("stoppable", 0, module)).await.unwrap();
        let scheduler = TaskScheduler::new(registry.handler_timeout());
        assert_eq!(scheduler.start_plugin(&plugin).len(), 2);
        assert!(scheduler.start_plugin(&plugin).is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.stop_plugin(plugin.id), 2);
        assert!(!scheduler.is_scheduled(plugin.id, Cadence::Hour));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plugin_without_scheduled_handlers() {
        let (registry, _) = registry(Duration::from_secs(5));
        let plugin = registry
            .load(install("idle", 0, PluginModule::new()))
            .await
            .unwrap();
        let scheduler = TaskScheduler::new(registry.handler_timeout());
        assert!(scheduler.start_plugin(&plugin).is_empty());
        assert_eq!(scheduler.runs(plugin.id, Cadence::Day), 0);
    }
}
