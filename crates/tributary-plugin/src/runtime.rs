//! The plugin server runtime: registry, event pipeline, scheduler and
//! job dispatcher wired together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::KeyedStore;
use crate::error::PluginError;
use crate::event::PluginEvent;
use crate::jobs::{JobDispatcher, JobQueue, JobStore};
use crate::loader;
use crate::pipeline::{EventPipeline, PipelineOutcome};
use crate::registry::{LoadedPlugin, PluginInstall, PluginRegistry};
use crate::sandbox::SandboxConfig;
use crate::scheduler::{Cadence, TaskScheduler};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on any single handler invocation.
    pub handler_timeout: Duration,
    pub job_poll_interval: Duration,
    /// Jobs claimed per dispatch pass.
    pub job_batch_size: u64,
    pub plugin_dir: PathBuf,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            job_poll_interval: Duration::from_millis(1000),
            job_batch_size: 100,
            plugin_dir: PathBuf::from("./plugins"),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            handler_timeout: Duration::from_secs(env_u64("PLUGIN_HANDLER_TIMEOUT_SECS", 30)),
            job_poll_interval: Duration::from_millis(env_u64("JOB_POLL_INTERVAL_MS", 1000)),
            job_batch_size: env_u64("JOB_BATCH_SIZE", 100),
            plugin_dir: std::env::var("PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./plugins")),
            sandbox: SandboxConfig::from_env(),
        }
    }
}

/// Owns every moving part of the plugin server.
pub struct PluginServer {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    pipeline: EventPipeline,
    scheduler: TaskScheduler,
    jobs: JobQueue,
    dispatcher: Arc<JobDispatcher>,
}

impl PluginServer {
    pub fn new(
        config: RuntimeConfig,
        cache_store: Arc<dyn KeyedStore>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        let jobs = JobQueue::new(job_store);
        let registry = Arc::new(PluginRegistry::new(
            cache_store,
            jobs.clone(),
            config.handler_timeout,
        ));
        let pipeline = EventPipeline::new(registry.clone());
        let scheduler = TaskScheduler::new(config.handler_timeout);
        let dispatcher = Arc::new(JobDispatcher::new(
            jobs.clone(),
            registry.clone(),
            config.job_poll_interval,
            config.job_batch_size,
        ));

        Self {
            config,
            registry,
            pipeline,
            scheduler,
            jobs,
            dispatcher,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Load a plugin and start its scheduled tasks.
    pub async fn enable(&self, install: PluginInstall) -> Result<Arc<LoadedPlugin>, PluginError> {
        let plugin = self.registry.load(install).await?;
        self.scheduler.start_plugin(&plugin);
        Ok(plugin)
    }

    /// Stop a plugin's scheduled tasks and unload it. Pending jobs stay
    /// queued and fail when dispatched while the plugin is absent.
    pub async fn disable(&self, plugin_id: Uuid) -> Result<(), PluginError> {
        self.scheduler.stop_plugin(plugin_id);
        self.registry.unload(plugin_id).await?;
        Ok(())
    }

    pub async fn process_event(&self, event: PluginEvent) -> PipelineOutcome {
        self.pipeline.process(event).await
    }

    /// Enable every plugin found in the configured plugin directory.
    /// Returns how many were enabled; failures are logged and skipped.
    pub async fn enable_from_dir(&self) -> Result<usize, PluginError> {
        let bundles = loader::discover(&self.config.plugin_dir).await?;
        let mut enabled = 0;
        for bundle in bundles {
            let name = bundle.descriptor.name.clone();
            let result = match bundle.into_install(self.config.sandbox.clone()).await {
                Ok(install) => self.enable(install).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => enabled += 1,
                Err(e) => tracing::error!(plugin = %name, error = %e, "failed to enable plugin"),
            }
        }
        Ok(enabled)
    }

    /// Put jobs left `running` by a previous process back in the queue.
    pub async fn recover_jobs(&self) -> Result<u64, PluginError> {
        let requeued = self.jobs.store().requeue_running().await?;
        if requeued > 0 {
            tracing::warn!(count = requeued, "requeued jobs interrupted by a previous shutdown");
        }
        Ok(requeued)
    }

    /// Startup: requeue interrupted jobs, then enable bundles from the
    /// plugin directory. Only a failed requeue is an error; a missing or
    /// unreadable plugin directory is logged.
    pub async fn start(&self) -> Result<usize, PluginError> {
        self.recover_jobs().await?;
        match self.enable_from_dir().await {
            Ok(count) => {
                tracing::info!(count, "plugins enabled");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read plugin directory");
                Ok(0)
            }
        }
    }

    pub fn spawn_job_dispatcher(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), PluginError>> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    }

    pub fn is_scheduled(&self, plugin_id: Uuid, cadence: Cadence) -> bool {
        self.scheduler.is_scheduled(plugin_id, cadence)
    }

    /// Stop scheduled tasks and tear down every plugin.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        for plugin in self.registry.enabled_plugins().await {
            if let Err(e) = self.registry.unload(plugin.id).await {
                tracing::warn!(plugin = %plugin.name, error = %e, "unload during shutdown failed");
            }
        }
    }
}
