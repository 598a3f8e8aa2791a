//! Plugin registry: loaded plugin instances and their lifecycle.
//!
//! Loading validates the descriptor, resolves config, binds a fresh
//! `PluginContext` and runs `setupPlugin`. A plugin that fails any of
//! these steps is never registered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cache::{KeyedStore, PluginCache};
use crate::config::{self, PluginSettings};
use crate::context::PluginContext;
use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::invoke::guarded;
use crate::jobs::{JobQueue, JobTrigger};
use crate::module::PluginModule;

/// Stable id for a plugin, derived from its name.
pub fn plugin_id_for(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("tributary:plugin:{name}").as_bytes())
}

// ─── Loaded plugin entry ────────────────────────────────────────────

/// A plugin instance bound to its context.
#[derive(Debug)]
pub struct LoadedPlugin {
    pub id: Uuid,
    pub name: String,
    /// Position in the `processEvent` chain. Lower runs first.
    pub order: i32,
    pub descriptor: PluginDescriptor,
    pub module: PluginModule,
    pub context: PluginContext,
}

/// Everything needed to load one plugin.
#[derive(Debug, Clone)]
pub struct PluginInstall {
    pub id: Uuid,
    pub order: i32,
    pub descriptor: PluginDescriptor,
    pub module: PluginModule,
    pub settings: PluginSettings,
}

impl PluginInstall {
    pub fn new(descriptor: PluginDescriptor, module: PluginModule) -> Self {
        Self {
            id: plugin_id_for(&descriptor.name),
            order: 0,
            descriptor,
            module,
            settings: PluginSettings::default(),
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn settings(mut self, settings: PluginSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Summary of a loaded plugin, safe to expose over the API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginSummary {
    pub id: Uuid,
    pub name: String,
    pub order: i32,
    pub capabilities: Vec<&'static str>,
    pub jobs: Vec<String>,
    pub config: HashMap<String, String>,
}

// ─── Registry ───────────────────────────────────────────────────────

/// Loaded plugins indexed by id.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<Uuid, Arc<LoadedPlugin>>>,
    cache_store: Arc<dyn KeyedStore>,
    jobs: JobQueue,
    handler_timeout: Duration,
}

impl PluginRegistry {
    pub fn new(cache_store: Arc<dyn KeyedStore>, jobs: JobQueue, handler_timeout: Duration) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            cache_store,
            jobs,
            handler_timeout,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.jobs
    }

    /// Validate, bind and set up a plugin.
    pub async fn load(&self, install: PluginInstall) -> Result<Arc<LoadedPlugin>, PluginError> {
        let PluginInstall {
            id,
            order,
            descriptor,
            module,
            settings,
        } = install;

        descriptor.validate()?;

        if self.plugins.read().await.contains_key(&id) {
            return Err(PluginError::AlreadyLoaded(descriptor.name.clone()));
        }

        let (config, attachments) = config::resolve(&descriptor, &settings)?;
        let context = PluginContext::new(
            id,
            descriptor.name.clone(),
            config,
            attachments,
            PluginCache::new(self.cache_store.clone(), id),
            JobTrigger::new(id, descriptor.name.clone(), module.job_names(), self.jobs.clone()),
        );

        if let Some(setup) = module.setup_plugin.clone() {
            let fut = setup(context.clone());
            guarded(&descriptor.name, "setupPlugin", self.handler_timeout, fut)
                .await
                .inspect_err(|e| {
                    tracing::error!(plugin = %descriptor.name, plugin_id = %id, error = %e, "setupPlugin failed, plugin not loaded");
                })?;
        }

        let plugin = Arc::new(LoadedPlugin {
            id,
            name: descriptor.name.clone(),
            order,
            descriptor,
            module,
            context,
        });

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&id) {
            return Err(PluginError::AlreadyLoaded(plugin.name.clone()));
        }
        plugins.insert(id, plugin.clone());
        drop(plugins);

        tracing::info!(
            plugin = %plugin.name,
            plugin_id = %id,
            capabilities = ?plugin.module.capabilities(),
            "plugin loaded"
        );
        Ok(plugin)
    }

    /// Remove a plugin and run its `teardownPlugin`. Its context, and
    /// with it the plugin's `global`, is discarded.
    pub async fn unload(&self, plugin_id: Uuid) -> Result<Arc<LoadedPlugin>, PluginError> {
        let plugin = self
            .plugins
            .write()
            .await
            .remove(&plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        if let Some(teardown) = plugin.module.teardown_plugin.clone() {
            let fut = teardown(plugin.context.clone());
            if let Err(e) = guarded(&plugin.name, "teardownPlugin", self.handler_timeout, fut).await
            {
                tracing::warn!(plugin = %plugin.name, plugin_id = %plugin_id, error = %e, "teardownPlugin failed");
            }
        }

        tracing::info!(plugin = %plugin.name, plugin_id = %plugin_id, "plugin unloaded");
        Ok(plugin)
    }

    pub async fn get(&self, plugin_id: Uuid) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().await.get(&plugin_id).cloned()
    }

    /// Loaded plugins in chain order: by `order`, then by name.
    pub async fn enabled_plugins(&self) -> Vec<Arc<LoadedPlugin>> {
        let mut plugins: Vec<Arc<LoadedPlugin>> =
            self.plugins.read().await.values().cloned().collect();
        plugins.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        plugins
    }

    pub async fn loaded_count(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_loaded(&self, plugin_id: Uuid) -> bool {
        self.plugins.read().await.contains_key(&plugin_id)
    }

    pub async fn summaries(&self) -> Vec<PluginSummary> {
        self.enabled_plugins()
            .await
            .into_iter()
            .map(|p| PluginSummary {
                id: p.id,
                name: p.name.clone(),
                order: p.order,
                capabilities: p.module.capabilities(),
                jobs: p.module.job_names(),
                config: p.context.config().public_view(),
            })
            .collect()
    }
}
