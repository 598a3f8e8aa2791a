//! Event pipeline: the sequential `processEvent` chain followed by the
//! unordered `onEvent` / `onSnapshot` fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::event::{EventKind, PluginEvent};
use crate::invoke::guarded;
use crate::registry::{LoadedPlugin, PluginRegistry};

/// Result of running one event through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The final event, to be committed downstream.
    Ingested(PluginEvent),
    /// A plugin's `processEvent` returned nothing.
    Dropped { plugin: String },
}

impl PipelineOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, PipelineOutcome::Dropped { .. })
    }

    pub fn event(&self) -> Option<&PluginEvent> {
        match self {
            PipelineOutcome::Ingested(event) => Some(event),
            PipelineOutcome::Dropped { .. } => None,
        }
    }
}

pub struct EventPipeline {
    registry: Arc<PluginRegistry>,
    handler_timeout: Duration,
}

impl EventPipeline {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        let handler_timeout = registry.handler_timeout();
        Self {
            registry,
            handler_timeout,
        }
    }

    /// Run an event through every loaded plugin in configured order.
    pub async fn process(&self, event: PluginEvent) -> PipelineOutcome {
        let plugins = self.registry.enabled_plugins().await;
        self.run(event, &plugins).await
    }

    /// Run an event through `plugins` in the given order.
    ///
    /// Returns once the chain and the fan-out have both finished.
    pub async fn run(&self, event: PluginEvent, plugins: &[Arc<LoadedPlugin>]) -> PipelineOutcome {
        let event = match self.run_chain(event, plugins).await {
            Ok(event) => event,
            Err(dropped_by) => {
                return PipelineOutcome::Dropped { plugin: dropped_by };
            }
        };

        let event = Arc::new(event);
        self.fan_out(&event, plugins).await;
        PipelineOutcome::Ingested(Arc::unwrap_or_clone(event))
    }

    /// Apply each `processEvent` in turn. `Err` carries the name of the
    /// plugin that dropped the event.
    async fn run_chain(
        &self,
        mut event: PluginEvent,
        plugins: &[Arc<LoadedPlugin>],
    ) -> Result<PluginEvent, String> {
        for plugin in plugins {
            let Some(process) = plugin.module.process_event.clone() else {
                continue;
            };

            let event_id = event.uuid;
            let fut = process(event.clone(), plugin.context.clone());
            match guarded(&plugin.name, "processEvent", self.handler_timeout, fut).await {
                Ok(Some(next)) => event = next,
                Ok(None) => {
                    tracing::debug!(
                        plugin = %plugin.name,
                        event_id = %event_id,
                        event = %event.event,
                        "event dropped by processEvent"
                    );
                    return Err(plugin.name.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        plugin = %plugin.name,
                        plugin_id = %plugin.id,
                        function = "processEvent",
                        event_id = %event_id,
                        error = %e,
                        "processEvent failed, event passed on unchanged"
                    );
                }
            }
        }
        Ok(event)
    }

    /// Deliver the final event to every observer of its kind, concurrently.
    async fn fan_out(&self, event: &Arc<PluginEvent>, plugins: &[Arc<LoadedPlugin>]) {
        let (function, kind) = match event.kind() {
            EventKind::Snapshot => ("onSnapshot", EventKind::Snapshot),
            EventKind::Normal => ("onEvent", EventKind::Normal),
        };

        let mut set = JoinSet::new();
        for plugin in plugins {
            let handler = match kind {
                EventKind::Snapshot => plugin.module.on_snapshot.clone(),
                EventKind::Normal => plugin.module.on_event.clone(),
            };
            let Some(handler) = handler else {
                continue;
            };

            let plugin = plugin.clone();
            let event = event.clone();
            let timeout = self.handler_timeout;
            set.spawn(async move {
                let event_id = event.uuid;
                let fut = handler(event, plugin.context.clone());
                if let Err(e) = guarded(&plugin.name, function, timeout, fut).await {
                    tracing::warn!(
                        plugin = %plugin.name,
                        plugin_id = %plugin.id,
                        function,
                        event_id = %event_id,
                        error = %e,
                        "fan-out handler failed"
                    );
                }
            });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "fan-out task aborted");
            }
        }
    }
}
