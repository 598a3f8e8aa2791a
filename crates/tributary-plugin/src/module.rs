//! Plugin capability set: the optional handlers a plugin provides.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::PluginContext;
use crate::error::PluginError;
use crate::event::PluginEvent;
use crate::scheduler::Cadence;

pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T, PluginError>> + Send>>;

/// `setupPlugin`, `teardownPlugin` and the `runEvery*` handlers.
pub type ContextFn = Arc<dyn Fn(PluginContext) -> HandlerFuture<()> + Send + Sync>;

/// `processEvent`: returns the replacement event, or `None` to drop it.
pub type ProcessEventFn =
    Arc<dyn Fn(PluginEvent, PluginContext) -> HandlerFuture<Option<PluginEvent>> + Send + Sync>;

/// `onEvent` / `onSnapshot`: read-only observers.
pub type ObserverFn =
    Arc<dyn Fn(Arc<PluginEvent>, PluginContext) -> HandlerFuture<()> + Send + Sync>;

/// A named job handler. Payload is `None` when the trigger supplied none.
pub type JobFn = Arc<dyn Fn(Option<Value>, PluginContext) -> HandlerFuture<()> + Send + Sync>;

/// Handlers a plugin exposes. Every handler is optional and dispatched
/// by presence.
#[derive(Clone, Default)]
pub struct PluginModule {
    pub setup_plugin: Option<ContextFn>,
    pub teardown_plugin: Option<ContextFn>,
    pub process_event: Option<ProcessEventFn>,
    pub on_event: Option<ObserverFn>,
    pub on_snapshot: Option<ObserverFn>,
    pub run_every_minute: Option<ContextFn>,
    pub run_every_hour: Option<ContextFn>,
    pub run_every_day: Option<ContextFn>,
    pub jobs: HashMap<String, JobFn>,
}

fn context_fn<F, Fut>(f: F) -> ContextFn
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
{
    Arc::new(move |ctx: PluginContext| -> HandlerFuture<()> { Box::pin(f(ctx)) })
}

fn observer_fn<F, Fut>(f: F) -> ObserverFn
where
    F: Fn(Arc<PluginEvent>, PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
{
    Arc::new(
        move |event: Arc<PluginEvent>, ctx: PluginContext| -> HandlerFuture<()> {
            Box::pin(f(event, ctx))
        },
    )
}

impl PluginModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup_plugin<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.setup_plugin = Some(context_fn(f));
        self
    }

    pub fn teardown_plugin<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.teardown_plugin = Some(context_fn(f));
        self
    }

    pub fn process_event<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginEvent, PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<PluginEvent>, PluginError>> + Send + 'static,
    {
        self.process_event = Some(Arc::new(
            move |event: PluginEvent, ctx: PluginContext| -> HandlerFuture<Option<PluginEvent>> {
                Box::pin(f(event, ctx))
            },
        ));
        self
    }

    pub fn on_event<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginEvent>, PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.on_event = Some(observer_fn(f));
        self
    }

    pub fn on_snapshot<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<PluginEvent>, PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.on_snapshot = Some(observer_fn(f));
        self
    }

    /// Register the recurring handler for `cadence`.
    pub fn run_every<F, Fut>(mut self, cadence: Cadence, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        let handler = Some(context_fn(f));
        match cadence {
            Cadence::Minute => self.run_every_minute = handler,
            Cadence::Hour => self.run_every_hour = handler,
            Cadence::Day => self.run_every_day = handler,
        }
        self
    }

    pub fn job<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>, PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        let handler: JobFn = Arc::new(
            move |payload: Option<Value>, ctx: PluginContext| -> HandlerFuture<()> {
                Box::pin(f(payload, ctx))
            },
        );
        self.jobs.insert(name.into(), handler);
        self
    }

    pub fn scheduled(&self, cadence: Cadence) -> Option<&ContextFn> {
        match cadence {
            Cadence::Minute => self.run_every_minute.as_ref(),
            Cadence::Hour => self.run_every_hour.as_ref(),
            Cadence::Day => self.run_every_day.as_ref(),
        }
    }

    pub fn job_handler(&self, name: &str) -> Option<&JobFn> {
        self.jobs.get(name)
    }

    /// Sorted job names.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the handlers present, as plugin authors know them.
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = Vec::new();
        if self.setup_plugin.is_some() {
            caps.push("setupPlugin");
        }
        if self.teardown_plugin.is_some() {
            caps.push("teardownPlugin");
        }
        if self.process_event.is_some() {
            caps.push("processEvent");
        }
        if self.on_event.is_some() {
            caps.push("onEvent");
        }
        if self.on_snapshot.is_some() {
            caps.push("onSnapshot");
        }
        for cadence in Cadence::ALL {
            if self.scheduled(cadence).is_some() {
                caps.push(cadence.function_name());
            }
        }
        caps
    }
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("capabilities", &self.capabilities())
            .field("jobs", &self.job_names())
            .finish()
    }
}
