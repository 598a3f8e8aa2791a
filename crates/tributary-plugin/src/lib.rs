//! Tributary Plugin Runtime
//!
//! Runs third-party plugins against an analytics event stream. Each event
//! passes through every enabled plugin's `processEvent` in order, then
//! fans out to `onEvent` / `onSnapshot` observers. Plugins also get
//! recurring tasks, durable deferred jobs, a per-plugin cache and a
//! private `global` object.

pub mod cache;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod invoke;
pub mod jobs;
pub mod loader;
pub mod module;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod wasm;

pub use cache::{KeyedStore, MemoryStore, PluginCache};
#[cfg(feature = "redis")]
pub use cache::RedisStore;
pub use config::{Attachment, PluginConfig, PluginSettings};
pub use context::PluginContext;
pub use descriptor::PluginDescriptor;
pub use error::PluginError;
pub use event::{EventKind, PluginEvent, SNAPSHOT_EVENT};
pub use jobs::{
    DbJobStore, JobDispatcher, JobQueue, JobRequest, JobStatus, JobStore, JobTrigger,
    MemoryJobStore, TimeUnit,
};
pub use module::PluginModule;
pub use pipeline::{EventPipeline, PipelineOutcome};
pub use registry::{plugin_id_for, LoadedPlugin, PluginInstall, PluginRegistry, PluginSummary};
pub use runtime::{PluginServer, RuntimeConfig};
pub use sandbox::{PluginSandbox, SandboxConfig};
pub use scheduler::{Cadence, TaskScheduler};
