//! Per-plugin state handed to every handler invocation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::cache::PluginCache;
use crate::config::{Attachment, PluginConfig};
use crate::jobs::JobTrigger;

/// Maximum log message length accepted from plugin code.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Plugin-owned mutable state, shared by all invocations of one plugin.
pub type Global = serde_json::Map<String, serde_json::Value>;

/// Strip control characters (except newline and tab) and cap length.
pub(crate) fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

struct Inner {
    plugin_id: Uuid,
    plugin_name: String,
    config: PluginConfig,
    attachments: HashMap<String, Attachment>,
    global: Mutex<Global>,
    cache: PluginCache,
    jobs: JobTrigger,
}

/// Context bound to one loaded plugin instance.
///
/// Cheap to clone; clones share the same `global` state.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<Inner>,
}

impl PluginContext {
    pub fn new(
        plugin_id: Uuid,
        plugin_name: impl Into<String>,
        config: PluginConfig,
        attachments: HashMap<String, Attachment>,
        cache: PluginCache,
        jobs: JobTrigger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                plugin_id,
                plugin_name: plugin_name.into(),
                config,
                attachments,
                global: Mutex::new(Global::new()),
                cache,
                jobs,
            }),
        }
    }

    pub fn plugin_id(&self) -> Uuid {
        self.inner.plugin_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.inner.plugin_name
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    pub fn attachments(&self) -> &HashMap<String, Attachment> {
        &self.inner.attachments
    }

    pub fn attachment(&self, key: &str) -> Option<&Attachment> {
        self.inner.attachments.get(key)
    }

    /// Lock the plugin's `global` object.
    ///
    /// Do not hold the guard across awaits on other plugin handlers.
    pub async fn global(&self) -> MutexGuard<'_, Global> {
        self.inner.global.lock().await
    }

    pub fn cache(&self) -> &PluginCache {
        &self.inner.cache
    }

    pub fn jobs(&self) -> &JobTrigger {
        &self.inner.jobs
    }

    pub fn log_info(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::info!(plugin = %self.inner.plugin_name, plugin_id = %self.inner.plugin_id, "{msg}");
    }

    pub fn log_warn(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::warn!(plugin = %self.inner.plugin_name, plugin_id = %self.inner.plugin_id, "{msg}");
    }

    pub fn log_error(&self, message: &str) {
        let msg = sanitize_log_message(message);
        tracing::error!(plugin = %self.inner.plugin_name, plugin_id = %self.inner.plugin_id, "{msg}");
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.inner.plugin_id)
            .field("plugin_name", &self.inner.plugin_name)
            .field("config", &self.inner.config.public_view())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_log_message("a\u{0}b\u{1b}[31mc\nd\te"), "ab[31mc\nd\te");
    }

    #[test]
    fn test_sanitize_at_limit_unchanged() {
        let msg = "x".repeat(MAX_LOG_MESSAGE_LEN);
        assert_eq!(sanitize_log_message(&msg).len(), MAX_LOG_MESSAGE_LEN);
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let msg = "x".repeat(MAX_LOG_MESSAGE_LEN + 1);
        let result = sanitize_log_message(&msg);
        assert!(result.ends_with("… (truncated)"));
        assert!(result.starts_with(&"x".repeat(MAX_LOG_MESSAGE_LEN)));
    }

    #[tokio::test]
    async fn test_global_shared_between_clones() {
        let (ctx, _) = test_support::context("counter", &[]);
        let other = ctx.clone();
        ctx.global().await.insert("seen".into(), 1.into());
        assert_eq!(other.global().await.get("seen"), Some(&1.into()));
    }

    #[tokio::test]
    async fn test_global_not_shared_across_plugins() {
        let (a, _) = test_support::context("a", &[]);
        let (b, _) = test_support::context("b", &[]);
        a.global().await.insert("k".into(), "v".into());
        assert!(b.global().await.is_empty());
    }
}
