//! Invocation boundary for plugin code.
//!
//! Every handler runs on its own task under a timeout, so a panic or a
//! hang in plugin code surfaces as a `PluginError` instead of taking
//! down the calling worker.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::error::PluginError;

/// Aborts the handler task when the caller goes away, e.g. when a
/// scheduled task is stopped mid-run.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a plugin handler with panic isolation and a time bound.
///
/// On timeout, or if the returned future is dropped, the handler task
/// is aborted.
pub async fn guarded<T, F>(
    plugin: &str,
    function: &str,
    timeout: Duration,
    fut: F,
) -> Result<T, PluginError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, PluginError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let _abort = AbortOnDrop(handle.abort_handle());

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(PluginError::Panicked {
            plugin: plugin.to_string(),
            function: function.to_string(),
        }),
        Ok(Err(join_err)) => Err(PluginError::handler(format!(
            "{function} was cancelled: {join_err}"
        ))),
        Err(_) => Err(PluginError::Timeout {
            plugin: plugin.to_string(),
            function: function.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
