//! Adapter exposing a sandboxed WASM plugin as a `PluginModule`.
//!
//! Exports are matched by name: `setupPlugin`, `teardownPlugin`,
//! `processEvent`, `onEvent`, `onSnapshot`, `runEveryMinute`,
//! `runEveryHour`, `runEveryDay`, and `job_<name>` for each job.
//!
//! Every call receives a JSON object `{event?, payload?, config, global}`
//! and may return `{event?, global?, host_requests[]}`. Side effects on
//! the cache and job queue are encoded as host requests and applied by
//! the runtime after the call returns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Global, PluginContext};
use crate::error::PluginError;
use crate::event::PluginEvent;
use crate::module::PluginModule;
use crate::sandbox::PluginSandbox;
use crate::scheduler::Cadence;

const JOB_EXPORT_PREFIX: &str = "job_";

#[derive(Debug, Serialize)]
struct WasmInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a PluginEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
    config: Value,
    global: &'a Global,
}

#[derive(Debug, Default, Deserialize)]
struct WasmOutput {
    #[serde(default)]
    event: Option<PluginEvent>,
    #[serde(default)]
    global: Option<Global>,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

/// A side effect requested by a WASM plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRequest {
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

type SharedSandbox = Arc<Mutex<PluginSandbox>>;

/// Build a module whose handlers call into `sandbox`. Only the exports
/// the module actually provides become handlers.
pub fn wasm_module(sandbox: PluginSandbox) -> PluginModule {
    let exports = sandbox.exports().to_vec();
    let sandbox: SharedSandbox = Arc::new(Mutex::new(sandbox));
    let has = |name: &str| exports.iter().any(|e| e == name);

    let mut module = PluginModule::new();

    if has("setupPlugin") {
        let sb = sandbox.clone();
        module = module.setup_plugin(move |ctx| call_for_effects(sb.clone(), "setupPlugin", ctx, None));
    }
    if has("teardownPlugin") {
        let sb = sandbox.clone();
        module = module
            .teardown_plugin(move |ctx| call_for_effects(sb.clone(), "teardownPlugin", ctx, None));
    }
    if has("processEvent") {
        let sb = sandbox.clone();
        module = module.process_event(move |event, ctx| {
            let sb = sb.clone();
            async move {
                let output = invoke(sb, "processEvent", &ctx, Some(&event), None).await?;
                Ok(output.event)
            }
        });
    }
    if has("onEvent") {
        let sb = sandbox.clone();
        module = module.on_event(move |event, ctx| {
            let sb = sb.clone();
            async move {
                invoke(sb, "onEvent", &ctx, Some(event.as_ref()), None).await?;
                Ok(())
            }
        });
    }
    if has("onSnapshot") {
        let sb = sandbox.clone();
        module = module.on_snapshot(move |event, ctx| {
            let sb = sb.clone();
            async move {
                invoke(sb, "onSnapshot", &ctx, Some(event.as_ref()), None).await?;
                Ok(())
            }
        });
    }
    for cadence in Cadence::ALL {
        let function = cadence.function_name();
        if has(function) {
            let sb = sandbox.clone();
            module = module.run_every(cadence, move |ctx| {
                call_for_effects(sb.clone(), function, ctx, None)
            });
        }
    }
    for export in &exports {
        let Some(job) = export.strip_prefix(JOB_EXPORT_PREFIX) else {
            continue;
        };
        if job.is_empty() {
            continue;
        }
        let sb = sandbox.clone();
        let function = export.clone();
        module = module.job(job, move |payload, ctx| {
            let sb = sb.clone();
            let function = function.clone();
            async move {
                invoke(sb, &function, &ctx, None, payload.as_ref()).await?;
                Ok(())
            }
        });
    }

    module
}

async fn call_for_effects(
    sandbox: SharedSandbox,
    function: &'static str,
    ctx: PluginContext,
    payload: Option<Value>,
) -> Result<(), PluginError> {
    invoke(sandbox, function, &ctx, None, payload.as_ref()).await?;
    Ok(())
}

/// Call one export and apply its global update and host requests.
async fn invoke(
    sandbox: SharedSandbox,
    function: &str,
    ctx: &PluginContext,
    event: Option<&PluginEvent>,
    payload: Option<&Value>,
) -> Result<WasmOutput, PluginError> {
    let function_name = function.to_string();
    call_with_global(ctx, function, event, payload, move |input| {
        sandbox.lock().call(&function_name, &input)
    })
    .await
}

/// Run `call` on a blocking thread with the plugin's `global` locked from
/// the read until the write-back, so overlapping calls never work on a
/// stale copy. Host requests are applied after the lock is released.
async fn call_with_global<C>(
    ctx: &PluginContext,
    function: &str,
    event: Option<&PluginEvent>,
    payload: Option<&Value>,
    call: C,
) -> Result<WasmOutput, PluginError>
where
    C: FnOnce(Vec<u8>) -> Result<Vec<u8>, PluginError> + Send + 'static,
{
    let mut global = ctx.global().await;
    let input = serde_json::to_vec(&WasmInput {
        event,
        payload,
        config: ctx.config().to_json(),
        global: &*global,
    })?;

    let bytes = tokio::task::spawn_blocking(move || call(input))
        .await
        .map_err(|e| PluginError::Sandbox(format!("{function} did not complete: {e}")))??;
    let mut output: WasmOutput = if bytes.is_empty() {
        WasmOutput::default()
    } else {
        serde_json::from_slice(&bytes)?
    };

    if let Some(updated) = output.global.take() {
        *global = updated;
    }
    drop(global);

    let requests = std::mem::take(&mut output.host_requests);
    process_host_requests(ctx, requests).await;

    Ok(output)
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args[key].as_str().unwrap_or_default()
}

/// Apply host requests in order. Failures are logged and skipped.
pub async fn process_host_requests(ctx: &PluginContext, requests: Vec<HostRequest>) {
    for req in requests {
        let args = &req.args;
        let result = match req.function.as_str() {
            "cache_set" => {
                let ttl = args["ttl_seconds"].as_u64();
                ctx.cache()
                    .set(str_arg(args, "key"), args["value"].clone(), ttl)
                    .await
            }
            "cache_incr" => ctx.cache().incr(str_arg(args, "key")).await.map(|_| ()),
            "cache_expire" => match args["ttl_seconds"].as_u64() {
                Some(ttl) => ctx
                    .cache()
                    .expire(str_arg(args, "key"), ttl)
                    .await
                    .map(|_| ()),
                None => Err(PluginError::handler("cache_expire needs ttl_seconds")),
            },
            "run_job" => run_job_request(ctx, args).await,
            "log_info" => {
                ctx.log_info(str_arg(args, "message"));
                Ok(())
            }
            "log_warn" => {
                ctx.log_warn(str_arg(args, "message"));
                Ok(())
            }
            "log_error" => {
                ctx.log_error(str_arg(args, "message"));
                Ok(())
            }
            other => {
                tracing::warn!(
                    plugin = %ctx.plugin_name(),
                    function = %other,
                    "unknown host function request, ignoring"
                );
                continue;
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                plugin = %ctx.plugin_name(),
                function = %req.function,
                error = %e,
                "host function request failed"
            );
        }
    }
}

/// `{name, payload?, run_in?: {amount, unit}, run_at?: RFC 3339}`.
/// Without `run_in` or `run_at` the job runs now.
async fn run_job_request(ctx: &PluginContext, args: &Value) -> Result<(), PluginError> {
    let mut call = ctx.jobs().job(str_arg(args, "name"));
    if let Some(payload) = args.get("payload").filter(|p| !p.is_null()) {
        call = call.payload(payload.clone());
    }

    if let Some(run_in) = args.get("run_in") {
        let amount = run_in["amount"]
            .as_i64()
            .ok_or_else(|| PluginError::handler("run_in needs an integer amount"))?;
        return call.run_in(amount, str_arg(run_in, "unit")).await;
    }
    if let Some(at) = args.get("run_at").and_then(Value::as_str) {
        let at = DateTime::parse_from_rfc3339(at)
            .map_err(|e| PluginError::handler(format!("run_at is not RFC 3339: {e}")))?;
        return call.run_at(at.with_timezone(&Utc)).await;
    }
    call.run_now().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use crate::jobs::JobStore;
    use crate::sandbox::{test_wasm::PROCESS_EVENT_ONLY, SandboxConfig};
    use serde_json::json;

    fn requests(value: Value) -> Vec<HostRequest> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_cache_host_requests() {
        let (ctx, _) = context("wasm", &[]);
        process_host_requests(
            &ctx,
            requests(json!([
                {"function": "cache_set", "args": {"key": "a", "value": {"n": 1}}},
                {"function": "cache_incr", "args": {"key": "hits"}},
                {"function": "cache_incr", "args": {"key": "hits"}},
                {"function": "cache_expire", "args": {"key": "a", "ttl_seconds": 60}},
            ])),
        )
        .await;

        assert_eq!(ctx.cache().get("a", 0).await.unwrap(), json!({"n": 1}));
        assert_eq!(ctx.cache().get("hits", 0).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_run_job_host_requests() {
        let (ctx, queue) = context("wasm", &["sync"]);
        process_host_requests(
            &ctx,
            requests(json!([
                {"function": "run_job", "args": {"name": "sync", "payload": {"page": 1}}},
                {"function": "run_job", "args": {"name": "sync", "run_in": {"amount": 1, "unit": "hour"}}},
                {"function": "run_job", "args": {"name": "sync", "run_at": "2030-01-01T00:00:00Z"}},
                {"function": "run_job", "args": {"name": "undeclared"}},
            ])),
        )
        .await;

        let jobs = queue
            .store()
            .list_for_plugin(ctx.plugin_id(), 10)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.job_name == "sync"));
        assert!(jobs.iter().any(|j| j.payload == Some(json!({"page": 1}))));
    }

    #[tokio::test]
    async fn test_unknown_and_failing_requests_are_skipped() {
        let (ctx, _) = context("wasm", &[]);
        process_host_requests(
            &ctx,
            requests(json!([
                {"function": "format_disk"},
                {"function": "cache_expire", "args": {"key": "x"}},
                {"function": "cache_set", "args": {"key": "after", "value": true}},
            ])),
        )
        .await;
        assert_eq!(ctx.cache().get("after", false).await.unwrap(), json!(true));
    }

    #[test]
    fn test_output_defaults() {
        let output: WasmOutput = serde_json::from_str("{}").unwrap();
        assert!(output.event.is_none());
        assert!(output.global.is_none());
        assert!(output.host_requests.is_empty());
    }

    #[test]
    fn test_input_shape() {
        let event = PluginEvent::new("signup", "u1");
        let global = Global::new();
        let input = serde_json::to_value(WasmInput {
            event: Some(&event),
            payload: None,
            config: json!({"token": "abc"}),
            global: &global,
        })
        .unwrap();
        assert_eq!(input["event"]["event"], "signup");
        assert!(input.get("payload").is_none());
        assert_eq!(input["config"]["token"], "abc");
    }

    #[test]
    fn test_module_capabilities_follow_exports() {
        let sandbox = PluginSandbox::from_bytes(
            PROCESS_EVENT_ONLY.to_vec(),
            SandboxConfig::default(),
            "minimal",
        )
        .unwrap();
        let module = wasm_module(sandbox);
        assert_eq!(module.capabilities(), vec!["processEvent"]);
        assert!(module.job_names().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_keep_every_global_update() {
        let (ctx, _) = context("wasm", &[]);
        ctx.global().await.insert("n".into(), json!(0));

        let bump = |input: Vec<u8>| -> Result<Vec<u8>, PluginError> {
            let input: Value = serde_json::from_slice(&input)?;
            let n = input["global"]["n"].as_i64().unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(serde_json::to_vec(&json!({"global": {"n": n + 1}}))?)
        };

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            set.spawn(async move {
                call_with_global(&ctx, "onEvent", None, None, bump)
                    .await
                    .unwrap();
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap();
        }

        assert_eq!(ctx.global().await["n"], json!(8));
    }

    #[tokio::test]
    async fn test_empty_output_leaves_global_alone() {
        let (ctx, _) = context("wasm", &[]);
        ctx.global().await.insert("kept".into(), json!(true));
        let output = call_with_global(&ctx, "onEvent", None, None, |_| Ok(Vec::new()))
            .await
            .unwrap();
        assert!(output.event.is_none());
        assert_eq!(ctx.global().await["kept"], json!(true));
    }
}
