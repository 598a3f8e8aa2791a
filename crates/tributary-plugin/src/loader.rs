//! Loading WASM plugins from a plugins directory.
//!
//! Layout, one directory per plugin:
//!
//! ```text
//! plugins/
//!   geoip/
//!     plugin.json      descriptor, `main` points at the .wasm file
//!     settings.json    optional: order, config values, attachment paths
//!     dist/plugin.wasm
//!     data/GeoLite2.mmdb
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{Attachment, PluginSettings};
use crate::descriptor::{validate_path_safety, PluginDescriptor};
use crate::error::PluginError;
use crate::registry::PluginInstall;
use crate::sandbox::{PluginSandbox, SandboxConfig};
use crate::wasm::wasm_module;

const DESCRIPTOR_FILE: &str = "plugin.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    order: i32,
    #[serde(default)]
    config: HashMap<String, String>,
    /// Attachment field key to a file path relative to the plugin directory.
    #[serde(default)]
    attachments: HashMap<String, String>,
}

/// A plugin read from disk, not yet instantiated.
#[derive(Debug, Clone)]
pub struct PluginBundle {
    pub dir: PathBuf,
    pub descriptor: PluginDescriptor,
    pub settings: PluginSettings,
    pub order: i32,
    pub wasm_path: PathBuf,
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Read `plugin.json`, `settings.json` and attachment files of one plugin.
pub async fn read_plugin_dir(dir: &Path) -> Result<PluginBundle, PluginError> {
    let raw = tokio::fs::read_to_string(dir.join(DESCRIPTOR_FILE)).await?;
    let descriptor = PluginDescriptor::parse_and_validate(&raw)?;

    let main = descriptor.main.clone().ok_or_else(|| {
        PluginError::InvalidDescriptor(format!("plugin '{}' has no main entry", descriptor.name))
    })?;
    if !descriptor.is_wasm() {
        return Err(PluginError::InvalidDescriptor(format!(
            "plugin '{}': main must be a .wasm module, got '{main}'",
            descriptor.name
        )));
    }

    let settings_path = dir.join(SETTINGS_FILE);
    let file: SettingsFile = if tokio::fs::try_exists(&settings_path).await? {
        let raw = tokio::fs::read_to_string(&settings_path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| PluginError::InvalidConfig(format!("malformed settings.json: {e}")))?
    } else {
        SettingsFile::default()
    };

    let mut settings = PluginSettings {
        config: file.config,
        attachments: HashMap::new(),
    };
    for (key, rel) in file.attachments {
        validate_path_safety(&rel, "attachment path")?;
        let path = dir.join(&rel);
        let contents = tokio::fs::read(&path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(rel.as_str())
            .to_string();
        settings.attachments.insert(
            key,
            Attachment {
                content_type: content_type_for(&path).to_string(),
                file_name,
                contents,
            },
        );
    }

    Ok(PluginBundle {
        dir: dir.to_path_buf(),
        wasm_path: dir.join(main),
        descriptor,
        settings,
        order: file.order,
    })
}

/// Read every plugin under `plugin_dir`. Directories that fail to read
/// are logged and skipped. A missing `plugin_dir` yields no plugins.
pub async fn discover(plugin_dir: &Path) -> Result<Vec<PluginBundle>, PluginError> {
    if !tokio::fs::try_exists(plugin_dir).await? {
        tracing::info!(dir = %plugin_dir.display(), "plugin directory does not exist, no plugins loaded");
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(plugin_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut bundles = Vec::new();
    for dir in dirs {
        if !tokio::fs::try_exists(dir.join(DESCRIPTOR_FILE)).await? {
            continue;
        }
        match read_plugin_dir(&dir).await {
            Ok(bundle) => bundles.push(bundle),
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "skipping plugin directory");
            }
        }
    }
    Ok(bundles)
}

impl PluginBundle {
    /// Instantiate the WASM module and build an install request.
    pub async fn into_install(self, sandbox: SandboxConfig) -> Result<PluginInstall, PluginError> {
        let name = self.descriptor.name.clone();
        let wasm_path = self.wasm_path.clone();
        let sandbox = tokio::task::spawn_blocking(move || {
            PluginSandbox::load(&wasm_path, sandbox, &name)
        })
        .await
        .map_err(|e| PluginError::Sandbox(format!("sandbox load did not complete: {e}")))??;

        Ok(PluginInstall::new(self.descriptor, wasm_module(sandbox))
            .order(self.order)
            .settings(self.settings))
    }
}
