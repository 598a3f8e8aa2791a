//! WASM plugin sandbox using Extism (wasmtime).
//!
//! Each WASM plugin runs in its own isolated instance with a memory cap
//! and a per-call fuel budget.

use std::path::Path;

use crate::error::PluginError;

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1
    "wasi_unstable",          // Legacy WASI
];

// ─── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Fuel (instructions) per call (default: 1_000_000).
    pub fuel_limit: u64,
    /// Off by default: plugins get no env vars, filesystem or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Static checks ──────────────────────────────────────────────────

/// Reject binaries that are not WASM or import outside the allowed
/// namespaces.
pub fn validate_wasm(wasm_bytes: &[u8]) -> Result<(), PluginError> {
    use wasmparser::{Parser, Payload};

    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(PluginError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload =
            payload.map_err(|e| PluginError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    PluginError::WasmValidation(format!("failed to read import: {e}"))
                })?;
                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(PluginError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}')",
                        import.module, import.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Names of the functions a module exports.
pub fn exported_functions(wasm_bytes: &[u8]) -> Result<Vec<String>, PluginError> {
    use wasmparser::{ExternalKind, Parser, Payload};

    let mut names = Vec::new();
    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload =
            payload.map_err(|e| PluginError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| {
                    PluginError::WasmValidation(format!("failed to read export: {e}"))
                })?;
                if export.kind == ExternalKind::Func {
                    names.push(export.name.to_string());
                }
            }
        }
    }
    Ok(names)
}

// ─── Sandbox ────────────────────────────────────────────────────────

/// A loaded WASM plugin instance.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    plugin_name: String,
    exports: Vec<String>,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_name", &self.plugin_name)
            .field("config", &self.config)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Load a WASM plugin from disk.
    pub fn load(wasm_path: &Path, config: SandboxConfig, name: &str) -> Result<Self, PluginError> {
        let wasm_bytes = std::fs::read(wasm_path)?;
        Self::from_bytes(wasm_bytes, config, name)
    }

    /// Validate and instantiate a WASM module.
    pub fn from_bytes(
        wasm_bytes: Vec<u8>,
        config: SandboxConfig,
        name: &str,
    ) -> Result<Self, PluginError> {
        validate_wasm(&wasm_bytes)?;
        let exports = exported_functions(&wasm_bytes)?;

        let pages = u32::try_from(config.memory_limit / 65536).unwrap_or(u32::MAX);
        let manifest =
            extism::Manifest::new([extism::Wasm::data(wasm_bytes)]).with_memory_max(pages);

        if config.wasi_enabled {
            tracing::warn!(
                plugin = %name,
                "WASI enabled for plugin, it can read environment variables"
            );
        }

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| PluginError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            plugin_name: name.to_string(),
            exports,
        })
    }

    /// Call an exported function with raw bytes.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    PluginError::FuelExhausted(self.plugin_name.clone())
                } else if msg.contains("memory") {
                    PluginError::MemoryExceeded(self.plugin_name.clone())
                } else {
                    PluginError::Sandbox(msg)
                }
            })
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }
}

#[cfg(test)]
pub(crate) mod test_wasm {
    /// Minimal module exporting a no-op `processEvent` function.
    pub const PROCESS_EVENT_ONLY: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
        0x03, 0x02, 0x01, 0x00, // func 0 has type 0
        0x07, 0x10, 0x01, 0x0c, b'p', b'r', b'o', b'c', b'e', b's', b's', b'E', b'v', b'e', b'n',
        b't', 0x00, 0x00, // export "processEvent" func 0
        0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // body: end
    ];

    /// Module importing a function from a forbidden namespace.
    pub const FORBIDDEN_IMPORT: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: () -> ()
        0x02, 0x0c, 0x01, 0x04, b'e', b'v', b'i', b'l', 0x03, b'r', b'u', b'n', 0x00,
        0x00, // import "evil" "run" func type 0
    ];
}
