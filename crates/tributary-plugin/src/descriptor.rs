//! Plugin descriptor parsing and validation.
//!
//! Parses `plugin.json` files that declare plugin metadata, the entry
//! point and the ordered config schema rendered by the admin UI.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PluginError;

/// Maximum plugin name length.
const MAX_NAME_LEN: usize = 200;

/// Plugin descriptor parsed from `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Entry point, relative to the plugin directory.
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
}

/// One entry of the config schema: a form field or a markdown block.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConfigEntry {
    Field(ConfigField),
    Markdown { markdown: String },
}

/// A config form field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigField {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    /// Markdown shown next to the field.
    #[serde(default)]
    pub markdown: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Attachment,
    Choice,
}

impl<'de> Deserialize<'de> for ConfigEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = serde_json::Value::deserialize(deserializer)?;
        let is_field = value.get("key").is_some() || value.get("type").is_some();

        if !is_field {
            if let Some(markdown) = value.get("markdown").and_then(|m| m.as_str()) {
                return Ok(ConfigEntry::Markdown {
                    markdown: markdown.to_string(),
                });
            }
            return Err(D::Error::custom(
                "config entry must be a field (key + type) or a markdown block",
            ));
        }

        serde_json::from_value(value)
            .map(ConfigEntry::Field)
            .map_err(D::Error::custom)
    }
}

// ─── Validation helpers ─────────────────────────────────────────────

fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(PluginError::InvalidDescriptor(
            "plugin name must not be empty".into(),
        ));
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(PluginError::InvalidDescriptor(format!(
            "plugin name must be at most {MAX_NAME_LEN} characters, got {len}"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(PluginError::InvalidDescriptor(
            "plugin name must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
pub(crate) fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::InvalidDescriptor(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(PluginError::InvalidDescriptor(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

fn validate_url(value: &str) -> Result<(), PluginError> {
    let url = url::Url::parse(value)
        .map_err(|e| PluginError::InvalidDescriptor(format!("url is not valid: '{value}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PluginError::InvalidDescriptor(format!(
            "url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}

fn validate_field(field: &ConfigField) -> Result<(), PluginError> {
    if field.key.trim().is_empty() {
        return Err(PluginError::InvalidDescriptor(
            "config field key must not be empty".into(),
        ));
    }

    match (field.field_type, field.choices.as_deref()) {
        (FieldType::Choice, None) | (FieldType::Choice, Some([])) => {
            return Err(PluginError::InvalidDescriptor(format!(
                "choice field '{}' must declare at least one choice",
                field.key
            )));
        }
        (FieldType::Choice, Some(choices)) => {
            if let Some(ref default) = field.default {
                if !choices.contains(default) {
                    return Err(PluginError::InvalidDescriptor(format!(
                        "default '{default}' of field '{}' is not one of its choices",
                        field.key
                    )));
                }
            }
        }
        (_, Some(_)) => {
            return Err(PluginError::InvalidDescriptor(format!(
                "field '{}' declares choices but is not of type choice",
                field.key
            )));
        }
        (_, None) => {}
    }

    Ok(())
}

impl PluginDescriptor {
    /// Parse a plugin descriptor from a JSON string.
    pub fn parse(json: &str) -> Result<Self, PluginError> {
        serde_json::from_str(json)
            .map_err(|e| PluginError::InvalidDescriptor(format!("malformed plugin.json: {e}")))
    }

    /// Validate all fields of a parsed descriptor.
    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_name(&self.name)?;

        if let Some(ref url) = self.url {
            validate_url(url)?;
        }

        if let Some(ref main) = self.main {
            validate_path_safety(main, "main")?;
        }

        let mut seen = HashSet::new();
        for field in self.fields() {
            validate_field(field)?;
            if !seen.insert(field.key.as_str()) {
                return Err(PluginError::InvalidDescriptor(format!(
                    "duplicate config key '{}'",
                    field.key
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a plugin descriptor from a JSON string.
    pub fn parse_and_validate(json: &str) -> Result<Self, PluginError> {
        let descriptor = Self::parse(json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Config fields in declaration order, markdown blocks skipped.
    pub fn fields(&self) -> impl Iterator<Item = &ConfigField> {
        self.config.iter().filter_map(|entry| match entry {
            ConfigEntry::Field(field) => Some(field),
            ConfigEntry::Markdown { .. } => None,
        })
    }

    pub fn field(&self, key: &str) -> Option<&ConfigField> {
        self.fields().find(|f| f.key == key)
    }

    /// Whether the entry point is a WASM module.
    pub fn is_wasm(&self) -> bool {
        self.main.as_deref().is_some_and(|m| m.ends_with(".wasm"))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
