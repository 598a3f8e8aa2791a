//! Resolution of a plugin's stored settings against its config schema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::{FieldType, PluginDescriptor};
use crate::error::PluginError;

/// Placeholder shown in place of secret values.
pub const SECRET_MASK: &str = "**************";

/// Uploaded file bound to an attachment field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    pub file_name: String,
    pub contents: Vec<u8>,
}

/// Raw values an operator set for a plugin, before schema resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    pub attachments: HashMap<String, Attachment>,
}

impl PluginSettings {
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, attachment: Attachment) -> Self {
        self.attachments.insert(key.into(), attachment);
        self
    }
}

/// Config values resolved against the schema. Read-only to plugin code.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    values: HashMap<String, String>,
    secret_keys: Vec<String>,
}

impl PluginConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values safe to show outside the plugin. Secrets are masked.
    pub fn public_view(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if self.secret_keys.contains(k) {
                    SECRET_MASK.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }

    /// Values as a JSON object, for handing to sandboxed plugins.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Resolve operator settings against the descriptor's schema.
///
/// Missing values fall back to field defaults. Keys the schema does not
/// declare are ignored.
pub fn resolve(
    descriptor: &PluginDescriptor,
    settings: &PluginSettings,
) -> Result<(PluginConfig, HashMap<String, Attachment>), PluginError> {
    let mut values = HashMap::new();
    let mut attachments = HashMap::new();
    let mut secret_keys = Vec::new();

    for field in descriptor.fields() {
        if field.field_type == FieldType::Attachment {
            match settings.attachments.get(&field.key) {
                Some(attachment) => {
                    attachments.insert(field.key.clone(), attachment.clone());
                }
                None if field.required => {
                    return Err(PluginError::InvalidConfig(format!(
                        "required attachment '{}' is missing",
                        field.key
                    )));
                }
                None => {}
            }
            continue;
        }

        let value = settings
            .config
            .get(&field.key)
            .filter(|v| !v.is_empty())
            .or(field.default.as_ref())
            .filter(|v| !v.is_empty())
            .cloned();

        let Some(value) = value else {
            if field.required {
                return Err(PluginError::InvalidConfig(format!(
                    "required field '{}' has no value",
                    field.key
                )));
            }
            continue;
        };

        if let Some(ref choices) = field.choices {
            if !choices.contains(&value) {
                return Err(PluginError::InvalidConfig(format!(
                    "value '{value}' for '{}' is not one of {choices:?}",
                    field.key
                )));
            }
        }

        if field.secret {
            secret_keys.push(field.key.clone());
        }
        values.insert(field.key.clone(), value);
    }

    for key in settings.config.keys() {
        if descriptor.field(key).is_none() {
            tracing::warn!(plugin = %descriptor.name, key = %key, "ignoring undeclared config key");
        }
    }

    Ok((
        PluginConfig {
            values,
            secret_keys,
        },
        attachments,
    ))
}
