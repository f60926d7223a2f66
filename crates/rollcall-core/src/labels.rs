//! Label map: numeric model label → enrolled identity.
//!
//! The canonical file shape is `{ "<label>": {"id": "...", "name": "..."} }`.
//! Older training runs wrote either bare strings or objects with only one of
//! the two fields; those are rejected on load and converted explicitly with
//! [`LabelMap::migrate_legacy`].

use crate::model_store::{read_artifact, ModelStoreError};
use crate::types::Identity;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    entries: BTreeMap<i32, Identity>,
}

impl LabelMap {
    pub fn from_entries(entries: impl IntoIterator<Item = (i32, Identity)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Load a canonical label map.
    pub fn load(path: &Path) -> Result<Self, ModelStoreError> {
        let raw = read_artifact(path, "label map")?;
        Self::parse(&raw, &path.display().to_string())
    }

    /// Parse a canonical label map; `origin` names the source in errors.
    pub fn parse(json: &str, origin: &str) -> Result<Self, ModelStoreError> {
        let mut entries = BTreeMap::new();
        for (key, value) in parse_object(json, origin)? {
            let label = parse_label(&key, origin)?;
            let identity = match value {
                Value::String(_) => {
                    return Err(ModelStoreError::LegacyLabelShape {
                        path: origin.to_string(),
                        label: key,
                    })
                }
                other => serde_json::from_value::<Identity>(other).map_err(|e| {
                    ModelStoreError::Invalid {
                        path: origin.to_string(),
                        reason: format!("label {key}: {e}"),
                    }
                })?,
            };
            if identity.id.trim().is_empty() {
                return Err(ModelStoreError::Invalid {
                    path: origin.to_string(),
                    reason: format!("label {key}: empty identity id"),
                });
            }
            entries.insert(label, identity);
        }
        Ok(Self { entries })
    }

    /// Convert a legacy label map into the canonical shape.
    ///
    /// Bare strings become `{id: s, name: s}`; objects take `id`, falling back
    /// to `name`, then to the label itself, and `name` falls back to the id.
    /// Canonical entries pass through unchanged.
    pub fn migrate_legacy(json: &str, origin: &str) -> Result<Self, ModelStoreError> {
        let mut entries = BTreeMap::new();
        for (key, value) in parse_object(json, origin)? {
            let label = parse_label(&key, origin)?;
            let identity = match value {
                Value::String(s) => Identity {
                    id: s.clone(),
                    name: s,
                },
                Value::Object(obj) => {
                    let field = |name: &str| obj.get(name).and_then(scalar_to_string);
                    let id = field("id").or_else(|| field("name")).unwrap_or_else(|| key.clone());
                    let name = field("name").unwrap_or_else(|| id.clone());
                    Identity { id, name }
                }
                other => {
                    return Err(ModelStoreError::Invalid {
                        path: origin.to_string(),
                        reason: format!("label {key}: unsupported entry {other}"),
                    })
                }
            };
            entries.insert(label, identity);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, label: i32) -> Option<&Identity> {
        self.entries.get(&label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical JSON, keys as decimal strings.
    pub fn to_json(&self) -> String {
        let obj: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(label, identity)| {
                (
                    label.to_string(),
                    serde_json::json!({ "id": identity.id, "name": identity.name }),
                )
            })
            .collect();
        // A map of string/object values always serializes.
        serde_json::to_string_pretty(&Value::Object(obj)).unwrap_or_default()
    }
}

fn parse_object(json: &str, origin: &str) -> Result<BTreeMap<String, Value>, ModelStoreError> {
    serde_json::from_str(json).map_err(|source| ModelStoreError::Parse {
        path: origin.to_string(),
        source,
    })
}

fn parse_label(key: &str, origin: &str) -> Result<i32, ModelStoreError> {
    key.trim().parse().map_err(|_| ModelStoreError::Invalid {
        path: origin.to_string(),
        reason: format!("label key {key:?} is not an integer"),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
