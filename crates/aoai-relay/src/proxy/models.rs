//! Client model names and the Azure deployments serving them

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;

/// Creation timestamp reported for every entry in the model catalog
const CATALOG_CREATED: u64 = 1677610602;

/// One `[[models]]` entry: the name clients send and the deployment it maps to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelMapping {
    pub name: String,
    pub deployment: String,
}

impl ModelMapping {
    fn new(name: &str, deployment: &str) -> Self {
        Self {
            name: name.to_string(),
            deployment: deployment.to_string(),
        }
    }
}

/// Ordered, immutable mapping from client model name to deployment name.
///
/// Names are unique and non-empty. A name that is not in the map never
/// resolves; there is no fallback deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<ModelMapping>")]
pub struct ModelMap {
    entries: Vec<ModelMapping>,
}

impl ModelMap {
    pub fn new(entries: Vec<ModelMapping>) -> Result<Self, String> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.name.is_empty() {
                return Err("model name must not be empty".to_string());
            }
            if entry.deployment.is_empty() {
                return Err(format!("model '{}' has an empty deployment", entry.name));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(format!("duplicate model name '{}'", entry.name));
            }
        }
        Ok(Self { entries })
    }

    /// Look up the deployment serving `model`.
    pub fn resolve(&self, model: &str) -> Option<&str> {
        if model.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.name == model)
            .map(|entry| entry.deployment.as_str())
    }

    /// Client-visible model names, in configuration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the `/v1/models` listing: one entry per configured name.
    pub fn catalog(&self) -> Value {
        let data: Vec<Value> = self
            .names()
            .map(|name| {
                json!({
                    "id": name,
                    "object": "model",
                    "created": CATALOG_CREATED,
                    "owned_by": "openai",
                    "permission": [{
                        "id": "modelperm-M56FXnG1AsIr3SXq8BYPvXJA",
                        "object": "model_permission",
                        "created": 1679602088,
                        "allow_create_engine": false,
                        "allow_sampling": true,
                        "allow_logprobs": true,
                        "allow_search_indices": false,
                        "allow_view": true,
                        "allow_fine_tuning": false,
                        "organization": "*",
                        "group": null,
                        "is_blocking": false
                    }],
                    "root": name,
                    "parent": null
                })
            })
            .collect();

        json!({
            "object": "list",
            "data": data,
        })
    }
}

impl TryFrom<Vec<ModelMapping>> for ModelMap {
    type Error = String;

    fn try_from(entries: Vec<ModelMapping>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl Default for ModelMap {
    fn default() -> Self {
        Self {
            entries: vec![
                ModelMapping::new("gpt-3.5-turbo", "gpt-35-turbo"),
                ModelMapping::new("gpt-3.5-turbo-16k", "gpt-35-turbo-16k"),
                ModelMapping::new("gpt-4", "gpt-4"),
                ModelMapping::new("gpt-4-32k", "gpt-4-32k"),
            ],
        }
    }
}
