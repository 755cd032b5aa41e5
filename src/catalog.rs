//! The parsed model catalogue backing `/v1/models` and the pipeline's
//! unknown-model check. Normally seeded from the UI session at startup; an
//! HTTP refresh exists as a fallback for deployments that expose a model
//! list endpoint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ModelEntry {
    pub fn new(id: &str) -> Self {
        ModelEntry {
            id: id.to_string(),
            object: "model".to_string(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
    default_id: String,
}

impl ModelCatalog {
    /// Catalogue holding only the fallback id; the "catalogue unavailable"
    /// shape.
    pub fn with_default(default_id: &str) -> Self {
        ModelCatalog {
            entries: vec![ModelEntry::new(default_id)],
            default_id: default_id.to_string(),
        }
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn replace(&mut self, ids: Vec<String>) {
        if ids.is_empty() {
            self.entries = vec![ModelEntry::new(&self.default_id)];
            return;
        }
        self.entries = ids.iter().map(|id| ModelEntry::new(id)).collect();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Entries minus the configured exclusion set, for `/v1/models`.
    pub fn entries_excluding(&self, excludes: &[String]) -> Vec<ModelEntry> {
        self.entries
            .iter()
            .filter(|e| !excludes.iter().any(|x| x == &e.id))
            .cloned()
            .collect()
    }
}

/// Optional HTTP refresh. Accepts either the OpenAI list shape
/// (`{"data":[{"id":…}]}`) or a bare `{"models":[{"name":…}]}` listing.
pub async fn fetch_model_ids(http: &reqwest::Client, url: &str) -> anyhow::Result<Vec<String>> {
    let value: serde_json::Value = http.get(url).send().await?.json().await?;
    let mut ids = Vec::new();
    if let Some(data) = value.get("data").and_then(|v| v.as_array()) {
        for item in data {
            if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                ids.push(id.to_string());
            }
        }
    } else if let Some(models) = value.get("models").and_then(|v| v.as_array()) {
        for item in models {
            if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
                // Provider listings prefix ids with "models/".
                ids.push(name.trim_start_matches("models/").to_string());
            }
        }
    }
    anyhow::ensure!(!ids.is_empty(), "model listing at {url} held no ids");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_catalog_holds_default() {
        let catalog = ModelCatalog::with_default("m-default");
        assert!(catalog.contains("m-default"));
        assert_eq!(catalog.entries_excluding(&[]).len(), 1);
    }

    #[test]
    fn replace_and_exclude() {
        let mut catalog = ModelCatalog::with_default("m-default");
        catalog.replace(vec!["a".into(), "b".into(), "c".into()]);
        assert!(catalog.contains("b"));
        assert!(!catalog.contains("m-default"));
        let visible = catalog.entries_excluding(&["b".to_string()]);
        assert_eq!(
            visible.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn empty_replace_falls_back() {
        let mut catalog = ModelCatalog::with_default("m-default");
        catalog.replace(vec![]);
        assert!(catalog.contains("m-default"));
    }
}
