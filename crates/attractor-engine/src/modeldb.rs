use crate::errors::AttractorError;
use crate::fsutil::{atomic_write_bytes, read_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Model catalog snapshot in the OpenRouter `/api/v1/models` payload shape.
/// Only `data[].id` matters to the engine; everything else is carried
/// opaquely by the snapshot file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub data: Vec<CatalogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
}

#[derive(Clone, Debug, Default)]
pub struct ModelCatalog {
    ids: BTreeSet<String>,
}

impl ModelCatalog {
    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Self {
        Self {
            ids: snapshot
                .data
                .iter()
                .map(|entry| entry.id.trim().to_ascii_lowercase())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, AttractorError> {
        let snapshot: CatalogSnapshot = read_json(path)?;
        Ok(Self::from_snapshot(&snapshot))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Catalog membership for a `(provider, model)` pair. Both canonical ids
    /// (`openai/gpt-4o`) and provider-relative ids (`gpt-4o` with provider
    /// `openai`) are honored.
    pub fn has_provider_model(&self, provider: &str, model: &str) -> bool {
        let provider = provider.trim().to_ascii_lowercase();
        let model = model.trim().to_ascii_lowercase();
        if model.is_empty() {
            return false;
        }
        if self.ids.contains(&model) {
            return true;
        }
        if !provider.is_empty() {
            if self.ids.contains(&format!("{provider}/{model}")) {
                return true;
            }
            if let Some(relative) = model.strip_prefix(&format!("{provider}/")) {
                if self.ids.contains(relative) {
                    return true;
                }
            }
        }
        false
    }
}

/// Copy the configured catalog snapshot under the run's logs root so the
/// run is pinned to the catalog it was validated against.
pub fn pin_snapshot(source: &Path, logs_root: &Path) -> Result<(), AttractorError> {
    let bytes = std::fs::read(source).map_err(|error| AttractorError::io(source, error))?;
    // Validate the shape before pinning so a corrupt snapshot fails loudly.
    serde_json::from_slice::<CatalogSnapshot>(&bytes).map_err(|error| {
        AttractorError::Runtime(format!(
            "catalog snapshot {} is not an OpenRouter models payload: {error}",
            source.display()
        ))
    })?;
    atomic_write_bytes(&logs_root.join(crate::artifacts::MODELDB_SNAPSHOT), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn catalog(ids: &[&str]) -> ModelCatalog {
        ModelCatalog::from_snapshot(&CatalogSnapshot {
            data: ids
                .iter()
                .map(|id| CatalogEntry { id: id.to_string() })
                .collect(),
        })
    }

    #[test]
    fn has_provider_model_canonical_and_relative_forms() {
        let catalog = catalog(&["openai/gpt-4o", "anthropic/claude-sonnet-4"]);

        assert!(catalog.has_provider_model("openai", "gpt-4o"));
        assert!(catalog.has_provider_model("openai", "openai/gpt-4o"));
        assert!(catalog.has_provider_model("", "anthropic/claude-sonnet-4"));
        assert!(!catalog.has_provider_model("openai", "gpt-9000"));
        assert!(!catalog.has_provider_model("google", "gpt-4o"));
    }

    #[test]
    fn has_provider_model_case_insensitive() {
        let catalog = catalog(&["OpenAI/GPT-4o"]);
        assert!(catalog.has_provider_model("openai", "gpt-4o"));
    }

    #[test]
    fn pin_snapshot_round_trip() {
        let temp = TempDir::new().expect("temp dir should create");
        let source = temp.path().join("models.json");
        std::fs::write(
            &source,
            json!({"data": [{"id": "openai/gpt-4o", "context_length": 128000}]}).to_string(),
        )
        .expect("write snapshot");

        let logs_root = temp.path().join("logs");
        pin_snapshot(&source, &logs_root).expect("pin should succeed");

        let pinned = ModelCatalog::load(&logs_root.join(crate::artifacts::MODELDB_SNAPSHOT))
            .expect("pinned catalog should load");
        assert!(pinned.has_provider_model("openai", "gpt-4o"));
    }

    #[test]
    fn pin_snapshot_rejects_non_catalog_payload() {
        let temp = TempDir::new().expect("temp dir should create");
        let source = temp.path().join("models.json");
        std::fs::write(&source, "[1, 2, 3]").expect("write snapshot");

        let error = pin_snapshot(&source, &temp.path().join("logs")).expect_err("should fail");
        assert!(error.to_string().contains("models payload"));
    }
}
