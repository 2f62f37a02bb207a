//! Quest Catalog
//!
//! Loads and caches quest definitions from TOML files at startup. The
//! catalog is immutable once loaded and shared across the engine via Arc.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::EngineError;
use crate::quest::definition::{Quest, QuestDefinition, RawQuestFile};

pub struct QuestCatalog {
    quests: HashMap<String, Arc<QuestDefinition>>,
    /// Ids in load order, for stable catalog listings.
    order: Vec<String>,
}

impl QuestCatalog {
    pub fn empty() -> Self {
        Self {
            quests: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Build a catalog directly from definitions (tests, embedded catalogs).
    pub fn from_definitions(defs: Vec<QuestDefinition>) -> Self {
        let mut catalog = Self::empty();
        for def in defs {
            catalog.insert(def);
        }
        catalog
    }

    /// Load every quest TOML file under `dir`, recursively. A malformed
    /// file is logged and skipped; it does not fail the rest of the load.
    pub fn load_from_directory(dir: &Path) -> Result<Self, EngineError> {
        info!("Loading quest catalog from {:?}", dir);

        let mut catalog = Self::empty();
        if !dir.exists() {
            warn!("Quest catalog directory does not exist: {:?}", dir);
            return Ok(catalog);
        }

        let mut paths = Vec::new();
        collect_toml_files(dir, &mut paths)?;
        paths.sort();

        for path in paths {
            match load_quest_file(&path) {
                Ok(def) => {
                    if catalog.quests.contains_key(&def.id) {
                        warn!("Duplicate quest id '{}' in {:?}, skipping", def.id, path);
                        continue;
                    }
                    catalog.insert(def);
                }
                Err(e) => warn!("Failed to load quest {:?}: {}", path, e),
            }
        }

        info!("Loaded {} quest definitions", catalog.len());
        Ok(catalog)
    }

    fn insert(&mut self, def: QuestDefinition) {
        self.order.push(def.id.clone());
        self.quests.insert(def.id.clone(), Arc::new(def));
    }

    pub fn get(&self, quest_id: &str) -> Option<Arc<QuestDefinition>> {
        self.quests.get(quest_id).cloned()
    }

    /// All definitions in load order.
    pub fn definitions(&self) -> Vec<Arc<QuestDefinition>> {
        self.order
            .iter()
            .filter_map(|id| self.quests.get(id).cloned())
            .collect()
    }

    /// Stamp out a fresh instance of a catalog quest.
    pub fn instantiate(&self, quest_id: &str) -> Option<Quest> {
        self.quests.get(quest_id).map(|def| def.instantiate())
    }

    pub fn len(&self) -> usize {
        self.quests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quests.is_empty()
    }
}

fn collect_toml_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::Catalog(format!("failed to read directory {:?}: {}", dir, e)))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| EngineError::Catalog(format!("failed to read entry: {}", e)))?;
        let path = entry.path();

        if path.is_dir() {
            collect_toml_files(&path, paths)?;
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }

    Ok(())
}

fn load_quest_file(path: &Path) -> Result<QuestDefinition, EngineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Catalog(format!("failed to read {:?}: {}", path, e)))?;
    let raw: RawQuestFile = toml::from_str(&content)
        .map_err(|e| EngineError::Catalog(format!("failed to parse {:?}: {}", path, e)))?;
    QuestDefinition::from_raw(&raw.quest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEST_TOML: &str = r#"
        [quest]
        id = "q1"
        title = "First Light"
        description = "Find the lantern."

        [[quest.steps]]
        id = "s1"
        description = "Search the cellar"

        [quest.reward]
        score = 200
    "#;

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("q1.toml"), QUEST_TOML).unwrap();
        std::fs::write(dir.path().join("broken.toml"), "not really toml [").unwrap();

        let catalog = QuestCatalog::load_from_directory(dir.path()).unwrap();
        // Broken file is skipped, not fatal
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("q1").is_some());
        assert!(catalog.instantiate("missing").is_none());
    }

    #[test]
    fn test_missing_directory_yields_empty_catalog() {
        let catalog =
            QuestCatalog::load_from_directory(Path::new("/nonexistent/quests")).unwrap();
        assert!(catalog.is_empty());
    }
}
