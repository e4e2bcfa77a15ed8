//! Rule persistence.
//!
//! The gate keeps the working copy in memory and writes the whole collection
//! back after every change, so repositories only need load/save.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use super::RuleCollection;
use crate::error::{Error, Result};

/// Storage backend for the approval rule collection.
pub trait RuleRepository: Send + Sync {
    /// Load the stored collection. A missing store is an empty collection.
    fn load(&self) -> Result<RuleCollection>;

    /// Replace the stored collection.
    fn save(&self, rules: &RuleCollection) -> Result<()>;
}

/// Rules stored as a single pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct JsonRuleRepository {
    path: PathBuf,
}

impl JsonRuleRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleRepository for JsonRuleRepository {
    fn load(&self) -> Result<RuleCollection> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No rule file, starting empty");
            return Ok(RuleCollection::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Rules(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let rules: RuleCollection = serde_json::from_str(&content).map_err(|e| {
            Error::Rules(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), count = rules.len(), "Loaded approval rules");
        Ok(rules)
    }

    fn save(&self, rules: &RuleCollection) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(rules)?;
        // Atomic replace: readers see the old file or the new one.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), count = rules.len(), "Saved approval rules");
        Ok(())
    }
}

/// Process-local repository, used when no rule file is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rules: Mutex<RuleCollection>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: RuleCollection) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }
}

impl RuleRepository for MemoryRuleRepository {
    fn load(&self) -> Result<RuleCollection> {
        self.rules
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| Error::Rules("rule store lock poisoned".into()))
    }

    fn save(&self, rules: &RuleCollection) -> Result<()> {
        let mut guard = self
            .rules
            .lock()
            .map_err(|_| Error::Rules("rule store lock poisoned".into()))?;
        *guard = rules.clone();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::rules::ApprovalRule;

    fn sample() -> RuleCollection {
        let mut rules = RuleCollection::default();
        rules
            .upsert(ApprovalRule::global("Bash", Some("^\\{\"command\":\"git"), true))
            .unwrap();
        rules
            .upsert(ApprovalRule::global("WebFetch", None, false).with_description("no web"))
            .unwrap();
        rules
            .upsert(ApprovalRule::for_session("s1", "Write", None, true))
            .unwrap();
        rules
            .upsert(ApprovalRule::for_session("s1", "Edit", None, false))
            .unwrap();
        rules
            .upsert(ApprovalRule::for_session("s2", "Write", None, false))
            .unwrap();
        rules
    }

    fn as_sets(
        rules: &RuleCollection,
    ) -> (HashSet<ApprovalRule>, Vec<(String, HashSet<ApprovalRule>)>) {
        let global = rules.global_rules.iter().cloned().collect();
        let mut sessions: Vec<_> = rules
            .session_rules
            .iter()
            .map(|(id, r)| (id.clone(), r.iter().cloned().collect::<HashSet<_>>()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        (global, sessions)
    }

    #[test]
    fn json_round_trip_is_set_equal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonRuleRepository::new(dir.path().join("rules.json"));
        let original = sample();

        repo.save(&original).unwrap();
        let loaded = repo.load().unwrap();

        assert_eq!(as_sets(&original), as_sets(&loaded));
    }

    #[test]
    fn serialized_shape_uses_collection_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("globalRules").is_some_and(|v| v.is_array()));
        assert!(json.get("sessionRules").is_some_and(|v| v.is_object()));
        assert_eq!(json["sessionRules"]["s1"][0]["scope"], "session");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonRuleRepository::new(dir.path().join("nested").join("rules.json"));
        assert!(repo.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_rules_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "[]]").unwrap();
        let repo = JsonRuleRepository::new(path);
        assert!(matches!(repo.load(), Err(Error::Rules(_))));
    }

    #[test]
    fn memory_repository_stores_copy() {
        let repo = MemoryRuleRepository::new();
        repo.save(&sample()).unwrap();
        assert_eq!(repo.load().unwrap().len(), 5);
    }
}
