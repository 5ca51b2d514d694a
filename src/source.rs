//! Source Registry (C3).

use dashmap::DashMap;
use tracing::info;

use crate::error::{CapcastError, Result};
use crate::model::{Source, SourceId, MIN_FETCH_INTERVAL_SECONDS};

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: DashMap<SourceId, Source>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_active(&self) -> Vec<Source> {
        self.sources.iter().filter(|e| e.value().active).map(|e| e.value().clone()).collect()
    }

    pub fn get_default(&self) -> Option<Source> {
        self.sources.iter().find(|e| e.value().default).map(|e| e.value().clone())
    }

    pub fn get_by_id(&self, id: SourceId) -> Option<Source> {
        self.sources.get(&id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Source> {
        self.sources.iter().map(|e| e.value().clone()).collect()
    }

    /// True if some *other* source already holds `name` (spec.md §3 "Identity: unique
    /// `name`"; §6 "`sources` (unique `name`)").
    fn name_taken_by_other(&self, name: &str, exclude: SourceId) -> bool {
        self.sources.iter().any(|e| *e.key() != exclude && e.value().name == name)
    }

    /// On write, if `default` is being set true, atomically clear it everywhere else
    /// (spec.md §4.3). `fetchIntervalSeconds` is floored at 30 (spec.md §3). Rejects a name
    /// collision with a typed `ConfigConflict`, same as the single-default-flag conflict.
    pub fn create(&self, mut source: Source) -> Result<Source> {
        if self.name_taken_by_other(&source.name, source.id) {
            return Err(CapcastError::ConfigConflict(format!(
                "a source named {:?} already exists",
                source.name
            )));
        }
        if source.fetch_interval_seconds < MIN_FETCH_INTERVAL_SECONDS {
            source.fetch_interval_seconds = MIN_FETCH_INTERVAL_SECONDS;
        }
        if source.default {
            self.clear_other_defaults(source.id);
        }
        let id = source.id;
        self.sources.insert(id, source);
        Ok(self.sources.get(&id).unwrap().value().clone())
    }

    pub fn update(&self, id: SourceId, mut patch: impl FnMut(&mut Source)) -> Result<Source> {
        let mut candidate = self
            .sources
            .get(&id)
            .ok_or_else(|| CapcastError::SourceNotFound(id.to_string()))?
            .value()
            .clone();
        patch(&mut candidate);
        if candidate.fetch_interval_seconds < MIN_FETCH_INTERVAL_SECONDS {
            candidate.fetch_interval_seconds = MIN_FETCH_INTERVAL_SECONDS;
        }
        if self.name_taken_by_other(&candidate.name, id) {
            return Err(CapcastError::ConfigConflict(format!(
                "a source named {:?} already exists",
                candidate.name
            )));
        }

        let became_default = candidate.default;
        *self
            .sources
            .get_mut(&id)
            .ok_or_else(|| CapcastError::SourceNotFound(id.to_string()))? = candidate.clone();
        if became_default {
            self.clear_other_defaults(id);
        }
        Ok(candidate)
    }

    fn clear_other_defaults(&self, keep: SourceId) {
        for mut entry in self.sources.iter_mut() {
            if entry.id != keep {
                entry.default = false;
            }
        }
    }

    /// Deletion is refused if the record is the last remaining default (spec.md §4.3).
    pub fn delete(&self, id: SourceId) -> Result<()> {
        let source = self
            .sources
            .get(&id)
            .ok_or_else(|| CapcastError::SourceNotFound(id.to_string()))?
            .value()
            .clone();
        if source.default && self.sources.len() == 1 {
            return Err(CapcastError::ConfigConflict(
                "cannot delete the last remaining default source".into(),
            ));
        }
        if source.default {
            return Err(CapcastError::ConfigConflict(
                "cannot delete the default source; assign another default first".into(),
            ));
        }
        self.sources.remove(&id);
        Ok(())
    }

    pub fn record_fetch_attempt(
        &self,
        id: SourceId,
        now: chrono::DateTime<chrono::Utc>,
        success: bool,
        error: Option<String>,
    ) {
        if let Some(mut entry) = self.sources.get_mut(&id) {
            entry.record_fetch_attempt(now, success, error);
        }
    }

    /// Seed a fixed starter list only when the registry is empty (spec.md §6's
    /// `POST /cap-sources/seed`); idempotent.
    pub fn seed_defaults(&self) -> usize {
        if !self.sources.is_empty() {
            return 0;
        }
        let defaults = default_seed_sources();
        let count = defaults.len();
        for mut source in defaults {
            if source.default {
                self.clear_other_defaults(source.id);
            }
            source.fetch_interval_seconds = source.fetch_interval_seconds.max(MIN_FETCH_INTERVAL_SECONDS);
            self.sources.insert(source.id, source);
        }
        info!(count, "seeded default sources");
        count
    }
}

fn default_seed_sources() -> Vec<Source> {
    let mut primary = Source::new(
        "national-default",
        "https://alerts.example.gov/cap/rss.xml",
        "US",
    );
    primary.default = true;
    primary.detail_base_url = "https://alerts.example.gov/cap/detail?identifier=".to_string();
    vec![primary]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_source_can_be_default() {
        let registry = SourceRegistry::new();
        let mut a = Source::new("a", "https://a", "US");
        a.default = true;
        let mut b = Source::new("b", "https://b", "US");
        b.default = true;
        registry.create(a).unwrap();
        registry.create(b.clone()).unwrap();
        let defaults: Vec<_> = registry.list().into_iter().filter(|s| s.default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b.id);
    }

    #[test]
    fn deleting_the_last_default_is_refused() {
        let registry = SourceRegistry::new();
        let mut a = Source::new("a", "https://a", "US");
        a.default = true;
        let id = a.id;
        registry.create(a).unwrap();
        let result = registry.delete(id);
        assert!(result.is_err());
    }

    #[test]
    fn fetch_interval_is_floored_at_minimum() {
        let registry = SourceRegistry::new();
        let mut a = Source::new("a", "https://a", "US");
        a.fetch_interval_seconds = 5;
        let created = registry.create(a).unwrap();
        assert_eq!(created.fetch_interval_seconds, MIN_FETCH_INTERVAL_SECONDS);
    }

    #[test]
    fn seed_defaults_is_idempotent() {
        let registry = SourceRegistry::new();
        assert_eq!(registry.seed_defaults(), 1);
        assert_eq!(registry.seed_defaults(), 0);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn create_rejects_a_duplicate_name() {
        let registry = SourceRegistry::new();
        registry.create(Source::new("dupe", "https://a", "US")).unwrap();
        let result = registry.create(Source::new("dupe", "https://b", "US"));
        assert!(result.is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn update_rejects_renaming_into_a_collision() {
        let registry = SourceRegistry::new();
        let a = registry.create(Source::new("a", "https://a", "US")).unwrap();
        registry.create(Source::new("b", "https://b", "US")).unwrap();
        let result = registry.update(a.id, |s| s.name = "b".to_string());
        assert!(result.is_err());
        assert_eq!(registry.get_by_id(a.id).unwrap().name, "a");
    }
}
