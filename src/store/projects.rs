//! Typed project records on top of the generic record store
//!
//! A [Project] is a saved sketch pinned to a board; a [SharedProject]
//! is its community-published form carrying an author and a like
//! counter. Both round-trip through schemaless records so any
//! [RecordStore] backend can hold them.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Filter, Order, Record, RecordStore};
use crate::{error::StoreError, sketch::Sketch};

pub const PROJECTS_TABLE: &str = "projects";
pub const SHARED_TABLE: &str = "shared_projects";

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn fresh_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// A saved sketch with its target board and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub code: String,
    pub board_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Project {
    pub fn new(name: impl Into<String>, code: impl Into<String>, board_id: impl Into<String>) -> Self {
        let now = timestamp_millis();
        Project {
            id: fresh_id(),
            name: name.into(),
            code: code.into(),
            board_id: board_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The sketch this project holds.
    pub fn sketch(&self) -> Sketch {
        Sketch::new(&self.id, &self.name, &self.code)
    }
}

/// A community-published project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedProject {
    pub id: String,
    pub name: String,
    pub description: String,
    pub code: String,
    pub board_id: String,
    pub author: String,
    pub likes: u64,
    pub shared_at: u64,
}

impl SharedProject {
    pub fn publish(project: &Project, author: impl Into<String>, description: impl Into<String>) -> Self {
        SharedProject {
            id: project.id.clone(),
            name: project.name.clone(),
            description: description.into(),
            code: project.code.clone(),
            board_id: project.board_id.clone(),
            author: author.into(),
            likes: 0,
            shared_at: timestamp_millis(),
        }
    }
}

fn to_record<T: Serialize>(table: &str, value: &T) -> Result<Record, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::MissingField {
            table: table.to_string(),
            field: "id",
        }),
    }
}

fn from_record<T: for<'de> Deserialize<'de>>(record: Record) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Project persistence facade over a [RecordStore].
#[derive(Clone)]
pub struct ProjectStore {
    store: Arc<dyn RecordStore>,
}

impl ProjectStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        ProjectStore { store }
    }

    /// Save or overwrite a project, bumping its update timestamp.
    pub fn save(&self, project: &Project) -> Result<(), StoreError> {
        let mut project = project.clone();
        project.updated_at = timestamp_millis();
        self.store
            .upsert(PROJECTS_TABLE, "id", to_record(PROJECTS_TABLE, &project)?)
    }

    pub fn load(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let rows = self
            .store
            .select(PROJECTS_TABLE, &Filter::new().eq("id", id), None)?;
        rows.into_iter().next().map(from_record).transpose()
    }

    /// All projects, most recently updated first.
    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        self.store
            .select(
                PROJECTS_TABLE,
                &Filter::new(),
                Some(("updated_at", Order::Descending)),
            )?
            .into_iter()
            .map(from_record)
            .collect()
    }

    /// Remove a project, reporting whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .store
            .delete(PROJECTS_TABLE, &Filter::new().eq("id", id))?;
        Ok(removed > 0)
    }

    /// Publish a project to the community table.
    pub fn share(&self, shared: &SharedProject) -> Result<(), StoreError> {
        self.store
            .upsert(SHARED_TABLE, "id", to_record(SHARED_TABLE, shared)?)
    }

    /// All shared projects, most liked first.
    pub fn shared(&self) -> Result<Vec<SharedProject>, StoreError> {
        self.store
            .select(SHARED_TABLE, &Filter::new(), Some(("likes", Order::Descending)))?
            .into_iter()
            .map(from_record)
            .collect()
    }

    /// Add a like to a shared project, reporting whether it existed.
    pub fn like(&self, id: &str) -> Result<bool, StoreError> {
        let rows = self
            .store
            .select(SHARED_TABLE, &Filter::new().eq("id", id), None)?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(false);
        };

        let mut shared: SharedProject = from_record(row)?;
        shared.likes += 1;
        self.share(&shared)?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    fn store() -> ProjectStore {
        ProjectStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn saved_projects_can_be_loaded_back_by_id() {
        let store = store();
        let project = Project::new("Blink", Sketch::blink().code, "esp32-dev");
        store.save(&project).unwrap();

        let loaded = store.load(&project.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Blink");
        assert_eq!(loaded.board_id, "esp32-dev");
        assert_eq!(loaded.code, project.code);
    }

    #[test]
    fn saving_twice_keeps_a_single_record() {
        let store = store();
        let mut project = Project::new("Blink", "void loop() {}", "esp32-dev");
        store.save(&project).unwrap();

        project.name = "Blink v2".into();
        store.save(&project).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Blink v2");
    }

    #[test]
    fn listing_orders_by_most_recent_update() {
        let mut older = Project::new("older", "void loop() {}", "esp32-dev");
        let mut newer = Project::new("newer", "void loop() {}", "arduino-uno");
        older.updated_at = 1_000;
        newer.updated_at = 2_000;
        // Insert directly so the timestamps are not bumped on save.
        let raw = MemoryStore::new();
        raw.upsert(PROJECTS_TABLE, "id", to_record(PROJECTS_TABLE, &older).unwrap())
            .unwrap();
        raw.upsert(PROJECTS_TABLE, "id", to_record(PROJECTS_TABLE, &newer).unwrap())
            .unwrap();
        let store = ProjectStore::new(Arc::new(raw));

        let names: Vec<String> = store.list().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["newer", "older"]);
    }

    #[test]
    fn deleting_a_missing_project_reports_false() {
        let store = store();
        assert!(!store.delete("nope").unwrap());

        let project = Project::new("Blink", "void loop() {}", "esp32-dev");
        store.save(&project).unwrap();
        assert!(store.delete(&project.id).unwrap());
        assert!(store.load(&project.id).unwrap().is_none());
    }

    #[test]
    fn likes_accumulate_and_sort_shared_projects() {
        let store = store();
        let quiet = Project::new("quiet", "void loop() {}", "esp32-dev");
        let popular = Project::new("popular", "void loop() {}", "esp32-dev");
        store
            .share(&SharedProject::publish(&quiet, "ada", "does nothing"))
            .unwrap();
        store
            .share(&SharedProject::publish(&popular, "ada", "does nothing, loudly"))
            .unwrap();

        assert!(store.like(&popular.id).unwrap());
        assert!(store.like(&popular.id).unwrap());
        assert!(!store.like("nope").unwrap());

        let shared = store.shared().unwrap();
        assert_eq!(shared[0].name, "popular");
        assert_eq!(shared[0].likes, 2);
        assert_eq!(shared[1].likes, 0);
    }
}
