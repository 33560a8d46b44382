//! Generic record persistence
//!
//! Projects and shared sketches are stored as schemaless JSON records
//! in named tables behind the [RecordStore] trait: insert, upsert,
//! update and delete, plus selection with equality filters and
//! ordering. [MemoryStore] backs tests and ephemeral sessions,
//! [JsonFileStore] persists the tables to a single JSON file.

use std::{
    cmp::Ordering,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::debug;
use serde_json::{Map, Value};

use crate::error::StoreError;

pub mod projects;

/// A single schemaless record.
pub type Record = Map<String, Value>;

/// Conjunction of field equality clauses.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// Require `field` to equal `value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    fn matches(&self, record: &Record) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

/// Sort direction for [RecordStore::select].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// A table-oriented record service with read-your-writes consistency.
pub trait RecordStore: Send + Sync {
    /// Append a record to `table`.
    fn insert(&self, table: &str, record: Record) -> Result<(), StoreError>;

    /// Replace the record whose `key` field matches the new record's,
    /// or insert it if absent. The record must carry the key field.
    fn upsert(&self, table: &str, key: &'static str, record: Record) -> Result<(), StoreError>;

    /// Merge `changes` into every matching record, returning how many
    /// were touched.
    fn update(&self, table: &str, filter: &Filter, changes: Record) -> Result<usize, StoreError>;

    /// Remove matching records, returning how many were removed.
    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError>;

    /// Matching records, optionally sorted by a field.
    fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<(&str, Order)>,
    ) -> Result<Vec<Record>, StoreError>;
}

type Tables = HashMap<String, Vec<Record>>;

fn apply_upsert(
    tables: &mut Tables,
    table: &str,
    key: &'static str,
    record: Record,
) -> Result<(), StoreError> {
    let key_value = record
        .get(key)
        .cloned()
        .ok_or_else(|| StoreError::MissingField {
            table: table.to_string(),
            field: key,
        })?;

    let rows = tables.entry(table.to_string()).or_default();
    match rows.iter_mut().find(|row| row.get(key) == Some(&key_value)) {
        Some(row) => *row = record,
        None => rows.push(record),
    }

    Ok(())
}

fn apply_update(tables: &mut Tables, table: &str, filter: &Filter, changes: &Record) -> usize {
    let Some(rows) = tables.get_mut(table) else {
        return 0;
    };

    let mut touched = 0;
    for row in rows.iter_mut().filter(|row| filter.matches(row)) {
        for (field, value) in changes {
            row.insert(field.clone(), value.clone());
        }
        touched += 1;
    }

    touched
}

fn apply_delete(tables: &mut Tables, table: &str, filter: &Filter) -> usize {
    let Some(rows) = tables.get_mut(table) else {
        return 0;
    };

    let before = rows.len();
    rows.retain(|row| !filter.matches(row));

    before - rows.len()
}

fn apply_select(
    tables: &Tables,
    table: &str,
    filter: &Filter,
    order: Option<(&str, Order)>,
) -> Vec<Record> {
    let mut rows: Vec<Record> = tables
        .get(table)
        .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
        .unwrap_or_default();

    if let Some((field, direction)) = order {
        rows.sort_by(|a, b| {
            let ordering = compare_values(a.get(field), b.get(field));
            match direction {
                Order::Ascending => ordering,
                Order::Descending => ordering.reverse(),
            }
        });
    }

    rows
}

/// Total order over the JSON values we sort by. Numbers and strings
/// compare naturally, everything else is considered equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// In-memory [RecordStore].
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, table: &str, record: Record) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().push(record);
        Ok(())
    }

    fn upsert(&self, table: &str, key: &'static str, record: Record) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        apply_upsert(&mut tables, table, key, record)
    }

    fn update(&self, table: &str, filter: &Filter, changes: Record) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        Ok(apply_update(&mut tables, table, filter, &changes))
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        Ok(apply_delete(&mut tables, table, filter))
    }

    fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<(&str, Order)>,
    ) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(apply_select(&tables, table, filter, order))
    }
}

/// [RecordStore] persisted to a single JSON file.
///
/// The whole table map is kept in memory and rewritten after every
/// mutation; fine for the handful of project records this holds.
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories and
    /// starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Tables::new()
        };

        debug!("opened record store at {}", path.display());

        Ok(JsonFileStore {
            path,
            tables: Mutex::new(tables),
        })
    }

    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(tables)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl RecordStore for JsonFileStore {
    fn insert(&self, table: &str, record: Record) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().push(record);
        self.persist(&tables)
    }

    fn upsert(&self, table: &str, key: &'static str, record: Record) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        apply_upsert(&mut tables, table, key, record)?;
        self.persist(&tables)
    }

    fn update(&self, table: &str, filter: &Filter, changes: Record) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let touched = apply_update(&mut tables, table, filter, &changes);
        if touched > 0 {
            self.persist(&tables)?;
        }
        Ok(touched)
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let removed = apply_delete(&mut tables, table, filter);
        if removed > 0 {
            self.persist(&tables)?;
        }
        Ok(removed)
    }

    fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<(&str, Order)>,
    ) -> Result<Vec<Record>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(apply_select(&tables, table, filter, order))
    }
}
