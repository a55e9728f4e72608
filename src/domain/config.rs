//! Local cache of device configuration values.
//!
//! Entries are keyed by record id and kept in first-seen order. Updates replace
//! the fields of an existing entry in place, so observers holding an index or an
//! id keep pointing at the same item.

use crate::domain::models::ConfigRecord;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Configuration items the dashboard asks for, with their display labels.
pub const WELL_KNOWN_CONFIG: &[(&str, &str)] = &[
    ("iso", "ISO"),
    ("shutterspeed", "Shutter Speed"),
    ("f-number", "F-Stop"),
];

/// Label for a config id, falling back to the id itself.
pub fn display_name_for(id: &str) -> String {
    WELL_KNOWN_CONFIG
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| id.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCacheEntry {
    pub id: String,
    pub display_name: String,
    pub value: String,
    pub choices: Vec<String>,
    pub is_read_only: bool,
}

impl ConfigCacheEntry {
    fn from_record(record: ConfigRecord) -> Self {
        Self {
            display_name: display_name_for(&record.id),
            id: record.id,
            value: record.value,
            choices: record.choices,
            is_read_only: record.is_read_only,
        }
    }

    /// Overwrite value, choices and the read-only flag.
    fn apply(&mut self, record: ConfigRecord) {
        self.value = record.value;
        self.choices = record.choices;
        self.is_read_only = record.is_read_only;
    }

    pub fn can_write(&self) -> bool {
        !self.is_read_only
    }

    /// Devices may briefly report a value outside the advertised choices.
    pub fn value_in_choices(&self) -> bool {
        self.choices.is_empty() || self.choices.iter().any(|c| *c == self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigCache {
    entries: Vec<ConfigCacheEntry>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry or update the existing one with the same id.
    pub fn upsert(&mut self, record: ConfigRecord) -> &ConfigCacheEntry {
        match self.entries.iter().position(|e| e.id == record.id) {
            Some(index) => {
                self.entries[index].apply(record);
                &self.entries[index]
            }
            None => {
                self.entries.push(ConfigCacheEntry::from_record(record));
                let last = self.entries.len() - 1;
                &self.entries[last]
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ConfigCacheEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn is_read_only(&self, id: &str) -> bool {
        self.get(id).map(|e| e.is_read_only).unwrap_or(false)
    }

    pub fn entries(&self) -> &[ConfigCacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cache handle shared between the owning context and read-only observers.
#[derive(Debug, Clone, Default)]
pub struct SharedConfigCache(Arc<Mutex<ConfigCache>>);

impl SharedConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A poisoned lock still holds a consistent cache: every mutation is a
    /// single upsert or clear.
    pub fn lock(&self) -> MutexGuard<'_, ConfigCache> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ConfigCache {
        self.lock().clone()
    }

    pub fn entry(&self, id: &str) -> Option<ConfigCacheEntry> {
        self.lock().get(id).cloned()
    }
}
