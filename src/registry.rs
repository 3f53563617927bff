//! On-disk repository registry
//!
//! A mutex-guarded JSON file store of the repositories codedeck manages.
//! The session core only reads from it; mutations come from the CLI and the
//! HTTP API. Every mutation rewrites the file through a temp-file rename so
//! a crash mid-write never corrupts the registry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// One registered repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Stable id used as the session key and in all wire messages
    pub id: String,

    /// Filesystem path of the repository
    pub path: PathBuf,

    /// Optional display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Mutex-guarded JSON file store of [`RepoEntry`] records
#[derive(Debug)]
pub struct RepoRegistry {
    file: PathBuf,
    entries: Mutex<HashMap<String, RepoEntry>>,
}

impl RepoRegistry {
    /// Open a registry, loading existing entries if the file exists
    pub fn open(file: PathBuf) -> Result<Self> {
        let entries = if file.exists() {
            let raw = std::fs::read_to_string(&file)?;
            let list: Vec<RepoEntry> = serde_json::from_str(&raw).map_err(|e| {
                Error::Registry(format!("Failed to parse {}: {}", file.display(), e))
            })?;
            list.into_iter().map(|entry| (entry.id.clone(), entry)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            file,
            entries: Mutex::new(entries),
        })
    }

    /// Register a repository. The path must be an existing directory.
    pub fn add(&self, path: PathBuf, name: Option<String>) -> Result<RepoEntry> {
        if !path.is_dir() {
            return Err(Error::Registry(format!(
                "Not a directory: {}",
                path.display()
            )));
        }

        let entry = RepoEntry {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            name,
        };

        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.insert(entry.id.clone(), entry.clone());
        self.save(&entries)?;

        tracing::info!(repo_id = %entry.id, path = %entry.path.display(), "Registered repository");
        Ok(entry)
    }

    /// Remove a repository. Returns `true` if an entry was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let removed = entries.remove(id).is_some();
        if removed {
            self.save(&entries)?;
            tracing::info!(repo_id = id, "Removed repository");
        }
        Ok(removed)
    }

    /// Look up a repository by id
    pub fn get(&self, id: &str) -> Option<RepoEntry> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// All registered repositories, ordered by path
    pub fn list(&self) -> Vec<RepoEntry> {
        let mut list: Vec<RepoEntry> = self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    fn save(&self, entries: &HashMap<String, RepoEntry>) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut list: Vec<&RepoEntry> = entries.values().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        let raw = serde_json::to_string_pretty(&list)?;

        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}
