use crate::{RecordStore, SharedStore, StorageError};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Hands out one [`SharedStore`] per store name for the life of the process.
///
/// With a root directory each name maps to `<root>/<name>.sqlite3`; without
/// one, stores are in-memory (tests and dry runs).
pub struct StoreRegistry {
    root: Option<PathBuf>,
    stores: Mutex<HashMap<String, SharedStore>>,
}

impl StoreRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            root: None,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(format!("{name}.sqlite3")))
    }

    pub fn open(&self, name: &str) -> Result<SharedStore, StorageError> {
        validate_store_name(name)?;
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = stores.get(name) {
            return Ok(existing.clone());
        }

        let store = match self.path_for(name) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                info!(event = "store_open", store = name, path = %path.display());
                RecordStore::open(&path)?
            }
            None => {
                info!(event = "store_open", store = name, path = ":memory:");
                RecordStore::open_in_memory()?
            }
        };

        let shared = SharedStore::new(name, store);
        stores.insert(name.to_string(), shared.clone());
        Ok(shared)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

fn validate_store_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidStoreName(name.to_string()))
    }
}
