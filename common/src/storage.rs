//! Typed key-value persistence behind the settings store.
//!
//! Every settings field lives under its own key inside one namespace, so a
//! single setter only rewrites the keys it touched. Backends:
//!
//! - [`MemoryStorage`]: process memory, used by tests and the simulator.
//! - [`FileStorage`]: one pretty-printed JSON document per namespace.
//! - the NVS backend in the ESP build of the controller.

use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;

pub trait SettingsStorage {
    /// Opens (and creates if needed) the namespace all later calls refer to.
    fn open(&mut self, namespace: &str) -> Result<(), StorageError>;

    fn contains(&self, key: &str) -> Result<bool, StorageError>;

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError>;
    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StorageError>;

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError>;

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError>;

    fn remove(&mut self, key: &str) -> Result<(), StorageError>;

    /// Removes every key in the open namespace.
    fn clear(&mut self) -> Result<(), StorageError>;
}

impl<T: SettingsStorage + ?Sized> SettingsStorage for Box<T> {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        (**self).open(namespace)
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        (**self).contains(key)
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError> {
        (**self).get_f32(key)
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StorageError> {
        (**self).set_f32(key, value)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        (**self).get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        (**self).set_u32(key, value)
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set_str(key, value)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        (**self).get_bool(key)
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        (**self).set_bool(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    F32(f32),
    U32(u32),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct Entries(BTreeMap<String, StoredValue>);

impl Entries {
    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(StoredValue::F32(value)) => Ok(Some(*value)),
            Some(_) => Err(StorageError::TypeMismatch(key.to_string())),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(StoredValue::U32(value)) => Ok(Some(*value)),
            Some(_) => Err(StorageError::TypeMismatch(key.to_string())),
        }
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(StoredValue::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StorageError::TypeMismatch(key.to_string())),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(StoredValue::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(StorageError::TypeMismatch(key.to_string())),
        }
    }

    fn insert(&mut self, key: &str, value: StoredValue) {
        self.0.insert(key.to_string(), value);
    }
}

/// In-memory storage. Namespaces survive a re-`open`, which is how tests
/// simulate a reboot.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    namespaces: HashMap<String, Entries>,
    current: Option<String>,
    unavailable: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A medium that refuses to open, for exercising the I/O fault path.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Raw access for tests that plant values directly.
    pub fn insert(&mut self, namespace: &str, key: &str, value: StoredValue) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key, value);
    }

    pub fn keys(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .get(namespace)
            .map(|entries| entries.0.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn entries(&self) -> Result<&Entries, StorageError> {
        let namespace = self.current.as_ref().ok_or(StorageError::NotOpen)?;
        self.namespaces.get(namespace).ok_or(StorageError::NotOpen)
    }

    fn entries_mut(&mut self) -> Result<&mut Entries, StorageError> {
        let namespace = self.current.as_ref().ok_or(StorageError::NotOpen)?;
        self.namespaces
            .get_mut(namespace)
            .ok_or(StorageError::NotOpen)
    }
}

impl SettingsStorage for MemoryStorage {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        if self.unavailable {
            return Err(StorageError::Open(
                namespace.to_string(),
                "medium unavailable".to_string(),
            ));
        }
        self.namespaces.entry(namespace.to_string()).or_default();
        self.current = Some(namespace.to_string());
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries()?.0.contains_key(key))
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError> {
        self.entries()?.get_f32(key)
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StorageError> {
        self.entries_mut()?.insert(key, StoredValue::F32(value));
        Ok(())
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        self.entries()?.get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.entries_mut()?.insert(key, StoredValue::U32(value));
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.entries()?.get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries_mut()?
            .insert(key, StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        self.entries()?.get_bool(key)
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        self.entries_mut()?.insert(key, StoredValue::Bool(value));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries_mut()?.0.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.entries_mut()?.0.clear();
        Ok(())
    }
}

/// JSON-file storage: `<data_dir>/<namespace>.json`. Every write rewrites the
/// file so the on-disk document always matches memory.
#[derive(Debug)]
pub struct FileStorage {
    data_dir: PathBuf,
    path: Option<PathBuf>,
    entries: Entries,
}

impl FileStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            path: None,
            entries: Entries::default(),
        }
    }

    /// Writes `next` to a staging file, renames it over the namespace file and
    /// only then adopts it, so a failed write leaves both disk and memory as
    /// they were.
    fn persist(&mut self, next: Entries) -> Result<(), StorageError> {
        let path = self.path.as_ref().ok_or(StorageError::NotOpen)?;
        let payload = serde_json::to_vec_pretty(&next)
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, payload)?;
        std::fs::rename(&staging, path)?;
        self.entries = next;
        Ok(())
    }

    fn write(&mut self, key: &str, value: StoredValue) -> Result<(), StorageError> {
        let mut next = self.opened()?.clone();
        next.insert(key, value);
        self.persist(next)
    }

    fn opened(&self) -> Result<&Entries, StorageError> {
        if self.path.is_none() {
            return Err(StorageError::NotOpen);
        }
        Ok(&self.entries)
    }
}

impl SettingsStorage for FileStorage {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|err| {
            StorageError::Open(namespace.to_string(), err.to_string())
        })?;
        let path = self.data_dir.join(format!("{namespace}.json"));

        self.entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Entries>(&raw).unwrap_or_else(|err| {
                warn!("discarding unreadable settings file {}: {err}", path.display());
                Entries::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Entries::default(),
            Err(err) => {
                return Err(StorageError::Open(namespace.to_string(), err.to_string()));
            }
        };
        self.path = Some(path);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.opened()?.0.contains_key(key))
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError> {
        self.opened()?.get_f32(key)
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StorageError> {
        self.write(key, StoredValue::F32(value))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        self.opened()?.get_u32(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.write(key, StoredValue::U32(value))
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.opened()?.get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write(key, StoredValue::Str(value.to_string()))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        self.opened()?.get_bool(key)
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        self.write(key, StoredValue::Bool(value))
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let mut next = self.opened()?.clone();
        if next.0.remove(key).is_some() {
            self.persist(next)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.opened()?;
        self.persist(Entries::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "thermostat-storage-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn memory_storage_requires_open() {
        let mut storage = MemoryStorage::new();
        assert!(matches!(
            storage.set_f32("targetTemp", 21.0),
            Err(StorageError::NotOpen)
        ));

        storage.open("thermostat").unwrap();
        storage.set_f32("targetTemp", 21.0).unwrap();
        assert_eq!(storage.get_f32("targetTemp").unwrap(), Some(21.0));
    }

    #[test]
    fn typed_reads_reject_mismatched_values() {
        let mut storage = MemoryStorage::new();
        storage.open("thermostat").unwrap();
        storage.set_str("mode", "on").unwrap();

        assert!(matches!(
            storage.get_f32("mode"),
            Err(StorageError::TypeMismatch(key)) if key == "mode"
        ));
        assert_eq!(storage.get_u32("missing").unwrap(), None);
    }

    #[test]
    fn unavailable_medium_fails_open() {
        let mut storage = MemoryStorage::unavailable();
        assert!(matches!(
            storage.open("thermostat"),
            Err(StorageError::Open(..))
        ));
    }

    #[test]
    fn clear_only_touches_open_namespace() {
        let mut storage = MemoryStorage::new();
        storage.insert("other", "keep", StoredValue::Bool(true));
        storage.open("thermostat").unwrap();
        storage.set_u32("epdRefreshRate", 30).unwrap();

        storage.clear().unwrap();

        assert!(storage.keys("thermostat").is_empty());
        assert_eq!(storage.keys("other"), vec!["keep".to_string()]);
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = scratch_dir("reopen");

        let mut storage = FileStorage::new(&dir);
        storage.open("thermostat").unwrap();
        storage.set_f32("tempOffset", -1.25).unwrap();
        storage.set_u32("epdRefreshRate", 120).unwrap();
        storage.set_str("timezone", "Europe/London").unwrap();
        storage.set_bool("initialized", true).unwrap();
        drop(storage);

        let mut storage = FileStorage::new(&dir);
        storage.open("thermostat").unwrap();
        assert_eq!(storage.get_f32("tempOffset").unwrap(), Some(-1.25));
        assert_eq!(storage.get_u32("epdRefreshRate").unwrap(), Some(120));
        assert_eq!(
            storage.get_str("timezone").unwrap().as_deref(),
            Some("Europe/London")
        );
        assert_eq!(storage.get_bool("initialized").unwrap(), Some(true));

        storage.remove("tempOffset").unwrap();
        assert!(!storage.contains("tempOffset").unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_file_write_is_not_replayed_later() {
        let dir = scratch_dir("failed-write");

        let mut storage = FileStorage::new(&dir);
        storage.open("thermostat").unwrap();
        storage.set_f32("targetTemp", 20.5).unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(storage.set_f32("targetTemp", 30.0).is_err());
        assert_eq!(storage.get_f32("targetTemp").unwrap(), Some(20.5));

        std::fs::create_dir_all(&dir).unwrap();
        storage.set_f32("ecoTemp", 17.0).unwrap();
        drop(storage);

        let mut storage = FileStorage::new(&dir);
        storage.open("thermostat").unwrap();
        assert_eq!(storage.get_f32("targetTemp").unwrap(), Some(20.5));
        assert_eq!(storage.get_f32("ecoTemp").unwrap(), Some(17.0));
        assert!(!dir.join("thermostat.json.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = scratch_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("thermostat.json"), b"{not json").unwrap();

        let mut storage = FileStorage::new(&dir);
        storage.open("thermostat").unwrap();
        assert!(!storage.contains("initialized").unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
