/// Local persistence of the visible sequence
use crate::{model::Message, Error};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Namespaced key-value persistence
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Replaces the value under `key`. Readers see either the old or the
    /// new value, never a partial write.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        (**self).set(key, value)
    }
}

/// Store that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key inside a directory
///
/// Values are written to a temporary file in the same directory and renamed
/// over the old file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens the store, creating `dir` if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(storage_error)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut file = NamedTempFile::new_in(&self.dir).map_err(storage_error)?;
        file.write_all(value.as_bytes()).map_err(storage_error)?;
        file.as_file().sync_all().map_err(storage_error)?;
        file.persist(self.path(key))
            .map_err(|e| storage_error(e.error))?;
        Ok(())
    }
}

fn storage_error(e: std::io::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Persists the whole message sequence as one JSON value under a fixed key
pub struct MessageStore {
    inner: Box<dyn KeyValueStore>,
    key: String,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    pub const DEFAULT_KEY: &'static str = "@SafeTapChatMessages";

    pub fn new(inner: impl KeyValueStore + 'static, key: impl Into<String>) -> Self {
        Self {
            inner: Box::new(inner),
            key: key.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new(), Self::DEFAULT_KEY)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last saved sequence
    ///
    /// `None` when nothing was saved yet. Unparsable data counts as nothing
    /// saved. Only a failing backend is an error.
    pub fn load(&self) -> Result<Option<Vec<Message>>, Error> {
        let Some(raw) = self.inner.get(&self.key)? else {
            debug!(key = %self.key, "no stored messages");
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(messages) => Ok(Some(messages)),
            Err(err) => {
                warn!(key = %self.key, %err, "discarding unparsable stored messages");
                Ok(None)
            }
        }
    }

    /// Overwrites the stored sequence
    pub fn save(&self, messages: &[Message]) -> Result<(), Error> {
        let raw = serde_json::to_string(messages).map_err(|e| Error::Storage(e.to_string()))?;
        self.inner.set(&self.key, &raw)
    }
}

#[cfg(test)]
mod test {
    use super::{FileStore, KeyValueStore, MemoryStore, MessageStore};
    use crate::model::{Message, Origin};

    fn sample() -> Vec<Message> {
        vec![
            Message::new("a", "u1", Some("John Doe".into()), "hi", 1, Origin::RemoteConfirmed),
            Message::new("b", "u2", None, "yo", 2, Origin::LocalPending),
        ]
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested")).unwrap();
        store.set("@SafeTapChatMessages", "[]").unwrap();
        store.set("@SafeTapChatMessages", "[1]").unwrap();

        let reopened = FileStore::open(dir.path().join("nested")).unwrap();
        assert_eq!(
            reopened.get("@SafeTapChatMessages").unwrap().as_deref(),
            Some("[1]")
        );
        assert_eq!(reopened.get("other").unwrap(), None);
        assert!(dir.path().join("nested/_SafeTapChatMessages.json").exists());
    }

    #[test]
    fn test_message_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(FileStore::open(dir.path()).unwrap(), "chat");
        assert_eq!(store.load().unwrap(), None);
        store.save(&sample()).unwrap();

        let reopened = MessageStore::new(FileStore::open(dir.path()).unwrap(), "chat");
        assert_eq!(reopened.load().unwrap(), Some(sample()));
    }

    #[test]
    fn test_unparsable_value_loads_as_absent() {
        let kv = MemoryStore::new();
        kv.set(MessageStore::DEFAULT_KEY, "{not json").unwrap();
        let store = MessageStore::new(kv, MessageStore::DEFAULT_KEY);
        assert_eq!(store.load().unwrap(), None);
    }
}
