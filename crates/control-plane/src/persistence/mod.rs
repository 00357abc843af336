use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use common::api::{Key, Server, Settings};

pub mod keys;
pub mod servers;
pub mod settings;

pub use keys::{KeyTable, NewKey};
pub use servers::{NewServer, ServerTable};
pub use settings::SettingTable;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl DataError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DataError::Validation(msg.into())
    }

    /// Client-correctable input problem, as opposed to an I/O failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, DataError::Validation(_))
    }
}

/// A durable collection document: one JSON file, self-validating, carrying
/// its own update timestamp.
pub(crate) trait Document: Serialize + DeserializeOwned + Default {
    const FILE: &'static str;

    fn validate(&self) -> Result<(), DataError>;
    fn stamp(&mut self, now: DateTime<Utc>);
}

/// Validated, file-backed storage for the three fleet collections.
///
/// Every collection sits behind its own lock; mutators validate, apply, and
/// synchronously persist. The in-memory state is authoritative and the
/// atomic rename guarantees disk always holds exactly what memory holds.
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    settings: RwLock<SettingTable>,
    keys: RwLock<KeyTable>,
    servers: RwLock<ServerTable>,
}

impl Database {
    /// Open (or initialize) the storage directory. Any unreadable, invalid,
    /// or unwritable document is an error; the caller treats it as fatal.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DataError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| DataError::Read {
            path: dir.clone(),
            source,
        })?;

        let settings: SettingTable = load_or_init(&dir)?;
        let keys: KeyTable = load_or_init(&dir)?;
        let servers: ServerTable = load_or_init(&dir)?;

        Ok(Self {
            dir,
            settings: RwLock::new(settings),
            keys: RwLock::new(keys),
            servers: RwLock::new(servers),
        })
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, DataError> {
        settings
            .validate()
            .map_err(DataError::validation)?;
        let mut table = self.settings.write().await;
        let previous = std::mem::replace(&mut table.settings, settings);
        if let Err(err) = save_document(&self.dir, &mut *table) {
            table.settings = previous;
            return Err(err);
        }
        Ok(table.settings.clone())
    }

    pub async fn keys(&self) -> Vec<Key> {
        self.keys.read().await.keys.clone()
    }

    pub async fn keys_updated_at(&self) -> Option<DateTime<Utc>> {
        self.keys.read().await.updated_at
    }

    pub async fn store_key(&self, new: NewKey) -> Result<Key, DataError> {
        let mut table = self.keys.write().await;
        let key = table.store(new)?;
        save_document(&self.dir, &mut *table)?;
        Ok(key)
    }

    pub async fn update_key(&self, key: Key) -> Result<Option<Key>, DataError> {
        let mut table = self.keys.write().await;
        let Some(updated) = table.update(key)? else {
            return Ok(None);
        };
        save_document(&self.dir, &mut *table)?;
        Ok(Some(updated))
    }

    pub async fn delete_key(&self, id: &str) -> Result<bool, DataError> {
        let mut table = self.keys.write().await;
        if !table.delete(id) {
            return Ok(false);
        }
        save_document(&self.dir, &mut *table)?;
        Ok(true)
    }

    /// Replace the whole key set, as pushed by the fleet coordinator.
    pub async fn fill_keys(&self, incoming: Vec<Key>) -> Result<(), DataError> {
        let mut table = self.keys.write().await;
        table.fill(incoming)?;
        save_document(&self.dir, &mut *table)
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.servers.read().await.servers.clone()
    }

    pub async fn find_server(&self, id: &str) -> Option<Server> {
        self.servers.read().await.find(id).cloned()
    }

    pub async fn store_server(&self, new: NewServer) -> Result<Server, DataError> {
        let mut table = self.servers.write().await;
        let server = table.store(new)?;
        save_document(&self.dir, &mut *table)?;
        Ok(server)
    }

    pub async fn update_server(&self, server: Server) -> Result<Option<Server>, DataError> {
        let mut table = self.servers.write().await;
        let Some(updated) = table.update(server)? else {
            return Ok(None);
        };
        save_document(&self.dir, &mut *table)?;
        Ok(Some(updated))
    }

    pub async fn delete_server(&self, id: &str) -> Result<bool, DataError> {
        let mut table = self.servers.write().await;
        if !table.delete(id) {
            return Ok(false);
        }
        save_document(&self.dir, &mut *table)?;
        Ok(true)
    }
}

fn load_or_init<T: Document>(dir: &Path) -> Result<T, DataError> {
    let path = dir.join(T::FILE);
    if !path.exists() {
        let mut doc = T::default();
        save_document(dir, &mut doc)?;
        info!(path = %path.display(), "initialized storage document");
        return Ok(doc);
    }

    let raw = fs::read(&path).map_err(|source| DataError::Read {
        path: path.clone(),
        source,
    })?;
    let doc: T = serde_json::from_slice(&raw).map_err(|source| DataError::Parse {
        path: path.clone(),
        source,
    })?;
    doc.validate()?;
    Ok(doc)
}

fn save_document<T: Document>(dir: &Path, doc: &mut T) -> Result<(), DataError> {
    doc.validate()?;
    doc.stamp(Utc::now());

    let path = dir.join(T::FILE);
    let bytes = serde_json::to_vec_pretty(doc).map_err(|source| DataError::Write {
        path: path.clone(),
        source: source.into(),
    })?;
    write_atomic(&path, &bytes).map_err(|source| DataError::Write { path, source })
}

/// Write-to-temp-then-rename so readers never observe a torn document.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid path: missing parent dir"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}
