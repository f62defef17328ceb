//! Key-value storage backends for the progression store.
//!
//! The store only needs string values under string keys, read one at a time
//! and written in small batches. [`KeyValueStorage`] captures exactly that, so
//! the store can run on LMDB on devices with a filesystem ([`LmdbStorage`])
//! or purely in memory ([`MemoryStorage`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use lmdb::{Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};

use crate::app_response::AppResponse;
use crate::config::StoreConfig;

/// Storage the progression store is injected with.
pub trait KeyValueStorage: Send + Sync {
    /// Returns the value under `key`, or `None` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<String>, AppResponse>;

    /// Writes every entry, or none of them.
    fn put_all(&self, entries: &[(String, String)]) -> Result<(), AppResponse>;

    /// Read-modify-write in one exclusive transaction.
    ///
    /// `apply` receives the current values of `keys` (in order) and returns the
    /// entries to write. No other writer can commit between the read and the
    /// write. When `apply` fails nothing is written.
    fn update(
        &self,
        keys: &[String],
        apply: &mut dyn FnMut(&[Option<String>]) -> Result<Vec<(String, String)>, AppResponse>,
    ) -> Result<(), AppResponse>;
}

const DB_NAME: &str = "progress";

struct LmdbHandle {
    env: Environment,
    db: Database,
}

/// Durable storage in an LMDB environment.
///
/// Each `put_all` and `update` is one write transaction. LMDB allows a single
/// writer per environment at a time, across processes as well as threads, so
/// stores sharing an environment see each other's commits inside `update`.
pub struct LmdbStorage {
    handle: Option<LmdbHandle>,
    path: PathBuf,
}

impl LmdbStorage {
    /// Opens (or creates) `<name>.lmdb` in the working directory with default settings.
    pub fn init(name: String) -> Result<Self, AppResponse> {
        Self::open(&StoreConfig::new(name))
    }

    /// Opens (or creates) the environment at [`StoreConfig::lmdb_dir`].
    pub fn open(config: &StoreConfig) -> Result<Self, AppResponse> {
        config.validate()?;
        let path = config.lmdb_dir();

        if !path.exists() {
            info!("Creating LMDB directory at: {}", path.display());
            std::fs::create_dir_all(&path)?;
        }

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(config.map_size)
            .open(&path)?;
        let db = env.create_db(Some(DB_NAME), DatabaseFlags::empty())?;

        info!("LMDB environment opened at: {}", path.display());
        Ok(Self {
            handle: Some(LmdbHandle { env, db }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Flushes and closes the environment. Later reads and writes fail with
    /// `DatabaseError`.
    pub fn close_database(&mut self) -> Result<(), AppResponse> {
        match self.handle.take() {
            Some(handle) => {
                handle.env.sync(true)?;
                drop(handle);
                info!("LMDB environment closed: {}", self.path.display());
                Ok(())
            }
            None => {
                debug!("close_database called on a closed environment");
                Ok(())
            }
        }
    }

    fn handle(&self) -> Result<&LmdbHandle, AppResponse> {
        self.handle.as_ref().ok_or_else(|| {
            AppResponse::DatabaseError(format!(
                "Database at {} is closed",
                self.path.display()
            ))
        })
    }
}

impl KeyValueStorage for LmdbStorage {
    fn get(&self, key: &str) -> Result<Option<String>, AppResponse> {
        let handle = self.handle()?;
        let txn = handle.env.begin_ro_txn()?;

        let value = match txn.get(handle.db, &key) {
            Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("Value under '{key}' is not valid UTF-8: {e}");
                    return Err(AppResponse::SerializationError(format!(
                        "Invalid UTF-8 under key '{key}'"
                    )));
                }
            },
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(AppResponse::from(e)),
        };

        txn.abort();
        Ok(value)
    }

    fn put_all(&self, entries: &[(String, String)]) -> Result<(), AppResponse> {
        let handle = self.handle()?;
        let mut txn = handle.env.begin_rw_txn()?;

        for (key, value) in entries {
            txn.put(handle.db, key, value, WriteFlags::empty())?;
        }

        txn.commit()?;
        debug!("Committed {} key(s) to {}", entries.len(), self.path.display());
        Ok(())
    }

    fn update(
        &self,
        keys: &[String],
        apply: &mut dyn FnMut(&[Option<String>]) -> Result<Vec<(String, String)>, AppResponse>,
    ) -> Result<(), AppResponse> {
        let handle = self.handle()?;
        let mut txn = handle.env.begin_rw_txn()?;

        let mut current = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match txn.get(handle.db, key) {
                // a value that is not UTF-8 is as good as absent to the caller
                Ok(bytes) => String::from_utf8(bytes.to_vec()).ok(),
                Err(lmdb::Error::NotFound) => None,
                Err(e) => return Err(AppResponse::from(e)),
            };
            current.push(value);
        }

        let entries = apply(&current)?;
        for (key, value) in &entries {
            txn.put(handle.db, key, value, WriteFlags::empty())?;
        }

        txn.commit()?;
        debug!("Updated {} key(s) in {}", entries.len(), self.path.display());
        Ok(())
    }
}

impl Drop for LmdbStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close_database() {
            warn!("Failed to close LMDB environment on drop: {e}");
        }
    }
}

/// Volatile storage for hosts without a writable filesystem.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing data, e.g. values exported from a browser's local storage.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, AppResponse> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put_all(&self, entries: &[(String, String)]) -> Result<(), AppResponse> {
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn update(
        &self,
        keys: &[String],
        apply: &mut dyn FnMut(&[Option<String>]) -> Result<Vec<(String, String)>, AppResponse>,
    ) -> Result<(), AppResponse> {
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let current: Vec<Option<String>> = keys.iter().map(|k| map.get(k).cloned()).collect();
        for (key, value) in apply(&current)? {
            map.insert(key, value);
        }
        Ok(())
    }
}
