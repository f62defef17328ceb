//! Store configuration.
//!
//! A [`StoreConfig`] names the LMDB environment, where it lives on disk, how
//! large its memory map may grow, and the prefix applied to every storage key.
//! Hosts can build one in Rust or hand it over the FFI boundary as JSON:
//!
//! ```json
//! { "name": "kindpath", "directory": "/data/app", "map_size": 10485760 }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::app_response::AppResponse;

/// Default LMDB map size (10 MiB). Star tallies and badge lists are tiny.
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;

/// Prefix used by the KindPath web app for its local-storage keys.
pub const DEFAULT_KEY_PREFIX: &str = "kindpath_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Environment name; the LMDB directory is `<name>.lmdb`.
    pub name: String,

    /// Parent directory of the environment. `None` means the working directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_map_size")]
    pub map_size: usize,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl StoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
            map_size: DEFAULT_MAP_SIZE,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Parses a config from the JSON shape shown in the module docs.
    pub fn from_json(json: &str) -> Result<Self, AppResponse> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppResponse> {
        if self.name.trim().is_empty() {
            return Err(AppResponse::ValidationError(
                "Store name cannot be empty".to_string(),
            ));
        }
        if self.map_size == 0 {
            return Err(AppResponse::ValidationError(
                "map_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding the LMDB data and lock files.
    pub fn lmdb_dir(&self) -> PathBuf {
        let dir_name = format!("{}.lmdb", self.name);
        match &self.directory {
            Some(parent) => parent.join(dir_name),
            None => PathBuf::from(dir_name),
        }
    }
}
