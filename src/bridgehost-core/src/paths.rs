use crate::DEFAULT_STORAGE_DIR;
use directories::BaseDirs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use thiserror::Error;

/// The single directory all persistent host state lives under.
///
/// The root may be changed with [`StorageRoot::set_storage_path`] only until the
/// first path is handed out; from then on it is frozen for the lifetime of the
/// value so state is never split across two locations.
#[derive(Debug, Default)]
pub struct StorageRoot {
    custom: Mutex<Option<PathBuf>>,
    frozen: OnceLock<PathBuf>,
}

impl StorageRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root preset to `path`, still changeable until first access.
    pub fn with_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = Self::new();
        root.set_storage_path(path)?;
        Ok(root)
    }

    pub fn set_storage_path(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let requested = absolutize(path.as_ref())?;
        let mut custom = self.custom.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = self.frozen.get() {
            return Err(StorageError::AlreadyAccessed {
                current: current.clone(),
                requested,
            });
        }
        *custom = Some(requested);
        Ok(())
    }

    /// Fix the root and return it. Idempotent.
    pub fn freeze(&self) -> Result<&Path, StorageError> {
        if let Some(path) = self.frozen.get() {
            return Ok(path);
        }
        let custom = self.custom.lock().unwrap_or_else(PoisonError::into_inner);
        let resolved = match custom.as_ref() {
            Some(path) => path.clone(),
            None => default_storage_path()?,
        };
        let path = self.frozen.get_or_init(|| resolved);
        drop(custom);
        tracing::debug!(path = %path.display(), "storage root fixed");
        Ok(path)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    pub fn storage_path(&self) -> Result<&Path, StorageError> {
        self.freeze()
    }

    pub fn config_path(&self) -> Result<PathBuf, StorageError> {
        Ok(self.freeze()?.join("config.toml"))
    }

    /// Protocol-engine pairing data.
    pub fn persist_path(&self) -> Result<PathBuf, StorageError> {
        Ok(self.freeze()?.join("persist"))
    }

    pub fn cached_accessory_path(&self) -> Result<PathBuf, StorageError> {
        Ok(self.freeze()?.join("accessories"))
    }

    pub fn log_path(&self) -> Result<PathBuf, StorageError> {
        Ok(self.freeze()?.join("logs"))
    }

    pub fn ensure_exists(&self) -> Result<(), StorageError> {
        let dirs = [
            self.freeze()?.to_path_buf(),
            self.persist_path()?,
            self.cached_accessory_path()?,
            self.log_path()?,
        ];
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn default_storage_path() -> Result<PathBuf, StorageError> {
    let dirs = BaseDirs::new().ok_or(StorageError::MissingHomeDir)?;
    Ok(dirs.home_dir().join(DEFAULT_STORAGE_DIR))
}

fn absolutize(path: &Path) -> Result<PathBuf, StorageError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| StorageError::Resolve {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(path))
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(
        "storage path was already accessed as {current} and cannot be changed to {requested}; set a custom storage path before anything reads it"
    )]
    AlreadyAccessed { current: PathBuf, requested: PathBuf },
    #[error("unable to determine the home directory for the default storage path")]
    MissingHomeDir,
    #[error("failed to resolve storage path {path}: {source}")]
    Resolve {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}
