//! Per-bridge accessory cache on disk.
//!
//! Each bridge owns one partition file: `cachedAccessories` for the main
//! bridge, `cachedAccessories.<USERNAME>` for a child bridge. Writes go to a
//! temporary file that is renamed over the partition, and the previous
//! contents are kept as a `.bak` for recovery.

use crate::platform_accessory::SerializedPlatformAccessory;
use bridgehost_core::BridgeUsername;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CACHE_FORMAT_VERSION: u32 = 1;

/// Maximum allowed partition size (10 MB).
const MAX_CACHE_FILE_SIZE: u64 = 10 * 1024 * 1024;

const PARTITION_PREFIX: &str = "cachedAccessories";
const BACKUP_SUFFIX: &str = "bak";
const CORRUPT_SUFFIX: &str = "corrupt";
const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write accessory cache {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read accessory cache {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("corrupt accessory cache {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("accessory cache format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("accessory cache too large ({size} bytes, max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache<T> {
    version: u32,
    accessories: T,
}

#[derive(Debug, Clone)]
pub struct AccessoryCache {
    cache_path: PathBuf,
    backup_path: PathBuf,
    corrupt_path: PathBuf,
    temp_path: PathBuf,
}

impl AccessoryCache {
    /// Partition for the given bridge; `None` is the main bridge.
    pub fn for_bridge(dir: &Path, username: Option<&BridgeUsername>) -> Self {
        let cache_path = dir.join(Self::partition_name(username));
        Self {
            backup_path: with_suffix(&cache_path, BACKUP_SUFFIX),
            corrupt_path: with_suffix(&cache_path, CORRUPT_SUFFIX),
            temp_path: with_suffix(&cache_path, TEMP_SUFFIX),
            cache_path,
        }
    }

    pub fn main_bridge(dir: &Path) -> Self {
        Self::for_bridge(dir, None)
    }

    pub fn child_bridge(dir: &Path, username: &BridgeUsername) -> Self {
        Self::for_bridge(dir, Some(username))
    }

    pub fn partition_name(username: Option<&BridgeUsername>) -> String {
        match username {
            Some(username) => format!("{PARTITION_PREFIX}.{}", username.compact()),
            None => PARTITION_PREFIX.to_string(),
        }
    }

    /// Every partition file present in `dir`, sorted by name.
    pub fn partitions(dir: &Path) -> CacheResult<Vec<Self>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Read {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_partition_name(name))
            .collect();
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| {
                let cache_path = dir.join(name);
                Self {
                    backup_path: with_suffix(&cache_path, BACKUP_SUFFIX),
                    corrupt_path: with_suffix(&cache_path, CORRUPT_SUFFIX),
                    temp_path: with_suffix(&cache_path, TEMP_SUFFIX),
                    cache_path,
                }
            })
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    pub fn exists(&self) -> bool {
        self.cache_path.exists()
    }

    /// Replace the partition with `records`.
    pub fn save(&self, records: &[SerializedPlatformAccessory]) -> CacheResult<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if self.cache_path.exists() {
            if let Err(e) = fs::copy(&self.cache_path, &self.backup_path) {
                tracing::warn!(error = %e, "failed to back up accessory cache; continuing anyway");
            }
        }

        let persisted = PersistedCache {
            version: CACHE_FORMAT_VERSION,
            accessories: records,
        };
        self.write_temp(&persisted)?;
        fs::rename(&self.temp_path, &self.cache_path).map_err(|source| CacheError::Write {
            path: self.cache_path.clone(),
            source,
        })?;

        tracing::debug!(
            accessories = records.len(),
            path = %self.cache_path.display(),
            "saved accessory cache"
        );
        Ok(())
    }

    fn write_temp(
        &self,
        persisted: &PersistedCache<&[SerializedPlatformAccessory]>,
    ) -> CacheResult<()> {
        let write_err = |source: io::Error| CacheError::Write {
            path: self.temp_path.clone(),
            source,
        };
        let file = fs::File::create(&self.temp_path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, persisted)
            .map_err(|e| write_err(io::Error::other(e)))?;
        writer.flush().map_err(write_err)?;
        writer
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?
            .sync_all()
            .map_err(write_err)?;
        Ok(())
    }

    /// Load the partition.
    ///
    /// A missing file is an empty cache. An unreadable one is moved aside to
    /// `.corrupt` and the `.bak` copy is tried before falling back to empty.
    /// Individual records that fail to parse are skipped.
    pub fn load(&self) -> CacheResult<Vec<SerializedPlatformAccessory>> {
        if !self.cache_path.exists() {
            return Ok(Vec::new());
        }

        match self.try_load(&self.cache_path) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.cache_path.display(),
                    "accessory cache is corrupt or unreadable"
                );

                if let Err(move_err) = fs::rename(&self.cache_path, &self.corrupt_path) {
                    tracing::warn!(error = %move_err, "failed to preserve corrupt accessory cache");
                }

                if self.backup_path.exists() {
                    match self.try_load(&self.backup_path) {
                        Ok(records) => {
                            tracing::info!(
                                accessories = records.len(),
                                "recovered accessory cache from backup"
                            );
                            return Ok(records);
                        }
                        Err(backup_err) => {
                            tracing::warn!(error = %backup_err, "backup also corrupt; starting fresh");
                        }
                    }
                }

                Ok(Vec::new())
            }
        }
    }

    /// Read the partition without touching the filesystem.
    ///
    /// Unlike [`AccessoryCache::load`], an unreadable file is reported as an
    /// error and left where it is, and the backup is not consulted.
    pub fn peek(&self) -> CacheResult<Vec<SerializedPlatformAccessory>> {
        if !self.cache_path.exists() {
            return Ok(Vec::new());
        }
        self.try_load(&self.cache_path)
    }

    fn try_load(&self, path: &Path) -> CacheResult<Vec<SerializedPlatformAccessory>> {
        let metadata = fs::metadata(path).map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > MAX_CACHE_FILE_SIZE {
            return Err(CacheError::FileTooLarge {
                size: metadata.len(),
                max: MAX_CACHE_FILE_SIZE,
            });
        }

        let file = fs::File::open(path).map_err(|source| CacheError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let persisted: PersistedCache<Vec<serde_json::Value>> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if persisted.version != CACHE_FORMAT_VERSION {
            return Err(CacheError::UnsupportedVersion {
                found: persisted.version,
                expected: CACHE_FORMAT_VERSION,
            });
        }

        let records: Vec<SerializedPlatformAccessory> = persisted
            .accessories
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping unreadable cached accessory");
                    None
                }
            })
            .collect();

        tracing::debug!(accessories = records.len(), path = %path.display(), "loaded accessory cache");
        Ok(records)
    }

    /// Delete the partition and its backup.
    pub fn clear(&self) -> CacheResult<()> {
        if self.cache_path.exists() {
            fs::remove_file(&self.cache_path).map_err(|source| CacheError::Write {
                path: self.cache_path.clone(),
                source,
            })?;
        }
        if self.backup_path.exists() {
            let _ = fs::remove_file(&self.backup_path);
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn is_partition_name(name: &str) -> bool {
    match name.strip_prefix(PARTITION_PREFIX) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|username| {
                username.len() == 12 && username.chars().all(|c| c.is_ascii_hexdigit())
            }),
        None => false,
    }
}
