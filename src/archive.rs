use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{ArchiveRef, RawPage};

const PREFIX: &str = "events_";
const SUFFIX: &str = ".json";
const MAX_COLLISIONS: u32 = 1000;

/// Append-only directory of verbatim feed pages, one file per page.
#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Archive { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `body` under a key derived from `captured_at`. Existing pages are never replaced.
    pub fn store(&self, captured_at: DateTime<Utc>, body: &str) -> Result<ArchiveRef, StorageError> {
        let base = captured_at.format("%Y%m%d_%H%M%S_%6f").to_string();
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", base, std::process::id()));
        write_synced(&tmp, body)?;

        let result = self.link_unique(&tmp, &base);
        let _ = fs::remove_file(&tmp);
        result
    }

    // hard_link fails on an existing target, which makes publication atomic and non-clobbering.
    fn link_unique(&self, tmp: &Path, base: &str) -> Result<ArchiveRef, StorageError> {
        for n in 0..MAX_COLLISIONS {
            let key = if n == 0 {
                base.to_string()
            } else {
                format!("{}-{}", base, n)
            };
            let path = self.path_for(&key);
            match fs::hard_link(tmp, &path) {
                Ok(()) => {
                    debug!(key = %key, "archived page");
                    return Ok(ArchiveRef { key, path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::io(path, e)),
            }
        }
        Err(StorageError::io(
            self.path_for(base),
            std::io::Error::new(ErrorKind::AlreadyExists, "too many pages with the same capture key"),
        ))
    }

    pub fn read(&self, page: &ArchiveRef) -> Result<RawPage, StorageError> {
        let text = fs::read_to_string(&page.path).map_err(|e| StorageError::io(&page.path, e))?;
        let records: Vec<Value> = serde_json::from_str(&text).map_err(|e| StorageError::Json {
            path: page.path.clone(),
            source: e,
        })?;
        Ok(RawPage {
            key: page.key.clone(),
            records,
        })
    }

    /// Every archived page, oldest capture first.
    pub fn list(&self) -> Result<Vec<ArchiveRef>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut pages = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(SUFFIX))
            else {
                continue;
            };
            pages.push(ArchiveRef {
                key: key.to_string(),
                path: entry.path(),
            });
        }
        pages.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pages)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", PREFIX, key, SUFFIX))
    }
}

fn write_synced(path: &Path, body: &str) -> Result<(), StorageError> {
    let mut file = fs::File::create(path).map_err(|e| StorageError::io(path, e))?;
    file.write_all(body.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::io(path, e))
}
