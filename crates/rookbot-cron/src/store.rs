//! File-backed job store.
//!
//! One JSON document per profile, written atomically (temp sibling, then
//! rename) so a crash mid-write never corrupts the store. Loads are cached
//! by file modification time: an unchanged mtime reuses the previous parse,
//! and an externally edited file (e.g. by the CLI) is picked up on the next
//! load.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use rookbot_types::{CronStoreFile, STORE_VERSION};

use crate::error::{CronError, Result};

pub struct CronStore {
    path: PathBuf,
    cached: Option<CachedFile>,
    consecutive_load_failures: u32,
}

struct CachedFile {
    modified: SystemTime,
    file: CronStoreFile,
}

impl CronStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
            consecutive_load_failures: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Failed loads since the last clean one.
    pub fn consecutive_load_failures(&self) -> u32 {
        self.consecutive_load_failures
    }

    /// Load the store file. A missing file is an empty store, not an error.
    pub fn load(&mut self) -> Result<CronStoreFile> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.consecutive_load_failures = 0;
                self.cached = None;
                return Ok(CronStoreFile::default());
            }
            Err(e) => {
                self.consecutive_load_failures += 1;
                return Err(e.into());
            }
        };

        if let (Some(modified), Some(cached)) = (modified, &self.cached) {
            if cached.modified == modified {
                debug!(path = %self.path.display(), "store unchanged; reusing cached parse");
                return Ok(cached.file.clone());
            }
        }

        let file = match self.read_and_parse() {
            Ok(file) => file,
            Err(e) => {
                self.consecutive_load_failures += 1;
                warn!(
                    path = %self.path.display(),
                    failures = self.consecutive_load_failures,
                    "failed to load cron store: {e}"
                );
                return Err(e);
            }
        };

        self.consecutive_load_failures = 0;
        if let Some(modified) = modified {
            self.cached = Some(CachedFile {
                modified,
                file: file.clone(),
            });
        }
        Ok(file)
    }

    fn read_and_parse(&self) -> Result<CronStoreFile> {
        let raw = fs::read_to_string(&self.path)?;
        let file: CronStoreFile = serde_json::from_str(&raw)?;
        if file.version != STORE_VERSION {
            return Err(CronError::Version(file.version));
        }
        Ok(file)
    }

    /// Persist atomically: write a temp sibling, then rename over the store.
    pub fn save(&mut self, file: &CronStoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data.as_bytes())?;
        fs::rename(&tmp, &self.path)?;

        self.cached = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(|modified| CachedFile {
                modified,
                file: file.clone(),
            });
        debug!(count = file.jobs.len(), "persisted cron jobs");
        Ok(())
    }
}
