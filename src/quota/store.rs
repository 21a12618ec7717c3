// src/quota/store.rs
//! Durable storage for quota counters.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::LedgerError;
use crate::quota::QuotaCounter;

pub trait CounterStore: Send + Sync {
    /// Load every persisted counter. A missing store is an empty list, not
    /// an error.
    fn load(&self) -> Result<Vec<QuotaCounter>, LedgerError>;
    /// Replace the persisted snapshot.
    fn save(&self, counters: &[QuotaCounter]) -> Result<(), LedgerError>;
}

/// JSON file written atomically via tmp + rename.
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CounterStore for FileCounterStore {
    fn load(&self) -> Result<Vec<QuotaCounter>, LedgerError> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(Vec::new()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, counters: &[QuotaCounter]) -> Result<(), LedgerError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(counters)?;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store for tests and memory-only deployments.
#[derive(Default)]
pub struct MemoryCounterStore {
    saved: Mutex<Vec<QuotaCounter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counters(counters: Vec<QuotaCounter>) -> Self {
        Self {
            saved: Mutex::new(counters),
        }
    }

    pub fn snapshot(&self) -> Vec<QuotaCounter> {
        self.saved
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl CounterStore for MemoryCounterStore {
    fn load(&self) -> Result<Vec<QuotaCounter>, LedgerError> {
        Ok(self.snapshot())
    }

    fn save(&self, counters: &[QuotaCounter]) -> Result<(), LedgerError> {
        *self.saved.lock().unwrap_or_else(|p| p.into_inner()) = counters.to_vec();
        Ok(())
    }
}
