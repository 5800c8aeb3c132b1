//! Persisted token status
//!
//! One JSON record holds the exhaustion flags for every provider together with
//! the UTC date they are valid for:
//!
//! ```json
//! {"date":"2026-10-18","exhausted":{"huggingface":{"hf_a":true}}}
//! ```
//!
//! The record is scoped to a single day. A read that finds an older date (or a
//! missing or unparseable record) yields an empty map dated today, without
//! writing it back; the next mutation persists the fresh state. There is no
//! timer, so every process sharing the record agrees on the reset boundary.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::NaiveDate;
use provider::ProviderId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Snapshot of which tokens are exhausted, per provider, for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatusStore {
    pub date: NaiveDate,
    /// provider id → raw token → exhausted flag. Absence means available.
    #[serde(default)]
    pub exhausted: BTreeMap<String, BTreeMap<String, bool>>,
}

impl TokenStatusStore {
    /// Empty store valid for `date`.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            exhausted: BTreeMap::new(),
        }
    }

    pub fn is_exhausted(&self, provider: ProviderId, token: &str) -> bool {
        self.exhausted
            .get(provider.as_str())
            .and_then(|tokens| tokens.get(token))
            .copied()
            .unwrap_or(false)
    }

    /// Flag a token. Returns false if it was already flagged.
    pub(crate) fn mark(&mut self, provider: ProviderId, token: &str) -> bool {
        if self.is_exhausted(provider, token) {
            return false;
        }
        self.exhausted
            .entry(provider.as_str().to_string())
            .or_default()
            .insert(token.to_string(), true);
        true
    }

    pub(crate) fn clear_provider(&mut self, provider: ProviderId) {
        self.exhausted.remove(provider.as_str());
    }
}

/// Durable home of the serialized `TokenStatusStore` record.
///
/// Uses `Pin<Box<dyn Future>>` return types so backends can be shared as
/// `Arc<dyn StatusBackend>`.
pub trait StatusBackend: Send + Sync {
    /// Raw record, or `None` if nothing has been stored yet.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// Replace the record.
    fn save(&self, raw: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Read the store as of `today`, applying the lazy daily reset.
///
/// Never fails: backend read errors and malformed records are logged and
/// treated as an empty store.
pub async fn read_current(backend: &dyn StatusBackend, today: NaiveDate) -> TokenStatusStore {
    let raw = match backend.load().await {
        Ok(Some(raw)) => raw,
        Ok(None) => return TokenStatusStore::empty(today),
        Err(e) => {
            warn!(error = %e, "failed to read token status, treating as empty");
            return TokenStatusStore::empty(today);
        }
    };

    match serde_json::from_str::<TokenStatusStore>(&raw) {
        Ok(store) if store.date == today => store,
        Ok(store) => {
            debug!(stored = %store.date, %today, "token status is from an earlier day, resetting");
            TokenStatusStore::empty(today)
        }
        Err(e) => {
            warn!(error = %e, "malformed token status record, treating as empty");
            TokenStatusStore::empty(today)
        }
    }
}

/// Overwrite the persisted record with `store`.
pub async fn persist(backend: &dyn StatusBackend, store: &TokenStatusStore) -> Result<()> {
    let raw = serde_json::to_string(store).map_err(|e| Error::Serialize(e.to_string()))?;
    backend.save(raw).await
}

/// JSON file backend.
///
/// Writes go through a temp file + rename so a crash never leaves a torn
/// record, and the file is 0600 because token strings are stored as keys.
/// A Mutex serializes writers within the process.
pub struct FileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusBackend for FileBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(raw) => Ok(Some(raw)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Store(format!(
                    "reading {}: {e}",
                    self.path.display()
                ))),
            }
        })
    }

    fn save(&self, raw: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            write_atomic(&self.path, raw.as_bytes()).await
        })
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Store(format!("invalid status path {}", path.display())))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Store(format!("creating {}: {e}", dir.display())))?;

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Store(format!("writing temp status file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting status file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp status file: {e}")))?;

    debug!(path = %path.display(), "persisted token status");
    Ok(())
}

/// In-process backend. Used in tests and when no store path is configured.
#[derive(Default)]
pub struct MemoryBackend {
    value: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with a raw record (which need not be valid JSON).
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(raw.into())),
        }
    }

    /// Current raw record.
    pub async fn raw(&self) -> Option<String> {
        self.value.lock().await.clone()
    }
}

impl StatusBackend for MemoryBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move { Ok(self.value.lock().await.clone()) })
    }

    fn save(&self, raw: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.value.lock().await = Some(raw);
            Ok(())
        })
    }
}
