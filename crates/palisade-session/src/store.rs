//! Durable storage for the current session.
//!
//! The store is a plain accessor: every write goes through the session
//! lifecycle, which serializes them, so implementations need no coordination
//! beyond interior mutability. Writes may block on disk; they never run under
//! the refresh coordinator's lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StorageError;
use crate::session::Session;

/// Default session file name within the palisade data directory.
pub const SESSION_FILE: &str = "session.json";

// ============================================================================
// TokenStore Trait
// ============================================================================

/// Holder of the single live [`Session`].
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Current session, if any.
    fn get(&self) -> Result<Option<Session>, StorageError>;

    /// Replace the current session.
    fn set(&self, session: &Session) -> Result<(), StorageError>;

    /// Remove the current session. Both tokens go together.
    fn clear(&self) -> Result<(), StorageError>;
}

/// Shared token store for use across async contexts.
pub type SharedTokenStore = Arc<dyn TokenStore>;

// ============================================================================
// FileTokenStore
// ============================================================================

/// File-backed store that survives process restarts.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    // Outer None: not loaded yet. Inner None: loaded, no session.
    cached: RwLock<Option<Option<Session>>>,
}

impl FileTokenStore {
    /// Store under `data_dir/session.json`.
    pub fn new(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join(SESSION_FILE))
    }

    /// Store at an explicit path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cached: RwLock::new(None),
        }
    }

    /// Get the session file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Option<Session>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| StorageError::Read {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        let session: Session = serde_json::from_str(&content)
            .map_err(|e| StorageError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        Ok(Some(session))
    }

    fn write_file(&self, session: &Session) -> Result<(), StorageError> {
        let write_err = |e: std::io::Error| StorageError::Write {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| StorageError::Corrupt(format!("failed to serialize session: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp).map_err(write_err)?;
            file.write_all(&json).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(path)
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Result<Option<Session>, StorageError> {
        if let Some(cached) = self.cached.read().as_ref() {
            return Ok(cached.clone());
        }

        let loaded = self.read_file()?;
        *self.cached.write() = Some(loaded.clone());
        Ok(loaded)
    }

    fn set(&self, session: &Session) -> Result<(), StorageError> {
        self.write_file(session)?;
        *self.cached.write() = Some(Some(session.clone()));
        tracing::debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        // Drop the in-memory copy first so a failed delete still logs us out
        // for the lifetime of this process.
        *self.cached.write() = Some(None);

        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| StorageError::Write {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })?;
        }
        tracing::debug!(path = %self.path.display(), "Session file removed");
        Ok(())
    }
}

// ============================================================================
// MemoryTokenStore
// ============================================================================

/// In-process store. Sessions are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    session: RwLock<Option<Session>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Result<Option<Session>, StorageError> {
        Ok(self.session.read().clone())
    }

    fn set(&self, session: &Session) -> Result<(), StorageError> {
        *self.session.write() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.session.write() = None;
        Ok(())
    }
}
