//! Persistence for the local key pair
//!
//! The key pair is created once per device and must survive restarts; a
//! lost private key makes every earlier asymmetric message unreadable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::keys::{KeyPair, StoredKeyPair};
use crate::errors::CryptographicError;

/// Identifier the key pair is stored under
pub const DEFAULT_KEY_STORE_ID: &str = "sentinel.identity.keypair";

// ----------------------------------------------------------------------------
// Key Store Trait
// ----------------------------------------------------------------------------

/// Durable storage for exactly one local key pair
pub trait KeyStore: Send + Sync {
    /// Load the stored key pair, if any
    fn load(&self) -> Result<Option<KeyPair>, CryptographicError>;

    /// Persist a key pair, replacing any previous one
    fn save(&self, key_pair: &KeyPair) -> Result<(), CryptographicError>;

    /// Remove the stored key pair
    fn delete(&self) -> Result<(), CryptographicError>;

    /// Check if storage is available and accessible
    fn is_available(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Memory Key Store
// ----------------------------------------------------------------------------

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    stored: Mutex<Option<StoredKeyPair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `key_pair`
    pub fn with_key_pair(key_pair: &KeyPair) -> Self {
        Self {
            stored: Mutex::new(Some(key_pair.to_stored())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<StoredKeyPair>>, CryptographicError> {
        self.stored
            .lock()
            .map_err(|_| CryptographicError::key_store("memory key store poisoned"))
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<KeyPair>, CryptographicError> {
        self.lock()?.as_ref().map(KeyPair::from_stored).transpose()
    }

    fn save(&self, key_pair: &KeyPair) -> Result<(), CryptographicError> {
        *self.lock()? = Some(key_pair.to_stored());
        Ok(())
    }

    fn delete(&self) -> Result<(), CryptographicError> {
        *self.lock()? = None;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.stored.lock().is_ok()
    }
}

// ----------------------------------------------------------------------------
// File Key Store
// ----------------------------------------------------------------------------

/// Stores the key pair as JSON in a single file readable only by the owner
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<KeyPair>, CryptographicError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CryptographicError::key_store(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let stored: StoredKeyPair = serde_json::from_str(&contents).map_err(|e| {
            CryptographicError::key_store(format!(
                "corrupt key file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        KeyPair::from_stored(&stored).map(Some)
    }

    fn save(&self, key_pair: &KeyPair) -> Result<(), CryptographicError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CryptographicError::key_store(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let stored = key_pair.to_stored();
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| CryptographicError::key_store(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| {
            CryptographicError::key_store(format!("failed to write {}: {}", self.path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptographicError::key_store(e.to_string()))?;
        }

        tracing::debug!(path = %self.path.display(), "Saved key pair");
        Ok(())
    }

    fn delete(&self) -> Result<(), CryptographicError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptographicError::key_store(e.to_string())),
        }
    }

    fn is_available(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                parent.exists() || std::fs::create_dir_all(parent).is_ok()
            }
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Factory
// ----------------------------------------------------------------------------

/// File-backed store when a path is given, memory otherwise
pub fn create_default_key_store(path: Option<PathBuf>) -> Box<dyn KeyStore> {
    match path {
        Some(path) => Box::new(FileKeyStore::new(path)),
        None => Box::new(MemoryKeyStore::new()),
    }
}
