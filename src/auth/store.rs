//! Token File Store
//!
//! Persists the single access/refresh token pair as three newline-separated
//! fields: last refresh time (epoch seconds), access token, refresh token.
//! Writes go through a temp file and a rename so a crash never leaves a
//! half-written token file behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// The live credential pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch seconds of the last verified exchange, 0 if never
    pub last_refreshed_at: i64,
}

/// Token store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to replace token file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// File-backed store keyed by account identity
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store for `account` under `dir`, as `<dir>/<account>.token`
    pub fn new(dir: &Path, account: &str) -> Self {
        Self {
            path: dir.join(format!("{}.token", account)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted pair
    ///
    /// Returns `Ok(None)` when no file exists or it does not have the
    /// expected three-field shape.
    pub fn load(&self) -> Result<Option<TokenPair>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let parts: Vec<&str> = raw.split('\n').collect();
        if parts.len() != 3 {
            warn!(path = %self.path.display(), fields = parts.len(), "Ignoring malformed token file");
            return Ok(None);
        }

        let Ok(last_refreshed_at) = parts[0].trim().parse::<i64>() else {
            warn!(path = %self.path.display(), "Ignoring token file with invalid timestamp");
            return Ok(None);
        };
        if parts[1].is_empty() || parts[2].is_empty() {
            warn!(path = %self.path.display(), "Ignoring token file with empty token");
            return Ok(None);
        }

        Ok(Some(TokenPair {
            access_token: parts[1].to_string(),
            refresh_token: parts[2].trim_end_matches('\r').to_string(),
            last_refreshed_at,
        }))
    }

    /// Atomically replace the persisted pair
    pub fn save(&self, pair: &TokenPair) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        write!(
            tmp,
            "{}\n{}\n{}",
            pair.last_refreshed_at, pair.access_token, pair.refresh_token
        )?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(path = %self.path.display(), at = pair.last_refreshed_at, "Persisted token pair");
        Ok(())
    }
}
