//! Credential storage
//!
//! Persists the current credential to a single JSON file so it survives
//! restarts. Writes go to a sibling temp file which is then renamed over the
//! target, so a crash mid-write never leaves a truncated credential behind.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::credential::Credential;
use crate::{Error, Result};

/// On-disk form of a credential
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    #[serde(flatten)]
    credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
}

/// File-backed credential store
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Create a store backed by `path`; nothing is touched until the first save
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Credential file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credential, `Ok(None)` if there is none yet
    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No stored credential found");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to read credential file: {e}")))?;
        let stored: StoredCredential = serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("Failed to parse credential file: {e}")))?;

        info!(
            path = %self.path.display(),
            expires_in = ?stored.credential.time_until_expiry(),
            "Loaded stored credential"
        );
        Ok(Some(stored.credential))
    }

    /// Atomically replace the stored credential
    pub fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create credential directory: {e}"))
                })?;
            }
        }

        let stored = StoredCredential {
            credential: credential.clone(),
            saved_at: Some(Utc::now()),
        };
        let mut content = serde_json::to_string_pretty(&stored)
            .map_err(|e| Error::Storage(format!("Failed to serialize credential: {e}")))?;
        content.push('\n');

        let tmp = self.temp_path();
        fs::write(&tmp, content)
            .map_err(|e| Error::Storage(format!("Failed to write credential file: {e}")))?;

        // Owner read/write only, set before the file becomes visible under its real name
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }

        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Storage(format!("Failed to replace credential file: {e}"))
        })?;

        debug!(path = %self.path.display(), "Saved credential");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
