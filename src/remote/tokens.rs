//! Flat token store.
//!
//! One JSON record per line: `{id, name, hash, created_at}`. The plaintext
//! token handed to the user is `<id>.<secret>`; only the SHA-256 of the secret
//! is stored. The file is re-read on every verification so a revocation made
//! by another process blocks the next connection attempt without a restart.

use crate::error::{AuthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Length of generated token ids.
const ID_LENGTH: usize = 12;

/// Length of generated secrets.
const SECRET_LENGTH: usize = 40;

/// A stored token, without its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Public identifier, the part before the dot
    pub id: String,
    /// Human label
    pub name: String,
    /// Hex SHA-256 of the secret
    pub hash: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Token file access.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: Option<PathBuf>,
}

impl TokenStore {
    /// Store backed by `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: Some(path.into()),
        };
        let records = store.list()?;
        debug!(path = ?store.path, tokens = records.len(), "Token store opened");
        Ok(store)
    }

    /// Store that accepts every connection.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Whether tokens are checked.
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All stored records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a corrupt line.
    pub fn list(&self) -> Result<Vec<TokenRecord>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    /// Create a token. Returns the record and the plaintext, shown once.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is disabled or the file cannot be written.
    pub fn create(&self, name: &str) -> Result<(TokenRecord, String)> {
        let mut records = self.list()?;
        let id = nanoid::nanoid!(ID_LENGTH);
        let secret = nanoid::nanoid!(SECRET_LENGTH);
        let record = TokenRecord {
            id: id.clone(),
            name: name.to_string(),
            hash: hash_secret(&secret),
            created_at: Utc::now(),
        };
        records.push(record.clone());
        self.write(&records)?;
        info!(token = %record.id, name = %record.name, "Token created");
        Ok((record, format!("{id}.{secret}")))
    }

    /// Remove a token. Returns `false` if no token has this id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or rewritten.
    pub fn revoke(&self, id: &str) -> Result<bool> {
        let mut records = self.list()?;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.write(&records)?;
        info!(token = %id, "Token revoked");
        Ok(true)
    }

    /// Check a presented token.
    ///
    /// Returns the matching record, or `None` when the store is disabled.
    ///
    /// # Errors
    ///
    /// [`AuthError`] when the token is missing, malformed, unknown or wrong.
    pub fn verify(&self, token: Option<&str>) -> std::result::Result<Option<TokenRecord>, AuthError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let token = token.ok_or(AuthError::MissingToken)?;
        let (id, secret) = token
            .split_once('.')
            .filter(|(id, secret)| !id.is_empty() && !secret.is_empty())
            .ok_or(AuthError::MalformedToken)?;

        let records = self.list().map_err(|err| {
            warn!(error = %err, "Token store unreadable, refusing connection");
            AuthError::InvalidToken
        })?;
        let record = records
            .into_iter()
            .find(|record| record.id == id)
            .ok_or(AuthError::InvalidToken)?;

        let presented = hash_secret(secret);
        if bool::from(presented.as_bytes().ct_eq(record.hash.as_bytes())) {
            Ok(Some(record))
        } else {
            Err(AuthError::InvalidToken)
        }
    }

    fn write(&self, records: &[TokenRecord]) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "token store is disabled",
            )
            .into());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = owner_only(fs::OpenOptions::new().write(true).create(true).truncate(true))
                .open(&tmp)?;
            for record in records {
                serde_json::to_writer(&mut file, record)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn owner_only(options: &mut fs::OpenOptions) -> &mut fs::OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600)
}

#[cfg(not(unix))]
fn owner_only(options: &mut fs::OpenOptions) -> &mut fs::OpenOptions {
    options
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
