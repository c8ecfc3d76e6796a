//! Username public keys and signature checks.
//!
//! Keys live in `<public_keys_dir>/<username>.pem` (SPKI or PKCS#1 PEM). They
//! are read off the reactor by a spawned task; the reactor only ever sees
//! the [`UserKeyCache`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};

/// Key loading errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Username cannot name a key file.
    #[error("invalid username `{0}`")]
    InvalidUsername(String),

    /// Key file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Key file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Key file is not an RSA public key.
    #[error("{0} is not an RSA public key")]
    Parse(PathBuf),
}

/// State of a username in the cache.
#[derive(Debug, Clone, Copy)]
pub enum KeyLookup<'a> {
    /// Key known.
    Cached(&'a RsaPublicKey),
    /// Looked up before; there is no usable key.
    Missing,
    /// A load is in flight.
    Fetching,
    /// Never looked up.
    Unknown,
}

/// Per-username key cache, filled asynchronously.
#[derive(Debug, Default)]
pub struct UserKeyCache {
    keys: HashMap<String, Option<RsaPublicKey>>,
    fetching: HashSet<String>,
}

impl UserKeyCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Where `username` stands.
    pub fn lookup(&self, username: &str) -> KeyLookup<'_> {
        match self.keys.get(username) {
            Some(Some(key)) => KeyLookup::Cached(key),
            Some(None) => KeyLookup::Missing,
            None if self.fetching.contains(username) => KeyLookup::Fetching,
            None => KeyLookup::Unknown,
        }
    }

    /// Record that a load for `username` was started.
    pub fn mark_fetching(&mut self, username: &str) {
        self.fetching.insert(username.to_string());
    }

    /// Store the outcome of a load.
    pub fn insert(&mut self, username: &str, key: Option<RsaPublicKey>) {
        self.fetching.remove(username);
        self.keys.insert(username.to_string(), key);
    }
}

/// Path of the key file for `username`.
pub fn key_path(dir: &Path, username: &str) -> Result<PathBuf, KeyError> {
    let valid = !username.is_empty()
        && !username.starts_with('.')
        && !username.contains(['/', '\\', '\0']);
    if !valid {
        return Err(KeyError::InvalidUsername(username.to_string()));
    }
    Ok(dir.join(format!("{username}.pem")))
}

/// Parse an RSA public key in SPKI or PKCS#1 PEM form.
pub fn parse_public_key(pem: &str, path: &Path) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| KeyError::Parse(path.to_path_buf()))
}

/// Read the key of `username` from `dir`.
pub async fn load_public_key(dir: &Path, username: &str) -> Result<RsaPublicKey, KeyError> {
    let path = key_path(dir, username)?;
    let pem = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| KeyError::Read {
            path: path.clone(),
            source,
        })?;
    parse_public_key(&pem, &path)
}

/// Whether `signature` is the username signed with the matching private key.
///
/// PKCS#1 v1.5 with no digest prefix: the signature decrypts to the raw
/// username bytes.
pub fn verify_username_signature(key: &RsaPublicKey, username: &str, signature: &[u8]) -> bool {
    key.verify(Pkcs1v15Sign::new_unprefixed(), username.as_bytes(), signature)
        .is_ok()
}
