//! Public/private key helpers: fingerprints, hex transport encoding,
//! constant-time comparison, `authorized_keys` parsing and host key files.

use crate::error::{RevsshError, RevsshResult};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, warn};

/// Host key file names, in load order.
pub const HOST_KEY_FILES: [&str; 3] = [
    "ssh_host_ecdsa_key",
    "ssh_host_ed25519_key",
    "ssh_host_rsa_key",
];

/// SHA-256 of the key's SSH wire encoding, hex encoded.
pub fn fingerprint(key: &PublicKey) -> String {
    match key.to_bytes() {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(_) => String::from("<unencodable>"),
    }
}

/// Short fingerprint prefix for log lines.
pub fn short_fingerprint(key: &PublicKey) -> String {
    let mut fp = fingerprint(key);
    fp.truncate(12);
    fp
}

// ── Hex transport encoding ──────────────────────────────────────────

/// Hex of the key's SSH wire encoding.
pub fn public_key_hex(key: &PublicKey) -> RevsshResult<String> {
    let bytes = key
        .to_bytes()
        .map_err(|e| RevsshError::InvalidKey(e.to_string()))?;
    Ok(hex::encode(bytes))
}

pub fn public_key_from_hex(encoded: &str) -> RevsshResult<PublicKey> {
    let bytes = hex::decode(encoded).map_err(|e| RevsshError::InvalidKey(e.to_string()))?;
    PublicKey::from_bytes(&bytes).map_err(|e| RevsshError::InvalidKey(e.to_string()))
}

/// Decode a list of hex keys, skipping entries that fail to parse.
pub fn public_keys_from_hex(encoded: &[String]) -> Vec<PublicKey> {
    encoded
        .iter()
        .filter_map(|hex_key| match public_key_from_hex(hex_key) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(error = %e, "skipping undecodable public key");
                None
            }
        })
        .collect()
}

// ── Comparison ──────────────────────────────────────────────────────

/// Constant-time equality over the keys' wire encodings.
pub fn keys_equal(a: &PublicKey, b: &PublicKey) -> bool {
    match (a.to_bytes(), b.to_bytes()) {
        (Ok(a), Ok(b)) => a.as_slice().ct_eq(b.as_slice()).into(),
        _ => false,
    }
}

/// Whether `candidate` is in `set`. Every member is compared, match or not.
pub fn contains_key(set: &[PublicKey], candidate: &PublicKey) -> bool {
    let Ok(candidate) = candidate.to_bytes() else {
        return false;
    };
    let mut found = Choice::from(0u8);
    for key in set {
        if let Ok(bytes) = key.to_bytes() {
            found |= bytes.as_slice().ct_eq(candidate.as_slice());
        }
    }
    found.into()
}

// ── authorized_keys ─────────────────────────────────────────────────

/// Parse an OpenSSH `authorized_keys` file. Lines with an options prefix are
/// accepted; comments, blanks and unparseable lines are skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    content
        .lines()
        .filter_map(|line| parse_authorized_key_line(line.trim()))
        .collect()
}

fn parse_authorized_key_line(line: &str) -> Option<PublicKey> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Some(key);
    }

    // options field: retry from the first token naming a key algorithm
    let start = line
        .match_indices(' ')
        .map(|(i, _)| i + 1)
        .find(|&i| is_key_type(&line[i..]))?;
    match PublicKey::from_openssh(&line[start..]) {
        Ok(key) => Some(key),
        Err(e) => {
            debug!(error = %e, "skipping authorized_keys line");
            None
        }
    }
}

fn is_key_type(s: &str) -> bool {
    s.starts_with("ssh-") || s.starts_with("ecdsa-") || s.starts_with("sk-")
}

// ── Private keys ────────────────────────────────────────────────────

/// Load every host key file present in `dir`. Unreadable keys are skipped.
pub fn load_host_keys(dir: &Path) -> Vec<PrivateKey> {
    HOST_KEY_FILES
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.exists())
        .filter_map(|path| match russh::keys::load_secret_key(&path, None) {
            Ok(key) => {
                debug!(path = %path.display(), "loaded private key");
                Some(key)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load private key");
                None
            }
        })
        .collect()
}

/// Generate an Ed25519 host key in `dir` unless one already exists.
///
/// Returns the key path. The file is written with `0600` permissions.
pub fn generate_host_key(dir: &Path) -> RevsshResult<PathBuf> {
    let path = dir.join("ssh_host_ed25519_key");
    if path.exists() {
        return Ok(path);
    }
    std::fs::create_dir_all(dir)?;

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| RevsshError::InvalidKey(e.to_string()))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| RevsshError::InvalidKey(e.to_string()))?;
    std::fs::write(&path, pem.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path)
}
