//! Trust-on-first-use (TOFU) host key records in OpenSSH `known_hosts`
//! format.
//!
//! Format: one `host[,host...] key-type base64 [comment]` entry per line.
//! Hosts are normalized the way OpenSSH does it: port 22 is dropped, any
//! other port is written as `[host]:port`.

use crate::error::{RevsshError, RevsshResult};
use crate::keys;
use crate::protocol::DEFAULT_SSH_PORT;
use russh::keys::PublicKey;
use std::fs;
use std::path::PathBuf;

/// Result of checking a host's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// The host is known and the key matches.
    Known,
    /// The host has never been seen before.
    Unknown,
    /// The host is known but presented a different key.
    Changed,
}

/// Normalize `host`, `host:port` or `[host]:port` to the `known_hosts`
/// form. Lowercases the host.
pub fn normalize(address: &str) -> String {
    let address = address.trim();
    let (host, port) = split_host_port(address);
    let host = host.to_ascii_lowercase();
    match port {
        Some(port) if port != DEFAULT_SSH_PORT => format!("[{host}]:{port}"),
        _ => host,
    }
}

fn split_host_port(address: &str) -> (&str, Option<u16>) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    // bare IPv6 literals carry several colons and no port
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (address, None),
        },
        _ => (address, None),
    }
}

/// Known hosts file manager.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Check `host` (any accepted address form) against stored records.
    pub fn verify_host(&self, host: &str, key: &PublicKey) -> RevsshResult<HostStatus> {
        let host = normalize(host);
        let mut seen = false;
        for (hosts, stored) in self.load_entries()? {
            if !hosts.iter().any(|h| *h == host) {
                continue;
            }
            if keys::keys_equal(&stored, key) {
                return Ok(HostStatus::Known);
            }
            seen = true;
        }
        Ok(if seen {
            HostStatus::Changed
        } else {
            HostStatus::Unknown
        })
    }

    /// Append a record for `host`.
    pub fn add_host(&self, host: &str, key: &PublicKey) -> RevsshResult<()> {
        let line = format!(
            "{} {}",
            normalize(host),
            key.to_openssh()
                .map_err(|e| RevsshError::InvalidKey(e.to_string()))?
        );

        let mut content = if self.path.exists() {
            fs::read_to_string(&self.path)?
        } else {
            String::new()
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&line);
        content.push('\n');

        self.save(&content)
    }

    /// Check `host`, recording its key on first use.
    pub fn check_and_record(&self, host: &str, key: &PublicKey) -> RevsshResult<()> {
        match self.verify_host(host, key)? {
            HostStatus::Known => Ok(()),
            HostStatus::Unknown => self.add_host(host, key),
            HostStatus::Changed => Err(RevsshError::HostKeyMismatch {
                host: normalize(host),
            }),
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn load_entries(&self) -> RevsshResult<Vec<(Vec<String>, PublicKey)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let entries = content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
                    return None;
                }
                let (hosts, key) = line.split_once(' ')?;
                let key = PublicKey::from_openssh(key.trim()).ok()?;
                let hosts = hosts.split(',').map(str::to_ascii_lowercase).collect();
                Some((hosts, key))
            })
            .collect();

        Ok(entries)
    }

    fn save(&self, content: &str) -> RevsshResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;

    fn random_public_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    fn temp_known_hosts() -> (tempfile::TempDir, KnownHosts) {
        let dir = tempfile::tempdir().unwrap();
        let kh = KnownHosts::new(dir.path().join("known_hosts"));
        (dir, kh)
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("box1:22"), "box1");
        assert_eq!(normalize("BOX1"), "box1");
        assert_eq!(normalize("box2:4000"), "[box2]:4000");
        assert_eq!(normalize("[box2]:4000"), "[box2]:4000");
        assert_eq!(normalize("[box2]:22"), "box2");
        assert_eq!(normalize("::1"), "::1");
        assert_eq!(normalize("[::1]:2222"), "[::1]:2222");
    }

    #[test]
    fn unknown_host() {
        let (_dir, kh) = temp_known_hosts();
        assert_eq!(
            kh.verify_host("example.com", &random_public_key()).unwrap(),
            HostStatus::Unknown
        );
    }

    #[test]
    fn first_use_is_recorded() {
        let (_dir, kh) = temp_known_hosts();
        let key = random_public_key();
        kh.check_and_record("box1:22", &key).unwrap();
        assert_eq!(kh.verify_host("box1", &key).unwrap(), HostStatus::Known);
        assert_eq!(kh.verify_host("Box1:22", &key).unwrap(), HostStatus::Known);
    }

    #[test]
    fn changed_key_is_rejected() {
        let (_dir, kh) = temp_known_hosts();
        let k1 = random_public_key();
        let k2 = random_public_key();
        kh.check_and_record("box1:22", &k1).unwrap();

        assert_eq!(kh.verify_host("box1:22", &k2).unwrap(), HostStatus::Changed);
        let err = kh.check_and_record("box1:22", &k2).unwrap_err();
        assert!(matches!(err, RevsshError::HostKeyMismatch { .. }));
        // the stored key is untouched
        assert_eq!(kh.verify_host("box1:22", &k1).unwrap(), HostStatus::Known);
    }

    #[test]
    fn ports_are_distinct_hosts() {
        let (_dir, kh) = temp_known_hosts();
        let k1 = random_public_key();
        let k2 = random_public_key();
        kh.check_and_record("box2:22", &k1).unwrap();
        kh.check_and_record("box2:4000", &k2).unwrap();
        assert_eq!(kh.verify_host("box2", &k1).unwrap(), HostStatus::Known);
        assert_eq!(kh.verify_host("[box2]:4000", &k2).unwrap(), HostStatus::Known);
    }

    #[test]
    fn tolerates_foreign_lines() {
        let (_dir, kh) = temp_known_hosts();
        let key = random_public_key();
        std::fs::write(
            kh.path(),
            format!(
                "# comment\n|1|hashed|entry ssh-ed25519 AAAA\nbox3,10.0.0.3 {}\n",
                key.to_openssh().unwrap()
            ),
        )
        .unwrap();
        assert_eq!(kh.verify_host("10.0.0.3", &key).unwrap(), HostStatus::Known);
        assert_eq!(kh.verify_host("box3", &key).unwrap(), HostStatus::Known);
    }
}
