//! The shared secret that authenticates clients to the daemon.
//!
//! The daemon writes `<state_dir>/forker.cookie` once at startup with
//! restrictive permissions; clients read it and present the raw bytes in
//! their HELLO frame.  The file holds the cookie hex-encoded with no
//! trailing newline and is never mutated in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub const COOKIE_FILE: &str = "forker.cookie";
pub const COOKIE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// Draws a fresh 32-byte cookie from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; COOKIE_LEN];
        bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn matches(&self, presented: &[u8]) -> bool {
        presented == self.0.as_slice()
    }

    fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() != COOKIE_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; COOKIE_LEN];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let hi = char::from(chunk[0]).to_digit(16)?;
            let lo = char::from(chunk[1]).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }
}

pub fn cookie_path(state_dir: &Path) -> PathBuf {
    state_dir.join(COOKIE_FILE)
}

/// Generates a cookie and persists it under `state_dir`, mode 0600.
pub fn persist(state_dir: &Path) -> io::Result<Cookie> {
    fs::create_dir_all(state_dir)?;
    let cookie = Cookie::generate();
    let path = cookie_path(state_dir);
    fs::write(&path, cookie.to_hex())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(cookie)
}

/// Reads the cookie a running daemon persisted.
pub fn load(state_dir: &Path) -> io::Result<Cookie> {
    let raw = fs::read_to_string(cookie_path(state_dir))?;
    Cookie::from_hex(&raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed cookie file")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let written = persist(dir.path()).unwrap();
        let read = load(dir.path()).unwrap();
        assert_eq!(written, read);
        assert!(written.matches(read.bytes()));
    }

    #[test]
    fn distinct_daemons_get_distinct_cookies() {
        assert_ne!(Cookie::generate(), Cookie::generate());
    }

    #[test]
    fn malformed_cookie_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(cookie_path(dir.path()), "not hex").unwrap();
        let err = load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(unix)]
    #[test]
    fn cookie_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path()).unwrap();
        let mode = fs::metadata(cookie_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
