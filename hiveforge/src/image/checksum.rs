//! File digests for downloads and published artifacts.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Algorithm name to lowercase hex digest.
pub type ChecksumMap = BTreeMap<String, String>;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// SHA-256.
    #[default]
    Sha256,
    /// MD5, kept for older download mirrors.
    Md5,
}

impl ChecksumKind {
    /// Every algorithm, in the order they appear in a [`ChecksumMap`].
    pub const ALL: [Self; 2] = [Self::Md5, Self::Sha256];

    /// The key used in a [`ChecksumMap`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unsupported checksum type '{other}'")),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Md5(Md5),
}

impl Hasher {
    fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumKind::Md5 => Self::Md5(Md5::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Md5(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Computes digests of `path` for every requested algorithm in a single pass.
pub fn file_digests(path: &Path, kinds: &[ChecksumKind]) -> io::Result<ChecksumMap> {
    let mut file = File::open(path)?;
    let mut hashers: Vec<(ChecksumKind, Hasher)> =
        kinds.iter().map(|k| (*k, Hasher::new(*k))).collect();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        for (_, hasher) in &mut hashers {
            hasher.update(&buffer[..read]);
        }
    }

    Ok(hashers
        .into_iter()
        .map(|(kind, hasher)| (kind.as_str().to_string(), hasher.finalize_hex()))
        .collect())
}

/// Computes one digest of `path`.
pub fn file_digest(path: &Path, kind: ChecksumKind) -> io::Result<String> {
    let mut map = file_digests(path, &[kind])?;
    map.remove(kind.as_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "digest missing"))
}

/// Returns true if `path` hashes to `expected` (hex, case-insensitive).
pub fn verify_file_checksum(path: &Path, expected: &str, kind: ChecksumKind) -> io::Result<bool> {
    let actual = file_digest(path, kind)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Async wrapper running [`file_digests`] on the blocking pool.
pub async fn file_digests_async(
    path: &Path,
    kinds: &[ChecksumKind],
) -> io::Result<ChecksumMap> {
    let path = path.to_path_buf();
    let kinds = kinds.to_vec();
    tokio::task::spawn_blocking(move || file_digests(&path, &kinds))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_DATA_SHA256: &str =
        "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9";
    const TEST_DATA_MD5: &str = "eb733a00c0c9d336e65691a37ab54293";

    fn test_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_verify_correct_sha256() {
        let file = test_file();
        assert!(verify_file_checksum(file.path(), TEST_DATA_SHA256, ChecksumKind::Sha256).unwrap());
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let file = test_file();
        let upper = TEST_DATA_SHA256.to_uppercase();
        assert!(verify_file_checksum(file.path(), &upper, ChecksumKind::Sha256).unwrap());
    }

    #[test]
    fn test_verify_wrong_digest() {
        let file = test_file();
        assert!(!verify_file_checksum(file.path(), "deadbeef", ChecksumKind::Sha256).unwrap());
        assert!(!verify_file_checksum(file.path(), "", ChecksumKind::Sha256).unwrap());
        assert!(!verify_file_checksum(file.path(), TEST_DATA_MD5, ChecksumKind::Sha256).unwrap());
    }

    #[test]
    fn test_all_digests_single_pass() {
        let file = test_file();
        let map = file_digests(file.path(), &ChecksumKind::ALL).unwrap();
        assert_eq!(map.get("sha256").map(String::as_str), Some(TEST_DATA_SHA256));
        assert_eq!(map.get("md5").map(String::as_str), Some(TEST_DATA_MD5));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(file_digest(Path::new("/nonexistent/image.xz"), ChecksumKind::Md5).is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("SHA256".parse::<ChecksumKind>(), Ok(ChecksumKind::Sha256));
        assert_eq!("md5".parse::<ChecksumKind>(), Ok(ChecksumKind::Md5));
        assert!("crc32".parse::<ChecksumKind>().is_err());
    }

    #[tokio::test]
    async fn test_async_digests() {
        let file = test_file();
        let map = file_digests_async(file.path(), &[ChecksumKind::Sha256]).await.unwrap();
        assert_eq!(map.len(), 1);
    }
}
