//! Content hashes for artifact integrity checks.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// MD5, as published next to most OSM extracts.
    Md5,
}

impl HashAlgorithm {
    /// Length of the hex-encoded digest.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Md5 => 32,
        }
    }

    /// Starts an incremental hasher.
    #[must_use]
    pub fn hasher(self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Md5 => ContentHasher::Md5(Md5::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

/// Incremental hasher over one of the supported algorithms.
#[derive(Clone)]
pub enum ContentHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// MD5 state.
    Md5(Md5),
}

impl ContentHasher {
    /// Feeds bytes into the hasher.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Md5(h) => h.update(bytes),
        }
    }

    /// Finishes and returns the lowercase hex digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// An expected content hash, written as `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    /// The algorithm.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex digest.
    pub hex: String,
}

impl ContentHash {
    /// Creates a hash, validating the hex digest for the algorithm.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the digest is malformed.
    pub fn new(algorithm: HashAlgorithm, hex: impl AsRef<str>) -> Result<Self, String> {
        let hex = hex.as_ref().trim().to_ascii_lowercase();
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!(
                "expected {} hex characters for {algorithm}, got '{hex}'",
                algorithm.hex_len()
            ));
        }
        Ok(Self { algorithm, hex })
    }

    /// Returns true if `actual` (hex) equals this digest.
    #[must_use]
    pub fn matches(&self, actual: &str) -> bool {
        self.hex.eq_ignore_ascii_case(actual)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| format!("hash '{s}' must look like 'sha256:<hex>' or 'md5:<hex>'"))?;
        let algorithm = match alg.trim().to_ascii_lowercase().as_str() {
            "sha256" => HashAlgorithm::Sha256,
            "md5" => HashAlgorithm::Md5,
            other => return Err(format!("unsupported hash algorithm '{other}'")),
        };
        Self::new(algorithm, hex)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Hashes a file from disk. Blocking; call from `spawn_blocking` for big files.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Extracts the digest from a checksum file body such as `<hex>  file.osm.pbf`.
#[must_use]
pub fn parse_checksum_body(body: &str, algorithm: HashAlgorithm) -> Option<ContentHash> {
    body.split_whitespace()
        .next()
        .and_then(|token| ContentHash::new(algorithm, token).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_and_display() {
        let hash: ContentHash = "MD5:D41D8CD98F00B204E9800998ECF8427E".parse().unwrap();
        assert_eq!(hash.algorithm, HashAlgorithm::Md5);
        assert_eq!(hash.to_string(), "md5:d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("sha1:abcd".parse::<ContentHash>().is_err());
        assert!("sha256:xyz".parse::<ContentHash>().is_err());
        assert!("d41d8cd98f00b204e9800998ecf8427e".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_hash_file_known_digests() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        assert_eq!(
            hash_file(file.path(), HashAlgorithm::Md5).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_file(file.path(), HashAlgorithm::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_checksum_body() {
        let body = "900150983cd24fb0d6963f7d28e17f72  germany-latest.osm.pbf\n";
        let hash = parse_checksum_body(body, HashAlgorithm::Md5).unwrap();
        assert!(hash.matches("900150983CD24FB0D6963F7D28E17F72"));
        assert!(parse_checksum_body("", HashAlgorithm::Md5).is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let hash = ContentHash::new(HashAlgorithm::Md5, "900150983cd24fb0d6963f7d28e17f72").unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, r#""md5:900150983cd24fb0d6963f7d28e17f72""#);
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
