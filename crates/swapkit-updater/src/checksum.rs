//! Checksum verification of downloaded artifacts.
//!
//! Files are hashed as a stream, so large installers never need to be held
//! in memory.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::{debug, info};

use crate::error::ChecksumError;

/// Buffer size for reading files during checksum computation.
const BUFFER_SIZE: usize = 65536; // 64 KB

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// MD5, still published by older update manifests.
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-224.
    Sha224,
    /// SHA-256, used when the caller names no algorithm.
    #[default]
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded digest.
    #[must_use]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha224 => 56,
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Resolve an optional algorithm name, falling back to the default.
    pub fn resolve(name: Option<&str>) -> Result<Self, ChecksumError> {
        match name.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(name) => name.parse(),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(ChecksumError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expected digest of an artifact, as published alongside the download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedChecksum {
    /// Algorithm name as published; `None` means the default algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Hex digest, any case.
    pub hex_digest: String,
}

impl ExpectedChecksum {
    /// Creates a checksum descriptor.
    pub fn new(algorithm: Option<&str>, hex_digest: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.map(str::to_string),
            hex_digest: hex_digest.into(),
        }
    }
}

/// Compute the digest of a file with the given algorithm.
pub fn compute_file_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, ChecksumError> {
    debug!("Computing {} for: {}", algorithm, path.display());

    let io_err = |source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);

    let hex_hash = match algorithm {
        HashAlgorithm::Md5 => hash_stream::<Md5>(&mut reader),
        HashAlgorithm::Sha1 => hash_stream::<Sha1>(&mut reader),
        HashAlgorithm::Sha224 => hash_stream::<Sha224>(&mut reader),
        HashAlgorithm::Sha256 => hash_stream::<Sha256>(&mut reader),
        HashAlgorithm::Sha384 => hash_stream::<Sha384>(&mut reader),
        HashAlgorithm::Sha512 => hash_stream::<Sha512>(&mut reader),
    }
    .map_err(io_err)?;

    debug!("{}: {}", algorithm, hex_hash);
    Ok(hex_hash)
}

fn hash_stream<D: Digest>(reader: &mut impl Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file matches the expected digest.
///
/// `algorithm` defaults to SHA-256 when `None`. The expected digest may be
/// written as `sha256:abc…` and is compared case-insensitively.
pub fn verify(path: &Path, algorithm: Option<&str>, expected: &str) -> Result<(), ChecksumError> {
    let (prefix, digest) = split_prefixed_digest(expected);
    let algorithm = HashAlgorithm::resolve(algorithm.or(prefix))?;
    let expected = digest.trim().to_ascii_lowercase();

    if expected.len() != algorithm.hex_len() || !expected.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChecksumError::MalformedDigest {
            algorithm: algorithm.name(),
            digest: digest.to_string(),
        });
    }

    info!("Verifying {} checksum for: {}", algorithm, path.display());
    let actual = compute_file_digest(path, algorithm)?;

    if actual != expected {
        return Err(ChecksumError::Mismatch { expected, actual });
    }

    info!("Checksum verification successful");
    Ok(())
}

/// Verify a file against an [`ExpectedChecksum`] descriptor.
pub fn verify_expected(path: &Path, expected: &ExpectedChecksum) -> Result<(), ChecksumError> {
    verify(path, expected.algorithm.as_deref(), &expected.hex_digest)
}

/// Splits `sha256:abc…` into its algorithm prefix and digest.
fn split_prefixed_digest(value: &str) -> (Option<&str>, &str) {
    match value.split_once(':') {
        Some((prefix, digest)) if !prefix.is_empty() => (Some(prefix), digest),
        _ => (None, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use proptest::prelude::*;

    const HELLO_SHA256: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
    const HELLO_MD5: &str = "65a8e27d8879283831b664bd8b7f0ad4";
    const HELLO_SHA1: &str = "0a0a9f2a6772942557ab5355d76af442f8f65e01";

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_compute_sha256() {
        let file = write_temp(b"Hello, World!");
        let hash = compute_file_digest(file.path(), HashAlgorithm::Sha256).unwrap();
        assert_eq!(hash, HELLO_SHA256);
    }

    #[test]
    fn test_verify_defaults_to_sha256() {
        let file = write_temp(b"Hello, World!");
        assert!(verify(file.path(), None, HELLO_SHA256).is_ok());
        assert!(verify(file.path(), Some(""), HELLO_SHA256).is_ok());
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let file = write_temp(b"Hello, World!");
        let upper = HELLO_SHA256.to_uppercase();
        assert!(verify(file.path(), Some("SHA-256"), &upper).is_ok());
    }

    #[test]
    fn test_verify_accepts_prefixed_digest() {
        let file = write_temp(b"Hello, World!");
        let prefixed = format!("sha256:{HELLO_SHA256}");
        assert!(verify(file.path(), None, &prefixed).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let file = write_temp(b"Hello, World!");
        let wrong = "0".repeat(64);
        let result = verify(file.path(), None, &wrong);

        match result {
            Err(ChecksumError::Mismatch { expected, actual }) => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, HELLO_SHA256);
            }
            other => panic!("Expected Mismatch error, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_unsupported_algorithm() {
        let file = write_temp(b"Hello, World!");
        let result = verify(file.path(), Some("CRC32"), "ec4ac3d0");
        assert!(matches!(result, Err(ChecksumError::UnsupportedAlgorithm(name)) if name == "CRC32"));
    }

    #[test]
    fn test_verify_legacy_algorithms() {
        let file = write_temp(b"Hello, World!");
        assert!(verify(file.path(), Some("MD5"), HELLO_MD5).is_ok());
        assert!(verify(file.path(), Some("SHA1"), HELLO_SHA1).is_ok());
        assert!(verify(file.path(), Some("sha-1"), &HELLO_SHA1.to_uppercase()).is_ok());
        assert!(matches!(
            verify(file.path(), Some("MD5"), &"0".repeat(32)),
            Err(ChecksumError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_verify_malformed_digest() {
        let file = write_temp(b"Hello, World!");
        assert!(matches!(
            verify(file.path(), None, "not-hex"),
            Err(ChecksumError::MalformedDigest { .. })
        ));
        assert!(matches!(
            verify(file.path(), Some("sha512"), HELLO_SHA256),
            Err(ChecksumError::MalformedDigest { .. })
        ));
    }

    #[test]
    fn test_verify_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = verify(&dir.path().join("missing.zip"), None, HELLO_SHA256);
        assert!(matches!(result, Err(ChecksumError::Io { .. })));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("sha512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("SHA_384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
        assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!(HashAlgorithm::resolve(None).unwrap(), HashAlgorithm::Sha256);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    fn algorithm_strategy() -> impl Strategy<Value = HashAlgorithm> {
        prop_oneof![
            Just(HashAlgorithm::Md5),
            Just(HashAlgorithm::Sha1),
            Just(HashAlgorithm::Sha224),
            Just(HashAlgorithm::Sha256),
            Just(HashAlgorithm::Sha384),
            Just(HashAlgorithm::Sha512),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_single_bit_flip_is_detected(
            content in proptest::collection::vec(any::<u8>(), 1..512),
            algorithm in algorithm_strategy(),
            bit in any::<usize>(),
        ) {
            let file = write_temp(&content);
            let digest = compute_file_digest(file.path(), algorithm).unwrap();
            prop_assert!(verify(file.path(), Some(algorithm.name()), &digest).is_ok());

            let mut mutated = content.clone();
            let bit = bit % (mutated.len() * 8);
            mutated[bit / 8] ^= 1 << (bit % 8);
            let mutated_file = write_temp(&mutated);

            let result = verify(mutated_file.path(), Some(algorithm.name()), &digest);
            prop_assert!(matches!(result, Err(ChecksumError::Mismatch { .. })), "expected mismatch");
        }
    }
}
