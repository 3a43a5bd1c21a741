//! Content digest utilities
//!
//! Centralizes computing, validating, and splitting the `algorithm:hex`
//! digests used in image references, registry manifests, and archive members.

use crate::error::{RelocatorError, Result};
use sha2::{Digest, Sha256};
use std::io::{self, Write};

/// Utilities for working with content digests
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data, hex only
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 lowercase hex characters)
    pub fn is_valid_sha256_hex(hex_part: &str) -> bool {
        hex_part.len() == 64 && Self::is_lower_hex(hex_part)
    }

    /// Validate a digest algorithm name such as `sha256` or `multihash+base58`
    pub fn is_valid_algorithm(algorithm: &str) -> bool {
        !algorithm.is_empty()
            && algorithm
                .split(['+', '.', '_', '-'])
                .all(|part| {
                    !part.is_empty()
                        && part
                            .chars()
                            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                })
    }

    /// Validate the encoded part of a digest for the given algorithm
    pub fn is_valid_encoded(algorithm: &str, encoded: &str) -> bool {
        match algorithm {
            "sha256" => Self::is_valid_sha256_hex(encoded),
            "sha384" => encoded.len() == 96 && Self::is_lower_hex(encoded),
            "sha512" => encoded.len() == 128 && Self::is_lower_hex(encoded),
            _ => encoded.len() >= 32 && Self::is_lower_hex(encoded),
        }
    }

    /// Split `algorithm:hex` into its parts, validating both
    pub fn split(digest: &str) -> Result<(&str, &str)> {
        let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
            RelocatorError::parse(digest, "digest must have the form algorithm:hex")
        })?;

        if !Self::is_valid_algorithm(algorithm) {
            return Err(RelocatorError::parse(
                digest,
                format!("invalid digest algorithm {:?}", algorithm),
            ));
        }
        if !Self::is_valid_encoded(algorithm, encoded) {
            return Err(RelocatorError::parse(
                digest,
                format!("invalid {} digest encoding", algorithm),
            ));
        }

        Ok((algorithm, encoded))
    }

    /// Verify data matches expected digest
    pub fn verify_data_integrity(data: &[u8], expected_digest: &str) -> Result<()> {
        Self::verify_computed(&Self::compute_docker_digest(data), expected_digest)
    }

    /// Compare a `sha256:<hex>` digest computed locally with the expected one
    pub fn verify_computed(computed_digest: &str, expected_digest: &str) -> Result<()> {
        let (algorithm, _) = Self::split(expected_digest)?;
        if algorithm != "sha256" {
            return Err(RelocatorError::Registry(format!(
                "Unsupported digest algorithm {} for {}",
                algorithm, expected_digest
            )));
        }

        if computed_digest != expected_digest {
            return Err(RelocatorError::Registry(format!(
                "Data integrity check failed: expected {}, computed {}",
                expected_digest, computed_digest
            )));
        }

        Ok(())
    }

    /// Archive member path for a blob with the given digest
    pub fn blob_path(digest: &str) -> Result<String> {
        let (algorithm, encoded) = Self::split(digest)?;
        Ok(format!("blobs/{}/{}", algorithm, encoded))
    }

    /// Format digest for display (truncated for readability)
    pub fn format_digest_short(digest: &str) -> String {
        match digest.char_indices().nth(19) {
            Some((idx, _)) => format!("{}...", &digest[..idx]),
            None => digest.to_string(),
        }
    }

    fn is_lower_hex(value: &str) -> bool {
        value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

/// Incremental sha256 over a blob that arrives in chunks
#[derive(Default)]
pub struct BlobHasher {
    hasher: Sha256,
    size: u64,
}

impl BlobHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    /// `sha256:<hex>` digest and total size
    pub fn finish(self) -> (String, u64) {
        (format!("sha256:{}", hex::encode(self.hasher.finalize())), self.size)
    }
}

/// Writer that hashes everything written through it
pub struct DigestWriter<W> {
    inner: W,
    hasher: BlobHasher,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: BlobHasher::new(),
        }
    }

    /// The wrapped writer, plus digest and size of what went through it
    pub fn finish(self) -> (W, String, u64) {
        let (digest, size) = self.hasher.finish();
        (self.inner, digest, size)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
