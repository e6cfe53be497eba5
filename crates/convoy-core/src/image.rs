//! Image references and content digests.
//!
//! The digest is the canonical identity of an image: two artifacts with the
//! same digest are interchangeable regardless of the tag they were pushed
//! under. Tags are mutable labels layered on top.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

const SHA256_PREFIX: &str = "sha256:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
}

/// Content digest in `sha256:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the digest of a blob.
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{SHA256_PREFIX}{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn parse(s: &str) -> Result<Self, ImageRefError> {
        let hex_part = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| ImageRefError::InvalidDigest(s.to_string()))?;
        let well_formed = hex_part.len() == 64
            && hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(ImageRefError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        let hex_part = &self.0[SHA256_PREFIX.len()..];
        &hex_part[..12.min(hex_part.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = ImageRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// A reference to an image: `repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageRef {
    pub fn pinned(repository: &str, tag: &str, digest: Digest) -> Self {
        Self {
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
            digest: Some(digest),
        }
    }

    /// Parse `registry.example.com:5000/team/web:1.2.0@sha256:...`.
    pub fn parse(s: &str) -> Result<Self, ImageRefError> {
        let s = s.trim();
        let (name, digest) = match s.split_once('@') {
            Some((name, d)) => (name, Some(Digest::parse(d)?)),
            None => (s, None),
        };

        // A ':' only introduces a tag when it comes after the last '/',
        // otherwise it is a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(ImageRefError::InvalidReference(s.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Whether this reference identifies exactly one image.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tag, &self.digest) {
            (_, Some(d)) => write!(f, "{}@{}", self.repository, d),
            (Some(t), None) => write!(f, "{}:{}", self.repository, t),
            (None, None) => f.write_str(&self.repository),
        }
    }
}

/// Derive the version tag for a trigger reference.
///
/// A semantic version (with or without a leading `v`) is normalized;
/// anything else (a commit sha, a branch) is used as-is.
pub fn version_tag(reference: &str) -> String {
    let trimmed = reference.trim();
    let candidate = trimmed.strip_prefix('v').unwrap_or(trimmed);
    match semver::Version::parse(candidate) {
        Ok(v) => v.to_string(),
        Err(_) => trimmed.to_string(),
    }
}
