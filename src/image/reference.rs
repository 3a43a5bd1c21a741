//! Container image reference parsing.
//!
//! Parses docker-style image strings like `registry.example.com/org/app:1.2.3`
//! or `app@sha256:...` into structured components, rewrites them for a
//! destination registry, and maps them to and from bundle path segments.

use crate::image::digest::DigestUtils;
use crate::error::{RelocatorError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Tag applied when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// Parsed image reference.
///
/// After parsing exactly one of `tag` or `digest` is set. Values are never
/// mutated; [`ImageReference::rewrite`] produces a new reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageReference {
    /// Registry host, with optional port (e.g. "registry.example.com:5000")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Repository path without domain, tag, or digest (e.g. "org/app")
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Digest in `algorithm:hex` form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → name `nginx`, tag `latest`
    /// - `nginx:1.25` → name `nginx`, tag `1.25`
    /// - `localhost:5000/team/app` → domain `localhost:5000`, name `team/app`
    /// - `ghcr.io/org/image@sha256:abc...` → digest only
    /// - `ghcr.io/org/image:v1@sha256:abc...` → digest wins, tag dropped
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(RelocatorError::parse(raw, "empty image reference"));
        }
        if let Some(c) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(RelocatorError::parse(
                raw,
                format!("unexpected character {:?}", c),
            ));
        }
        if raw.len() == 64 && DigestUtils::is_valid_sha256_hex(raw) {
            return Err(RelocatorError::parse(
                raw,
                "bare image IDs are not named references",
            ));
        }

        let (remainder, digest) = match raw.split_once('@') {
            Some((remainder, digest)) => {
                DigestUtils::split(digest)
                    .map_err(|_| RelocatorError::parse(raw, "invalid digest"))?;
                (remainder, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A tag is a colon after the last slash; earlier colons belong to a port.
        let last_slash = remainder.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (full_name, tag) = match remainder[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&remainder[..colon], Some(&remainder[colon + 1..]))
            }
            None => (remainder, None),
        };

        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(RelocatorError::parse(raw, format!("invalid tag {:?}", tag)));
            }
        }

        let (domain, name) = split_domain(full_name);
        if let Some(domain) = domain {
            if !is_valid_domain(domain) {
                return Err(RelocatorError::parse(
                    raw,
                    format!("invalid registry domain {:?}", domain),
                ));
            }
        }
        validate_name(raw, name)?;

        // Digest takes precedence; a reference names exactly one of the two.
        let tag = match (&digest, tag) {
            (Some(_), _) => None,
            (None, Some(tag)) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(ImageReference {
            domain: domain.map(str::to_string),
            name: name.to_string(),
            tag,
            digest,
        })
    }

    /// Produce the reference this image gets in a destination registry.
    ///
    /// The new name is `dest_namespace/<basename of name>`; `dest_domain`
    /// becomes the domain when non-empty. Tag or digest carry over unchanged.
    pub fn rewrite(&self, dest_domain: &str, dest_namespace: &str) -> ImageReference {
        let basename = self.basename();
        let namespace = dest_namespace.trim_matches('/');
        let name = if namespace.is_empty() {
            basename.to_string()
        } else {
            format!("{}/{}", namespace, basename)
        };
        let dest_domain = dest_domain.trim_end_matches('/');

        ImageReference {
            domain: (!dest_domain.is_empty()).then(|| dest_domain.to_string()),
            name,
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }

    /// Path segments addressing this image inside a bundle format directory.
    ///
    /// `[name, tag]` for tagged references, `[name, algorithm, hex]` for
    /// digest references. The domain is intentionally not part of the key.
    pub fn archive_path_segments(&self) -> Vec<String> {
        let mut segments = vec![self.name.clone()];
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => {
                segments.extend(digest.splitn(2, ':').map(str::to_string));
            }
            (Some(tag), None) => segments.push(tag.clone()),
            (None, None) => segments.push(DEFAULT_TAG.to_string()),
        }
        segments
    }

    /// Recover a reference from path components below a bundle format directory.
    ///
    /// The name may span several components. A trailing `algorithm/hex` pair
    /// that forms a valid digest is read as a digest; otherwise the last
    /// component is the tag. The recovered reference has no domain.
    pub fn from_path_segments<S: AsRef<str>>(segments: &[S]) -> Result<Self> {
        let segments: Vec<&str> = segments.iter().map(AsRef::as_ref).collect();
        let joined = segments.join("/");
        if segments.len() < 2 {
            return Err(RelocatorError::parse(
                joined,
                "bundle path needs at least a name and a tag",
            ));
        }

        let n = segments.len();
        let digest_tail = n >= 3
            && DigestUtils::is_valid_algorithm(segments[n - 2])
            && DigestUtils::is_valid_encoded(segments[n - 2], segments[n - 1]);

        let (name, tag, digest) = if digest_tail {
            (
                segments[..n - 2].join("/"),
                None,
                Some(format!("{}:{}", segments[n - 2], segments[n - 1])),
            )
        } else {
            let tag = segments[n - 1];
            if !is_valid_tag(tag) {
                return Err(RelocatorError::parse(
                    joined,
                    format!("invalid tag {:?} in bundle path", tag),
                ));
            }
            (segments[..n - 1].join("/"), Some(tag.to_string()), None)
        };

        validate_name(&joined, &name)?;

        Ok(ImageReference {
            domain: None,
            name,
            tag,
            digest,
        })
    }

    /// Last path component of the name
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// `domain/name`, or just `name` when there is no domain
    pub fn repository(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}/{}", domain, self.name),
            None => self.name.clone(),
        }
    }

    /// Registry API reference: the digest when present, else the tag
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)
        } else if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)
        } else {
            Ok(())
        }
    }
}

impl FromStr for ImageReference {
    type Err = RelocatorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split off the first path component when it looks like a registry host.
fn split_domain(full_name: &str) -> (Option<&str>, &str) {
    match full_name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, full_name),
    }
}

fn validate_name(raw: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RelocatorError::parse(raw, "empty repository name"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(RelocatorError::parse(
            raw,
            format!("repository name longer than {} characters", MAX_NAME_LENGTH),
        ));
    }
    if name.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(RelocatorError::parse(raw, "repository name must be lowercase"));
    }
    if let Some(component) = name.split('/').find(|c| !is_valid_path_component(c)) {
        return Err(RelocatorError::parse(
            raw,
            format!("invalid repository name component {:?}", component),
        ));
    }
    Ok(())
}

/// `[a-z0-9]+` runs joined by `.`, `_`, `__`, or one or more `-`.
fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let valid = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
    }
    true
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LENGTH
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_valid_domain(domain: &str) -> bool {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
