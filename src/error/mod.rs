//! Error types for image relocation
//!
//! Every fallible operation in the crate returns [`Result`]. Registry pulls and
//! pushes that fail are wrapped in [`RelocatorError::Transfer`] so the caller
//! can tell which image failed and in which direction.

pub mod handlers;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelocatorError>;

/// Direction of a registry transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Registry to local bundle
    Pull,
    /// Local bundle to registry
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Pull => f.write_str("pull"),
            Direction::Push => f.write_str("push"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelocatorError {
    /// Malformed image reference string
    #[error("Invalid image reference {reference:?}: {reason}")]
    Parse { reference: String, reason: String },

    /// Filesystem error tied to a specific path
    #[error("IO error at {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A pull or push of one image failed
    #[error("Failed to {direction} image {image}: {source}")]
    Transfer {
        image: String,
        direction: Direction,
        #[source]
        source: Box<RelocatorError>,
    },

    /// The trust policy refused a transfer source
    #[error("Policy rejected {0}")]
    PolicyRejected(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Malformed or unsupported docker-archive tarball
    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl RelocatorError {
    pub fn parse(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        RelocatorError::Parse {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelocatorError::Path {
            path: path.into(),
            source,
        }
    }

    pub fn transfer(image: impl fmt::Display, direction: Direction, source: RelocatorError) -> Self {
        RelocatorError::Transfer {
            image: image.to_string(),
            direction,
            source: Box::new(source),
        }
    }

    /// Image named by a transfer failure, if this is one
    pub fn failed_image(&self) -> Option<&str> {
        match self {
            RelocatorError::Transfer { image, .. } => Some(image),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_names_image_and_direction() {
        let err = RelocatorError::transfer(
            "registry.example.com/app:1.2.3",
            Direction::Push,
            RelocatorError::Registry("manifest unknown".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Failed to push image registry.example.com/app:1.2.3: Registry error: manifest unknown"
        );
        assert_eq!(err.failed_image(), Some("registry.example.com/app:1.2.3"));
    }

    #[test]
    fn test_path_error_display() {
        let err = RelocatorError::path(
            "/bundle/docker-archive",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().starts_with("IO error at /bundle/docker-archive"));
        assert!(err.failed_image().is_none());
    }
}
