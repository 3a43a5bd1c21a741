//! Transport-qualified image locations
//!
//! A copy source or destination is written `<transport>:<location>`:
//! `docker://registry.example.com/app:1.2.3` for a registry and
//! `docker-archive:/path/to/archive` for a local tarball.

use crate::error::{RelocatorError, Result};
use crate::image::ImageReference;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const DOCKER_PREFIX: &str = "docker://";
const DOCKER_ARCHIVE_PREFIX: &str = "docker-archive:";

/// Either end of an image copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRef {
    /// An image in a registry
    Registry(ImageReference),
    /// A docker-archive tarball on local disk
    DockerArchive(PathBuf),
}

impl TransportRef {
    pub fn registry(reference: ImageReference) -> Self {
        TransportRef::Registry(reference)
    }

    pub fn docker_archive(path: impl Into<PathBuf>) -> Self {
        TransportRef::DockerArchive(path.into())
    }
}

impl fmt::Display for TransportRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportRef::Registry(reference) => write!(f, "{}{}", DOCKER_PREFIX, reference),
            TransportRef::DockerArchive(path) => {
                write!(f, "{}{}", DOCKER_ARCHIVE_PREFIX, path.display())
            }
        }
    }
}

impl FromStr for TransportRef {
    type Err = RelocatorError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(location) = s.strip_prefix(DOCKER_PREFIX) {
            return Ok(TransportRef::Registry(ImageReference::parse(location)?));
        }
        if let Some(location) = s.strip_prefix(DOCKER_ARCHIVE_PREFIX) {
            if location.is_empty() {
                return Err(RelocatorError::parse(s, "empty archive path"));
            }
            return Ok(TransportRef::DockerArchive(PathBuf::from(location)));
        }

        match s.split_once(':') {
            Some(("docker", _)) => Err(RelocatorError::parse(s, "missing // in docker://")),
            Some((transport, _)) if !transport.contains('/') && !transport.contains('.') => {
                Err(RelocatorError::parse(s, format!("unknown transport {:?}", transport)))
            }
            _ => Err(RelocatorError::parse(s, "missing transport prefix")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_transport() {
        let parsed: TransportRef = "docker://myregistry.io/myns/app:1.2.3".parse().unwrap();
        match &parsed {
            TransportRef::Registry(reference) => {
                assert_eq!(reference.domain.as_deref(), Some("myregistry.io"));
                assert_eq!(reference.name, "myns/app");
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(parsed.to_string(), "docker://myregistry.io/myns/app:1.2.3");
    }

    #[test]
    fn test_parse_archive_transport() {
        let parsed: TransportRef = "docker-archive:/tmp/bundle/docker-archive/app/1.2.3"
            .parse()
            .unwrap();
        assert_eq!(
            parsed,
            TransportRef::docker_archive("/tmp/bundle/docker-archive/app/1.2.3")
        );
    }

    #[test]
    fn test_parse_rejects_unknown_transports() {
        assert!("oci:/tmp/layout".parse::<TransportRef>().is_err());
        assert!("docker:app:1".parse::<TransportRef>().is_err());
        assert!("docker-archive:".parse::<TransportRef>().is_err());
        assert!("registry.example.com/app:1".parse::<TransportRef>().is_err());
    }
}
