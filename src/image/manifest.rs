//! Registry image manifest types
//!
//! Only single-platform manifests (Docker schema 2 and OCI image manifest)
//! are modelled; lists and indexes are recognised so they can be refused.

use crate::error::{RelocatorError, Result};
use crate::image::digest::DigestUtils;
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Media types sent in the Accept header when fetching manifests
pub const ACCEPTED_MANIFEST_TYPES: [&str; 4] = [
    DOCKER_MANIFEST_V2,
    OCI_MANIFEST_V1,
    DOCKER_MANIFEST_LIST,
    OCI_INDEX_V1,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            size,
            digest: digest.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Docker schema 2 manifest for the given config and layers
    pub fn schema2(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST_V2.to_string()),
            config,
            layers,
        }
    }

    /// Parse a manifest, refusing lists and indexes
    pub fn from_slice(data: &[u8], content_type: Option<&str>) -> Result<Self> {
        let media_type = content_type
            .map(str::to_string)
            .or_else(|| sniff_media_type(data));
        if is_manifest_list(media_type.as_deref()) {
            return Err(RelocatorError::Registry(format!(
                "manifest lists are not supported (media type {})",
                media_type.unwrap_or_default()
            )));
        }

        let manifest: ImageManifest = serde_json::from_slice(data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(RelocatorError::Registry(format!(
                "unsupported manifest schema version {}",
                self.schema_version
            )));
        }
        for descriptor in std::iter::once(&self.config).chain(&self.layers) {
            DigestUtils::split(&descriptor.digest)?;
        }
        Ok(())
    }

    /// Media type to send when uploading this manifest.
    ///
    /// OCI manifests may omit `mediaType`; the config descriptor tells them apart.
    pub fn content_type(&self) -> &str {
        match self.media_type.as_deref() {
            Some(media_type) => media_type,
            None if self.config.media_type.starts_with("application/vnd.oci.") => OCI_MANIFEST_V1,
            None => DOCKER_MANIFEST_V2,
        }
    }
}

pub fn is_manifest_list(media_type: Option<&str>) -> bool {
    matches!(media_type, Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX_V1))
}

/// Read `mediaType` from the document body when the server sent no usable header
fn sniff_media_type(data: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Envelope {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
    }

    let envelope: Envelope = serde_json::from_slice(data).ok()?;
    match (envelope.media_type, envelope.manifests) {
        (Some(media_type), _) => Some(media_type),
        (None, Some(_)) => Some(OCI_INDEX_V1.to_string()),
        (None, None) => None,
    }
}

/// Whether a blob starts with the gzip magic bytes
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}
