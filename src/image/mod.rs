//! Image model: references, digests, registry manifests, and docker-archive
//! tarballs.
//!
//! [`ImageReference`] is the value everything else keys on. The remaining
//! submodules describe image content as it moves between a registry and a
//! bundle on disk.

pub mod archive;
pub mod digest;
pub mod manifest;
pub mod reference;

pub use archive::{SourceManifest, StagedBlob, StagedImage, UploadPlan, staging_dir};
pub use digest::{BlobHasher, DigestUtils, DigestWriter};
pub use manifest::{Descriptor, ImageManifest, is_gzipped};
pub use reference::{DEFAULT_TAG, ImageReference};
