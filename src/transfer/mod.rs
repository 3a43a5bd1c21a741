//! Transfer engine
//!
//! Saves registry images into bundle archive paths and pushes bundled
//! archives to registries through an [`ImageCopier`]. Each call is one
//! attempt with no retries; failures come back as
//! [`RelocatorError::Transfer`] naming the image and direction.

use crate::error::{Direction, RelocatorError, Result};
use crate::image::ImageReference;
use crate::logging::Logger;
use crate::registry::copy::{CopyOptions, ImageCopier};
use crate::registry::transport::TransportRef;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::DirBuilder;

#[derive(Clone)]
pub struct TransferEngine {
    copier: Arc<dyn ImageCopier>,
    options: CopyOptions,
    output: Logger,
}

impl TransferEngine {
    pub fn new(copier: Arc<dyn ImageCopier>, options: CopyOptions, output: Logger) -> Self {
        Self {
            copier,
            options,
            output,
        }
    }

    /// Pull `reference` into a docker-archive at `dest_path`, creating parent directories
    pub async fn save(&self, reference: &ImageReference, dest_path: &Path) -> Result<()> {
        self.output
            .step(&format!("Saving {} to {}", reference, dest_path.display()));

        let result = async {
            if let Some(parent) = dest_path.parent() {
                create_dirs(parent).await?;
            }
            self.copier
                .copy(
                    &TransportRef::registry(reference.clone()),
                    &TransportRef::docker_archive(dest_path),
                    &self.options,
                )
                .await
        }
        .await;

        result.map_err(|e| RelocatorError::transfer(reference, Direction::Pull, e))
    }

    /// Push the archive at `src_path` to the registry location `dest`
    pub async fn push(&self, src_path: &Path, dest: &ImageReference) -> Result<()> {
        self.output
            .step(&format!("Pushing {} to {}", src_path.display(), dest));

        self.copier
            .copy(
                &TransportRef::docker_archive(src_path),
                &TransportRef::registry(dest.clone()),
                &self.options,
            )
            .await
            .map_err(|e| RelocatorError::transfer(dest, Direction::Push, e))
    }

    /// Push to `dest_name:dest_tag`, or `dest_name@dest_digest` when the tag is empty
    pub async fn push_named(
        &self,
        src_path: &Path,
        dest_name: &str,
        dest_tag: &str,
        dest_digest: &str,
    ) -> Result<()> {
        let raw = if !dest_tag.is_empty() {
            format!("{}:{}", dest_name, dest_tag)
        } else if !dest_digest.is_empty() {
            format!("{}@{}", dest_name, dest_digest)
        } else {
            dest_name.to_string()
        };
        let dest = ImageReference::parse(&raw)?;
        self.push(src_path, &dest).await
    }
}

#[cfg(unix)]
async fn create_dirs(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .await
        .map_err(|e| RelocatorError::path(path, e))
}

#[cfg(not(unix))]
async fn create_dirs(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .create(path)
        .await
        .map_err(|e| RelocatorError::path(path, e))
}
