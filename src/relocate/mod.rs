//! Relocation driver
//!
//! [`Relocator::save_images`] scans a manifest tree and saves every distinct
//! image into the bundle. [`Relocator::relocate`] later walks that bundle and
//! pushes each archive to a destination registry under a rewritten name.
//!
//! Both stop at the first failure. With `concurrency > 1` transfers run
//! concurrently; the first error drops the remaining futures, which cancels
//! in-flight and pending transfers, and that error is returned. Relocation
//! never returns a partial mapping.

use crate::bundle::{ArchiveFormat, BundleEntry, BundleLayout, SeenSet};
use crate::config::RelocatorConfig;
use crate::error::{RelocatorError, Result};
use crate::image::ImageReference;
use crate::logging::Logger;
use crate::registry::copy::ImageCopier;
use crate::scanner::{ManifestScanner, ScanReport};
use crate::transfer::TransferEngine;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of [`Relocator::save_images`]
#[derive(Debug, Clone)]
pub struct SaveSummary {
    /// Images written to the bundle, in discovery order
    pub saved: Vec<BundleEntry>,
    /// Images left alone because their archive already existed
    pub skipped_existing: usize,
    pub scan: ScanReport,
}

/// One relocated image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocatedImage {
    pub original: ImageReference,
    pub rewritten: ImageReference,
}

/// Old to new reference mapping, in bundle enumeration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelocationResult {
    pub images: Vec<RelocatedImage>,
}

/// Image override in the shape kustomize's `images:` field expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeImage {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl RelocationResult {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn to_kustomize_images(&self) -> Vec<KustomizeImage> {
        self.images
            .iter()
            .map(|image| KustomizeImage {
                name: image.original.repository(),
                new_name: Some(image.rewritten.repository()),
                new_tag: image.rewritten.tag.clone(),
                digest: image.rewritten.digest.clone(),
            })
            .collect()
    }
}

pub struct Relocator {
    layout: BundleLayout,
    engine: TransferEngine,
    scanner: ManifestScanner,
    format: ArchiveFormat,
    concurrency: usize,
    skip_existing: bool,
    output: Logger,
}

impl Relocator {
    pub fn new(layout: BundleLayout, engine: TransferEngine, output: Logger) -> Self {
        Self {
            layout,
            engine,
            scanner: ManifestScanner::new(),
            format: ArchiveFormat::default(),
            concurrency: 1,
            skip_existing: false,
            output,
        }
    }

    /// Relocator for `bundle_dir` with bundle and transfer settings from `config`
    pub fn from_config(
        bundle_dir: impl Into<PathBuf>,
        config: &RelocatorConfig,
        copier: Arc<dyn ImageCopier>,
        output: Logger,
    ) -> Self {
        let engine = TransferEngine::new(copier, config.transfer.copy_options(), output.clone());
        Self::new(BundleLayout::new(bundle_dir), engine, output)
            .with_format(config.bundle.format)
            .with_skip_existing(config.bundle.skip_existing)
            .with_concurrency(config.transfer.concurrency)
    }

    pub fn with_format(mut self, format: ArchiveFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_skip_existing(mut self, skip_existing: bool) -> Self {
        self.skip_existing = skip_existing;
        self
    }

    /// Scan a manifest tree without transferring anything
    pub fn get_images(&self, manifest_dir: &Path) -> Result<ScanReport> {
        self.scanner.scan(manifest_dir)
    }

    /// Save every distinct image referenced under `manifest_dir` into the bundle.
    ///
    /// An unparseable image string aborts the run before any transfer starts.
    /// Each distinct reference is pulled at most once per call.
    pub async fn save_images(&self, manifest_dir: &Path) -> Result<SaveSummary> {
        self.output.section("Saving images");
        let scan = self.scanner.scan(manifest_dir)?;
        for skipped in &scan.skipped {
            self.output.detail(&format!(
                "Skipped {} (document {}): {}",
                skipped.file.display(),
                skipped.index,
                skipped.reason
            ));
        }

        let mut seen = SeenSet::new();
        let mut pending = Vec::new();
        let mut skipped_existing = 0;
        for found in &scan.images {
            let reference = ImageReference::parse(&found.image)?;
            if !seen.insert(&reference) {
                continue;
            }
            let entry = self.layout.entry_for(&reference, self.format);
            if self.skip_existing && entry.archive_path.is_file() {
                self.output
                    .detail(&format!("{} already bundled, skipping", reference));
                skipped_existing += 1;
                continue;
            }
            pending.push(entry);
        }
        self.check_archive_paths(&pending)?;

        self.output.info(&format!(
            "Found {} distinct images, {} to save",
            seen.len(),
            pending.len()
        ));

        let saved = self
            .run_bounded(pending, |entry: BundleEntry| async move {
                self.engine
                    .save(&entry.reference, &entry.archive_path)
                    .await
                    .map(|_| entry)
            })
            .await?;

        self.output.success(&format!(
            "Saved {} images to {}",
            saved.len(),
            self.layout.root().display()
        ));
        Ok(SaveSummary {
            saved,
            skipped_existing,
            scan,
        })
    }

    /// Reject archive paths that would need to be both a file and a directory,
    /// such as `app:1` next to `app/1:2`, before anything is transferred.
    fn check_archive_paths(&self, pending: &[BundleEntry]) -> Result<()> {
        let root = self.layout.root();
        for entry in pending {
            let path = &entry.archive_path;
            if path.is_dir() {
                return Err(path_clash(&entry.reference, path, "is an existing directory"));
            }
            let blocked = path
                .ancestors()
                .skip(1)
                .take_while(|ancestor| *ancestor != root)
                .find(|ancestor| ancestor.is_file());
            if let Some(ancestor) = blocked {
                return Err(path_clash(
                    &entry.reference,
                    path,
                    &format!("is below the existing archive {}", ancestor.display()),
                ));
            }
            if let Some(other) = pending
                .iter()
                .find(|other| other.archive_path != *path && other.archive_path.starts_with(path))
            {
                return Err(path_clash(
                    &entry.reference,
                    path,
                    &format!("is a parent directory of the archive for {}", other.reference),
                ));
            }
        }
        Ok(())
    }

    /// Push every bundled image to `dest_domain/dest_namespace/<basename>`.
    pub async fn relocate(&self, dest_domain: &str, dest_namespace: &str) -> Result<RelocationResult> {
        self.output.section("Relocating images");
        let entries = self.layout.enumerate()?;

        let images = self
            .run_bounded(entries, |entry: Result<BundleEntry>| async move {
                let entry = entry?;
                let rewritten = entry.reference.rewrite(dest_domain, dest_namespace);
                self.engine
                    .push_named(
                        &entry.archive_path,
                        &rewritten.repository(),
                        rewritten.tag.as_deref().unwrap_or_default(),
                        rewritten.digest.as_deref().unwrap_or_default(),
                    )
                    .await?;
                Ok(RelocatedImage {
                    original: entry.reference,
                    rewritten,
                })
            })
            .await?;

        self.output
            .success(&format!("Relocated {} images", images.len()));
        Ok(RelocationResult { images })
    }

    /// Run `op` over `items` with at most `concurrency` in flight.
    ///
    /// Results come back in input order. The first error is returned as soon
    /// as it is observed and the remaining futures are dropped.
    async fn run_bounded<I, T, R, F, Fut>(&self, items: I, op: F) -> Result<Vec<R>>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut results: Vec<(usize, R)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let transfer = op(item);
                async move { transfer.await.map(|result| (index, result)) }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }
}

fn path_clash(reference: &ImageReference, path: &Path, reason: &str) -> RelocatorError {
    RelocatorError::Configuration(format!(
        "archive path {} for {} {}",
        path.display(),
        reference,
        reason
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Direction;
    use crate::registry::copy::CopyOptions;
    use crate::registry::transport::TransportRef;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;

    /// Writes a placeholder archive on save and records every copy
    #[derive(Default)]
    struct FakeCopier {
        copies: Mutex<Vec<(TransportRef, TransportRef)>>,
        fail_push_to: Option<String>,
    }

    #[async_trait]
    impl ImageCopier for FakeCopier {
        async fn copy(
            &self,
            source: &TransportRef,
            destination: &TransportRef,
            _options: &CopyOptions,
        ) -> Result<()> {
            self.copies
                .lock()
                .unwrap()
                .push((source.clone(), destination.clone()));
            match destination {
                TransportRef::DockerArchive(path) => {
                    fs::write(path, source.to_string())?;
                    Ok(())
                }
                TransportRef::Registry(reference) => {
                    if self.fail_push_to.as_deref() == Some(reference.to_string().as_str()) {
                        return Err(RelocatorError::Registry("unauthorized".to_string()));
                    }
                    Ok(())
                }
            }
        }
    }

    fn relocator(bundle: &Path, copier: Arc<FakeCopier>) -> Relocator {
        let config = RelocatorConfig::default();
        Relocator::from_config(bundle, &config, copier, Logger::new_quiet())
    }

    fn write_manifest(dir: &Path, file: &str, images: &[&str]) {
        let containers: String = images
            .iter()
            .map(|image| format!("        - image: {}\n", image))
            .collect();
        fs::write(
            dir.join(file),
            format!("kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n{}", containers),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_save_then_relocate() {
        let manifests = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        write_manifest(manifests.path(), "app.yaml", &["registry.example.com/app:1.2.3"]);

        let copier = Arc::new(FakeCopier::default());
        let relocator = relocator(bundle.path(), copier.clone());

        let summary = relocator.save_images(manifests.path()).await.unwrap();
        assert_eq!(summary.saved.len(), 1);
        assert!(bundle.path().join("docker-archive/app/1.2.3").is_file());

        let result = relocator.relocate("myregistry.io", "myns").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.images[0].original.to_string(), "app:1.2.3");
        assert_eq!(result.images[0].rewritten.to_string(), "myregistry.io/myns/app:1.2.3");

        let copies = copier.copies.lock().unwrap();
        assert_eq!(
            copies.last().unwrap().1.to_string(),
            "docker://myregistry.io/myns/app:1.2.3"
        );
    }

    #[tokio::test]
    async fn test_save_skips_existing_archives_when_asked() {
        let manifests = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        write_manifest(manifests.path(), "a.yaml", &["nginx:1.25", "redis:7"]);

        let existing = bundle.path().join("docker-archive/nginx/1.25");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "old").unwrap();

        let copier = Arc::new(FakeCopier::default());
        let summary = relocator(bundle.path(), copier.clone())
            .with_skip_existing(true)
            .save_images(manifests.path())
            .await
            .unwrap();
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(summary.saved.len(), 1);
        assert_eq!(summary.saved[0].reference.name, "redis");
        assert_eq!(fs::read_to_string(&existing).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_invalid_image_aborts_before_transfers() {
        let manifests = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        write_manifest(manifests.path(), "a.yaml", &["nginx:1.25", "Bad/Image:1"]);

        let copier = Arc::new(FakeCopier::default());
        let err = relocator(bundle.path(), copier.clone())
            .save_images(manifests.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RelocatorError::Parse { .. }));
        assert!(copier.copies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clashing_archive_paths_abort_before_transfers() {
        let manifests = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        write_manifest(manifests.path(), "a.yaml", &["nginx:1.25", "app:1", "app/1:2"]);

        let copier = Arc::new(FakeCopier::default());
        let err = relocator(bundle.path(), copier.clone())
            .save_images(manifests.path())
            .await
            .unwrap_err();
        match &err {
            RelocatorError::Configuration(message) => assert!(message.contains("app/1:2")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(copier.copies.lock().unwrap().is_empty());
        assert!(!bundle.path().join("docker-archive").exists());
    }

    #[tokio::test]
    async fn test_archive_below_an_existing_archive_is_rejected() {
        let manifests = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        write_manifest(manifests.path(), "a.yaml", &["app/1:2"]);

        let existing = bundle.path().join("docker-archive/app/1");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, "old").unwrap();

        let copier = Arc::new(FakeCopier::default());
        let err = relocator(bundle.path(), copier.clone())
            .save_images(manifests.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RelocatorError::Configuration(_)));
        assert!(copier.copies.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&existing).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_relocate_stops_at_first_push_failure() {
        let bundle = tempfile::tempdir().unwrap();
        for name in ["alpha", "beta", "gamma"] {
            let path = bundle.path().join("docker-archive").join(name).join("1");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name).unwrap();
        }

        let copier = Arc::new(FakeCopier {
            fail_push_to: Some("myregistry.io/myns/beta:1".to_string()),
            ..FakeCopier::default()
        });
        let err = relocator(bundle.path(), copier.clone())
            .relocate("myregistry.io", "myns")
            .await
            .unwrap_err();

        match &err {
            RelocatorError::Transfer { direction, .. } => assert_eq!(*direction, Direction::Push),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.failed_image(), Some("myregistry.io/myns/beta:1"));
        let pushed: Vec<String> = copier
            .copies
            .lock()
            .unwrap()
            .iter()
            .map(|(_, dest)| dest.to_string())
            .collect();
        assert_eq!(
            pushed,
            vec![
                "docker://myregistry.io/myns/alpha:1".to_string(),
                "docker://myregistry.io/myns/beta:1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_relocation_keeps_enumeration_order() {
        let bundle = tempfile::tempdir().unwrap();
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            let path = bundle.path().join("docker-archive").join(name).join("v1");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name).unwrap();
        }

        let copier = Arc::new(FakeCopier::default());
        let result = relocator(bundle.path(), copier)
            .with_concurrency(3)
            .relocate("", "mirror")
            .await
            .unwrap();
        let rewritten: Vec<String> = result
            .images
            .iter()
            .map(|image| image.rewritten.to_string())
            .collect();
        assert_eq!(
            rewritten,
            names
                .iter()
                .map(|name| format!("mirror/{}:v1", name))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_kustomize_images() {
        let digest = format!("sha256:{}", "f".repeat(64));
        let result = RelocationResult {
            images: vec![
                RelocatedImage {
                    original: ImageReference::parse("app:1.2.3").unwrap(),
                    rewritten: ImageReference::parse("myregistry.io/myns/app:1.2.3").unwrap(),
                },
                RelocatedImage {
                    original: ImageReference::parse(&format!("db@{}", digest)).unwrap(),
                    rewritten: ImageReference::parse(&format!("myregistry.io/myns/db@{}", digest))
                        .unwrap(),
                },
            ],
        };

        let images = result.to_kustomize_images();
        assert_eq!(images[0].name, "app");
        assert_eq!(images[0].new_name.as_deref(), Some("myregistry.io/myns/app"));
        assert_eq!(images[0].new_tag.as_deref(), Some("1.2.3"));
        assert_eq!(images[1].digest.as_deref(), Some(digest.as_str()));

        let json = serde_json::to_value(&images[0]).unwrap();
        assert_eq!(json["newName"], "myregistry.io/myns/app");
        assert!(json.get("digest").is_none());
    }
}
