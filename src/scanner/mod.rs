//! Manifest scanning
//!
//! Walks a directory of deployment manifests and pulls out every container
//! image named in a pod template. Only the
//! `spec.template.spec.containers[].image` shape is read; anything else is
//! recorded as a skipped document instead of failing the walk. Unreadable
//! files and directories do fail it.

use crate::error::{RelocatorError, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// An image string and the manifest file it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredImage {
    pub image: String,
    pub file: PathBuf,
}

/// Why a document contributed no images
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not valid YAML
    Malformed(String),
    /// File content is not UTF-8 text
    NotUtf8,
    /// Valid YAML without a pod template
    NoPodTemplate { kind: Option<String> },
    /// A container entry in a pod template has no image
    ContainerWithoutImage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(msg) => write!(f, "malformed YAML: {}", msg),
            SkipReason::NotUtf8 => f.write_str("not UTF-8 text"),
            SkipReason::NoPodTemplate { kind: Some(kind) } => {
                write!(f, "{} has no pod template", kind)
            }
            SkipReason::NoPodTemplate { kind: None } => f.write_str("no pod template"),
            SkipReason::ContainerWithoutImage => f.write_str("container without image"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDocument {
    pub file: PathBuf,
    /// Zero-based position of the document within its file
    pub index: usize,
    pub reason: SkipReason,
}

/// Everything one walk found, in file order
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub images: Vec<DiscoveredImage>,
    pub skipped: Vec<SkippedDocument>,
}

impl ScanReport {
    /// Distinct image strings
    pub fn image_set(&self) -> BTreeSet<String> {
        self.images.iter().map(|found| found.image.clone()).collect()
    }

    /// Distinct image strings, sorted
    pub fn unique_images(&self) -> Vec<String> {
        self.image_set().into_iter().collect()
    }
}

#[derive(Debug, Deserialize)]
struct PodShaped {
    spec: Option<WorkloadSpec>,
}

#[derive(Debug, Deserialize)]
struct WorkloadSpec {
    template: Option<PodTemplate>,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: Option<PodSpec>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    image: Option<String>,
}

/// Scanner for trees of manifest files
#[derive(Debug, Default, Clone)]
pub struct ManifestScanner;

impl ManifestScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scan every regular file under `root`.
    ///
    /// `root` may also be a single file. Files are visited in sorted path
    /// order, so two scans of an unchanged tree produce identical reports.
    pub fn scan(&self, root: &Path) -> Result<ScanReport> {
        let mut files = Vec::new();
        let metadata = fs::metadata(root).map_err(|e| RelocatorError::path(root, e))?;
        if metadata.is_dir() {
            collect_files(root, &mut files)?;
        } else {
            files.push(root.to_path_buf());
        }

        let mut report = ScanReport::default();
        for file in files {
            self.scan_file(&file, &mut report)?;
        }

        tracing::debug!(
            root = %root.display(),
            images = report.images.len(),
            skipped = report.skipped.len(),
            "manifest scan finished"
        );
        Ok(report)
    }

    /// Distinct image strings under `root`, sorted
    pub fn unique_images(&self, root: &Path) -> Result<Vec<String>> {
        Ok(self.scan(root)?.unique_images())
    }

    fn scan_file(&self, file: &Path, report: &mut ScanReport) -> Result<()> {
        let bytes = fs::read(file).map_err(|e| RelocatorError::path(file, e))?;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                skip(report, file, 0, SkipReason::NotUtf8);
                return Ok(());
            }
        };

        for (index, document) in split_documents(&content).into_iter().enumerate() {
            match extract_images(document) {
                Ok(Extracted { images, missing_image }) => {
                    if missing_image {
                        skip(report, file, index, SkipReason::ContainerWithoutImage);
                    }
                    report.images.extend(images.into_iter().map(|image| DiscoveredImage {
                        image,
                        file: file.to_path_buf(),
                    }));
                }
                Err(Some(reason)) => skip(report, file, index, reason),
                Err(None) => {}
            }
        }
        Ok(())
    }
}

fn skip(report: &mut ScanReport, file: &Path, index: usize, reason: SkipReason) {
    tracing::debug!(file = %file.display(), index, %reason, "skipping manifest document");
    report.skipped.push(SkippedDocument {
        file: file.to_path_buf(),
        index,
        reason,
    });
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| RelocatorError::path(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| RelocatorError::path(dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| RelocatorError::path(&path, e))?;

        if file_type.is_dir() {
            collect_files(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        } else if file_type.is_symlink() {
            // Linked files are read; linked directories are not followed.
            let target = fs::metadata(&path).map_err(|e| RelocatorError::path(&path, e))?;
            if target.is_file() {
                files.push(path);
            } else {
                tracing::debug!(path = %path.display(), "not following directory symlink");
            }
        }
    }
    Ok(())
}

/// Split multi-document content on lines consisting of `---`
fn split_documents(content: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.trim_end() == "---" {
            documents.push(&content[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    documents.push(&content[start..]);
    documents
}

struct Extracted {
    images: Vec<String>,
    missing_image: bool,
}

/// Images of one document. `Err(None)` marks an empty document.
fn extract_images(document: &str) -> std::result::Result<Extracted, Option<SkipReason>> {
    let value: serde_yaml::Value = serde_yaml::from_str(document)
        .map_err(|e| Some(SkipReason::Malformed(e.to_string())))?;
    if value.is_null() {
        return Err(None);
    }

    let kind = value
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string);
    let no_template = || Some(SkipReason::NoPodTemplate { kind: kind.clone() });

    let shaped: PodShaped = serde_yaml::from_value(value).map_err(|_| no_template())?;
    let pod_spec = shaped
        .spec
        .and_then(|spec| spec.template)
        .and_then(|template| template.spec)
        .ok_or_else(no_template)?;

    let mut missing_image = false;
    let images = pod_spec
        .containers
        .into_iter()
        .filter_map(|container| match container.image {
            Some(image) if !image.trim().is_empty() => Some(image.trim().to_string()),
            _ => {
                missing_image = true;
                None
            }
        })
        .collect();

    Ok(Extracted {
        images,
        missing_image,
    })
}
