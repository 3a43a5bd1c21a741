//! Bundle layout
//!
//! A bundle is a directory holding one archive file per image at
//! `<root>/<format>/<name...>/<tag>` or `<root>/<format>/<name...>/<alg>/<hex>`.
//! The path is derived only from the reference's name and tag or digest, so
//! the registry domain is not part of the key: `a.com/x:1` and `b.com/x:1`
//! land on the same file.

use crate::error::{RelocatorError, Result};
use crate::image::ImageReference;
use crate::image::archive::PARTIAL_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::vec;

/// On-disk image representation, also the first directory level of a bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    #[default]
    DockerArchive,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 1] = [ArchiveFormat::DockerArchive];

    /// Directory name and transport prefix for this format
    pub fn prefix(&self) -> &'static str {
        match self {
            ArchiveFormat::DockerArchive => "docker-archive",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for ArchiveFormat {
    type Err = RelocatorError;

    fn from_str(s: &str) -> Result<Self> {
        ArchiveFormat::ALL
            .into_iter()
            .find(|format| format.prefix() == s)
            .ok_or_else(|| RelocatorError::Configuration(format!("unknown archive format {:?}", s)))
    }
}

/// One image persisted in a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub reference: ImageReference,
    pub archive_path: PathBuf,
    pub format: ArchiveFormat,
}

/// Addressing scheme for a bundle directory
#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive path for `reference` in `format`
    pub fn path_for(&self, reference: &ImageReference, format: ArchiveFormat) -> PathBuf {
        let mut path = self.root.join(format.prefix());
        for segment in reference.archive_path_segments() {
            // Multi-component names become nested directories.
            path.extend(segment.split('/'));
        }
        path
    }

    pub fn entry_for(&self, reference: &ImageReference, format: ArchiveFormat) -> BundleEntry {
        BundleEntry {
            archive_path: self.path_for(reference, format),
            reference: reference.clone(),
            format,
        }
    }

    /// Lazily walk every archive in the bundle.
    ///
    /// Format directories are listed up front; the rest of the tree is read as
    /// the iterator advances. Children are visited in sorted order and hidden
    /// files (including partially written archives) are skipped, so walking
    /// an unchanged bundle twice yields the same entries in the same order.
    pub fn enumerate(&self) -> Result<BundleEntries> {
        let mut formats = Vec::new();
        for (name, path) in read_children(&self.root)? {
            match name.parse::<ArchiveFormat>() {
                Ok(format) if path.is_dir() => formats.push((format, path)),
                _ => {
                    tracing::warn!(path = %path.display(), "ignoring unknown entry in bundle root");
                }
            }
        }

        Ok(BundleEntries {
            formats: formats.into_iter(),
            stack: Vec::new(),
        })
    }
}

struct Frame {
    format: ArchiveFormat,
    segments: Vec<String>,
    children: vec::IntoIter<(String, PathBuf)>,
}

/// Iterator over the archives of a bundle, see [`BundleLayout::enumerate`]
pub struct BundleEntries {
    formats: vec::IntoIter<(ArchiveFormat, PathBuf)>,
    stack: Vec<Frame>,
}

impl Iterator for BundleEntries {
    type Item = Result<BundleEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                let (format, dir) = self.formats.next()?;
                match read_children(&dir) {
                    Ok(children) => self.stack.push(Frame {
                        format,
                        segments: Vec::new(),
                        children: children.into_iter(),
                    }),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            };

            let Some((name, path)) = frame.children.next() else {
                self.stack.pop();
                continue;
            };

            let format = frame.format;
            let mut segments = frame.segments.clone();
            segments.push(name);

            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => return Some(Err(RelocatorError::path(path, e))),
            };

            if metadata.is_dir() {
                match read_children(&path) {
                    Ok(children) => self.stack.push(Frame {
                        format,
                        segments,
                        children: children.into_iter(),
                    }),
                    Err(e) => return Some(Err(e)),
                }
            } else if metadata.is_file() {
                return Some(
                    ImageReference::from_path_segments(&segments).map(|reference| BundleEntry {
                        reference,
                        archive_path: path,
                        format,
                    }),
                );
            }
        }
    }
}

/// Visible children of `dir` by name, sorted
fn read_children(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| RelocatorError::path(dir, e))? {
        let entry = entry.map_err(|e| RelocatorError::path(dir, e))?;
        let path = entry.path();
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(path = %path.display(), "skipping non UTF-8 bundle path");
            continue;
        };
        if name.starts_with('.') {
            if name.starts_with(PARTIAL_PREFIX) {
                tracing::debug!(path = %path.display(), "skipping partially written archive");
            }
            continue;
        }
        children.push((name, path));
    }
    children.sort();
    Ok(children)
}

/// Canonical references already handled during one save run.
///
/// Keys are the full `domain/name:tag` or `domain/name@digest` form, so two
/// references that differ only in domain are distinct here even though they
/// share an archive path.
#[derive(Debug, Default, Clone)]
pub struct SeenSet {
    seen: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reference`; returns false when it was already present
    pub fn insert(&mut self, reference: &ImageReference) -> bool {
        self.seen.insert(reference.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn reference(raw: &str) -> ImageReference {
        ImageReference::parse(raw).unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"archive").unwrap();
    }

    #[test]
    fn test_path_for_tagged_reference() {
        let layout = BundleLayout::new("/bundle");
        assert_eq!(
            layout.path_for(&reference("registry.example.com/app:1.2.3"), ArchiveFormat::DockerArchive),
            PathBuf::from("/bundle/docker-archive/app/1.2.3")
        );
        assert_eq!(
            layout.path_for(&reference("quay.io/org/team/tool"), ArchiveFormat::DockerArchive),
            PathBuf::from("/bundle/docker-archive/org/team/tool/latest")
        );
    }

    #[test]
    fn test_path_for_digest_reference() {
        let layout = BundleLayout::new("/bundle");
        let raw = format!("app@sha256:{}", HEX);
        assert_eq!(
            layout.path_for(&reference(&raw), ArchiveFormat::DockerArchive),
            PathBuf::from(format!("/bundle/docker-archive/app/sha256/{}", HEX))
        );
    }

    #[test]
    fn test_domains_collide_on_one_path() {
        let layout = BundleLayout::new("/bundle");
        let a = layout.path_for(&reference("a.com/x:1"), ArchiveFormat::DockerArchive);
        let b = layout.path_for(&reference("b.com/x:1"), ArchiveFormat::DockerArchive);
        assert_eq!(a, b);
    }

    #[test]
    fn test_archive_format_parse() {
        assert_eq!(
            "docker-archive".parse::<ArchiveFormat>().unwrap(),
            ArchiveFormat::DockerArchive
        );
        assert!("oci-archive".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_enumerate_recovers_saved_references() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(dir.path());
        let saved = [
            reference("registry.example.com/app:1.2.3"),
            reference("quay.io/org/team/tool:v2"),
            reference(&format!("ghcr.io/org/db@sha256:{}", HEX)),
        ];
        for r in &saved {
            touch(&layout.path_for(r, ArchiveFormat::DockerArchive));
        }

        let entries = layout
            .enumerate()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let names: Vec<String> = entries.iter().map(|e| e.reference.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "app:1.2.3".to_string(),
                format!("org/db@sha256:{}", HEX),
                "org/team/tool:v2".to_string(),
            ]
        );
        for entry in &entries {
            assert_eq!(entry.archive_path, layout.path_for(&entry.reference, entry.format));
        }
    }

    #[test]
    fn test_enumerate_is_restartable_and_skips_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(dir.path());
        touch(&layout.path_for(&reference("nginx:1.25"), ArchiveFormat::DockerArchive));
        touch(&dir.path().join("docker-archive/nginx/.partial-abc123"));
        touch(&dir.path().join("notes.txt"));

        let first: Vec<_> = layout.enumerate().unwrap().map(|e| e.unwrap()).collect();
        let second: Vec<_> = layout.enumerate().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_enumerate_reports_unaddressable_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("docker-archive/stray"));
        let layout = BundleLayout::new(dir.path());
        let results: Vec<_> = layout.enumerate().unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_enumerate_missing_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(dir.path().join("missing"));
        assert!(layout.enumerate().is_err());
    }

    #[test]
    fn test_seen_set_distinguishes_domains() {
        let mut seen = SeenSet::new();
        assert!(seen.insert(&reference("a.com/x:1")));
        assert!(!seen.insert(&reference("a.com/x:1")));
        assert!(seen.insert(&reference("b.com/x:1")));
        assert_eq!(seen.len(), 2);
    }
}
