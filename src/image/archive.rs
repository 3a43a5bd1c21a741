//! docker-archive tarball reading and writing
//!
//! The layout matches what `docker save` produces: a `manifest.json` listing
//! one image with its config and layer members, blobs stored under
//! `blobs/<algorithm>/<hex>`. When an image came from a registry the
//! registry's own manifest is kept verbatim in `source-manifest.json` so a
//! later push can reproduce the exact manifest digest.
//!
//! Blobs never sit in memory as a whole. While an image moves between a
//! registry and an archive its blobs are staged as files in a hidden scratch
//! directory that is removed when the image is dropped.

use crate::error::{RelocatorError, Result};
use crate::image::digest::{DigestUtils, DigestWriter};
use crate::image::manifest::{
    DOCKER_CONFIG, DOCKER_LAYER_GZIP, Descriptor, ImageManifest, is_gzipped,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tempfile::TempDir;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SOURCE_MANIFEST_FILE: &str = "source-manifest.json";

/// Prefix of in-progress archive files and staging directories; bundle
/// enumeration skips them.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// One image entry of a docker-archive `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

/// A blob held in a staging file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlob {
    pub digest: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Create a hidden scratch directory for one image's blobs.
///
/// With `near` the directory is created inside it, keeping staged blobs on
/// the same filesystem as the archive being written.
pub fn staging_dir(near: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(PARTIAL_PREFIX);
    match near {
        Some(dir) => builder.tempdir_in(dir).map_err(|e| RelocatorError::path(dir, e)),
        None => Ok(builder.tempdir()?),
    }
}

/// Registry manifest stored alongside the image
#[derive(Debug, Clone)]
pub struct SourceManifest {
    pub bytes: Vec<u8>,
    pub manifest: ImageManifest,
}

/// An image whose blobs are staged on disk
#[derive(Debug)]
pub struct StagedImage {
    pub config: StagedBlob,
    pub layers: Vec<StagedBlob>,
    pub repo_tags: Vec<String>,
    pub source_manifest: Option<SourceManifest>,
    staging: TempDir,
}

/// Blobs and manifest ready for upload, config blob first
#[derive(Debug)]
pub struct UploadPlan {
    pub manifest: Vec<u8>,
    pub media_type: String,
    pub blobs: Vec<StagedBlob>,
    _staging: TempDir,
}

impl UploadPlan {
    pub fn manifest_digest(&self) -> String {
        DigestUtils::compute_docker_digest(&self.manifest)
    }
}

impl StagedImage {
    /// Take ownership of blobs staged under `staging`
    pub fn new(
        staging: TempDir,
        config: StagedBlob,
        layers: Vec<StagedBlob>,
        repo_tags: Vec<String>,
        source_manifest: Option<SourceManifest>,
    ) -> Self {
        Self {
            config,
            layers,
            repo_tags,
            source_manifest,
            staging,
        }
    }

    /// Write the image as a docker-archive at `dest`.
    ///
    /// The tarball is assembled in a temporary file next to `dest` and renamed
    /// into place, so `dest` either holds a complete archive or is untouched.
    pub fn write_to(&self, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| RelocatorError::Archive(format!("no parent directory for {}", dest.display())))?;
        let mut temp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| RelocatorError::path(parent, e))?;

        {
            let mut builder = Builder::new(BufWriter::new(temp.as_file_mut()));
            let mut written = HashSet::new();

            let config_member = DigestUtils::blob_path(&self.config.digest)?;
            append_blob(&mut builder, &config_member, &self.config)?;
            written.insert(config_member.clone());

            let mut layer_members = Vec::with_capacity(self.layers.len());
            for layer in &self.layers {
                let member = DigestUtils::blob_path(&layer.digest)?;
                if written.insert(member.clone()) {
                    append_blob(&mut builder, &member, layer)?;
                }
                layer_members.push(member);
            }

            let entries = vec![ArchiveManifestEntry {
                config: config_member,
                repo_tags: (!self.repo_tags.is_empty()).then(|| self.repo_tags.clone()),
                layers: layer_members,
            }];
            append_member(&mut builder, MANIFEST_FILE, &serde_json::to_vec(&entries)?)?;

            if let Some(source) = &self.source_manifest {
                append_member(&mut builder, SOURCE_MANIFEST_FILE, &source.bytes)?;
            }

            builder.into_inner()?.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(dest)
            .map_err(|e| RelocatorError::path(dest, e.error))?;
        Ok(())
    }

    /// Read a single-image docker-archive, staging its members as files
    pub fn read_from(path: &Path) -> Result<Self> {
        let staging = staging_dir(None)?;
        let file = File::open(path).map_err(|e| RelocatorError::path(path, e))?;
        let mut archive = Archive::new(BufReader::new(file));
        archive.set_ignore_zeros(true);

        let mut documents: HashMap<String, Vec<u8>> = HashMap::new();
        let mut members: HashMap<String, StagedBlob> = HashMap::new();
        let mut links: HashMap<String, String> = HashMap::new();

        let entries = archive
            .entries()
            .map_err(|e| RelocatorError::Archive(format!("Failed to read tar entries: {}", e)))?;
        for (index, entry) in entries.enumerate() {
            let mut entry = entry
                .map_err(|e| RelocatorError::Archive(format!("Failed to read tar entry: {}", e)))?;
            let member_path = normalize_member(&entry.path()?);

            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous
                    if member_path == MANIFEST_FILE || member_path == SOURCE_MANIFEST_FILE =>
                {
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut data)?;
                    documents.insert(member_path, data);
                }
                EntryType::Regular | EntryType::Continuous => {
                    let staged = staging.path().join(format!("member-{}", index));
                    members.insert(member_path, stage_stream(&mut entry, &staged)?);
                }
                EntryType::Symlink | EntryType::Link => {
                    if let Some(target) = entry.link_name()? {
                        let target = if entry.header().entry_type() == EntryType::Symlink {
                            let base = Path::new(&member_path).parent().unwrap_or(Path::new(""));
                            normalize_member(&base.join(target))
                        } else {
                            normalize_member(&target)
                        };
                        links.insert(member_path, target);
                    }
                }
                _ => {}
            }
        }

        let lookup = |name: &str| -> Result<StagedBlob> {
            let name = normalize_member(Path::new(name));
            let resolved = links.get(&name).unwrap_or(&name);
            members.get(resolved).cloned().ok_or_else(|| {
                RelocatorError::Archive(format!("{} not found in {}", name, path.display()))
            })
        };

        let manifest_bytes = documents.get(MANIFEST_FILE).ok_or_else(|| {
            RelocatorError::Archive(format!("{} not found in {}", MANIFEST_FILE, path.display()))
        })?;
        let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(manifest_bytes)?;
        let entry = match entries.as_slice() {
            [entry] => entry,
            [] => {
                return Err(RelocatorError::Archive(format!(
                    "{} lists no images",
                    path.display()
                )));
            }
            _ => {
                return Err(RelocatorError::Archive(format!(
                    "{} contains {} images; expected exactly one",
                    path.display(),
                    entries.len()
                )));
            }
        };

        let config = lookup(&entry.config)?;
        let layers = entry
            .layers
            .iter()
            .map(|layer| lookup(layer))
            .collect::<Result<Vec<_>>>()?;
        let repo_tags = entry.repo_tags.clone().unwrap_or_default();

        let source_manifest = match documents.remove(SOURCE_MANIFEST_FILE) {
            Some(bytes) => match ImageManifest::from_slice(&bytes, None) {
                Ok(manifest) => Some(SourceManifest { bytes, manifest }),
                Err(e) => {
                    tracing::warn!(archive = %path.display(), error = %e, "ignoring unreadable source manifest");
                    None
                }
            },
            None => None,
        };

        Ok(StagedImage::new(staging, config, layers, repo_tags, source_manifest))
    }

    /// Decide what to upload for this image.
    ///
    /// The stored registry manifest is reused verbatim when its descriptors
    /// match the staged blobs. Otherwise a schema 2 manifest is composed,
    /// gzipping any uncompressed layers.
    pub fn into_upload_plan(self) -> Result<UploadPlan> {
        let StagedImage {
            config,
            layers,
            source_manifest,
            staging,
            ..
        } = self;

        if let Some(source) = source_manifest {
            if matches_source(&source.manifest, &config, &layers) {
                tracing::debug!("reusing stored registry manifest");
                let media_type = source.manifest.content_type().to_string();
                let mut blobs = Vec::with_capacity(layers.len() + 1);
                blobs.push(config);
                blobs.extend(layers);
                return Ok(UploadPlan {
                    manifest: source.bytes,
                    media_type,
                    blobs,
                    _staging: staging,
                });
            }
            tracing::warn!("stored registry manifest does not match archive contents, composing a new one");
        }

        let config_descriptor = Descriptor::new(DOCKER_CONFIG, config.digest.clone(), config.size);
        let mut blobs = Vec::with_capacity(layers.len() + 1);
        blobs.push(config);
        let mut descriptors = Vec::with_capacity(layers.len());
        for (index, layer) in layers.into_iter().enumerate() {
            let layer = if is_gzipped_file(&layer.path)? {
                layer
            } else {
                gzip_blob(&layer, &staging.path().join(format!("gzip-{}", index)))?
            };
            descriptors.push(Descriptor::new(DOCKER_LAYER_GZIP, layer.digest.clone(), layer.size));
            blobs.push(layer);
        }

        let manifest = ImageManifest::schema2(config_descriptor, descriptors);
        Ok(UploadPlan {
            manifest: serde_json::to_vec(&manifest)?,
            media_type: manifest.content_type().to_string(),
            blobs,
            _staging: staging,
        })
    }
}

fn matches_source(manifest: &ImageManifest, config: &StagedBlob, layers: &[StagedBlob]) -> bool {
    manifest.config.digest == config.digest
        && manifest.layers.len() == layers.len()
        && manifest
            .layers
            .iter()
            .zip(layers)
            .all(|(descriptor, layer)| descriptor.digest == layer.digest)
}

/// Copy `reader` into a new file at `dest`, hashing it on the way
fn stage_stream<R: Read>(reader: &mut R, dest: &Path) -> Result<StagedBlob> {
    let file = File::create(dest).map_err(|e| RelocatorError::path(dest, e))?;
    let mut writer = DigestWriter::new(BufWriter::new(file));
    io::copy(reader, &mut writer)?;
    let (mut inner, digest, size) = writer.finish();
    inner.flush()?;
    Ok(StagedBlob {
        digest,
        size,
        path: dest.to_path_buf(),
    })
}

fn gzip_blob(blob: &StagedBlob, dest: &Path) -> Result<StagedBlob> {
    let mut source = BufReader::new(File::open(&blob.path).map_err(|e| RelocatorError::path(&blob.path, e))?);
    let file = File::create(dest).map_err(|e| RelocatorError::path(dest, e))?;
    let mut encoder = GzEncoder::new(DigestWriter::new(BufWriter::new(file)), Compression::default());
    io::copy(&mut source, &mut encoder)?;
    let (mut inner, digest, size) = encoder.finish()?.finish();
    inner.flush()?;
    Ok(StagedBlob {
        digest,
        size,
        path: dest.to_path_buf(),
    })
}

fn is_gzipped_file(path: &Path) -> Result<bool> {
    let mut magic = Vec::with_capacity(2);
    File::open(path)
        .map_err(|e| RelocatorError::path(path, e))?
        .take(2)
        .read_to_end(&mut magic)?;
    Ok(is_gzipped(&magic))
}

fn member_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(EntryType::Regular);
    header
}

fn append_member<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    builder.append_data(&mut member_header(data.len() as u64), path, data)?;
    Ok(())
}

fn append_blob<W: Write>(builder: &mut Builder<W>, path: &str, blob: &StagedBlob) -> Result<()> {
    let file = File::open(&blob.path).map_err(|e| RelocatorError::path(&blob.path, e))?;
    builder.append_data(&mut member_header(blob.size), path, BufReader::new(file))?;
    Ok(())
}

/// Collapse `.` and `..` so member names compare equal regardless of spelling
fn normalize_member(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.iter().collect::<PathBuf>().to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::manifest::{DOCKER_LAYER_TAR, DOCKER_MANIFEST_V2};
    use flate2::read::GzDecoder;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn stage(staging: &TempDir, name: &str, data: &[u8]) -> StagedBlob {
        let path = staging.path().join(name);
        std::fs::write(&path, data).unwrap();
        StagedBlob {
            digest: DigestUtils::compute_docker_digest(data),
            size: data.len() as u64,
            path,
        }
    }

    fn pulled_image() -> StagedImage {
        let staging = staging_dir(None).unwrap();
        let config = stage(&staging, "config", br#"{"architecture":"amd64","os":"linux"}"#);
        let layer = stage(&staging, "layer", &gzip_bytes(b"layer contents"));
        let manifest = ImageManifest::schema2(
            Descriptor::new(DOCKER_CONFIG, config.digest.clone(), config.size),
            vec![Descriptor::new(DOCKER_LAYER_GZIP, layer.digest.clone(), layer.size)],
        );
        let bytes = serde_json::to_vec_pretty(&manifest).unwrap();
        StagedImage::new(
            staging,
            config,
            vec![layer],
            vec!["app:1.2.3".to_string()],
            Some(SourceManifest { bytes, manifest }),
        )
    }

    #[test]
    fn test_archive_preserves_registry_manifest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1.2.3");
        let image = pulled_image();
        let original_manifest = image.source_manifest.as_ref().unwrap().bytes.clone();

        image.write_to(&dest).unwrap();
        let read = StagedImage::read_from(&dest).unwrap();
        assert_eq!(read.repo_tags, vec!["app:1.2.3".to_string()]);
        assert_eq!(read.layers[0].digest, image.layers[0].digest);
        assert_eq!(
            std::fs::read(&read.layers[0].path).unwrap(),
            std::fs::read(&image.layers[0].path).unwrap()
        );

        let plan = read.into_upload_plan().unwrap();
        assert_eq!(plan.manifest, original_manifest);
        assert_eq!(plan.media_type, DOCKER_MANIFEST_V2);
        assert_eq!(plan.blobs.len(), 2);
        assert!(plan.blobs.iter().all(|blob| blob.path.is_file()));
        assert_eq!(
            plan.manifest_digest(),
            DigestUtils::compute_docker_digest(&original_manifest)
        );
    }

    #[test]
    fn test_staged_members_are_removed_with_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("latest");
        pulled_image().write_to(&dest).unwrap();

        let read = StagedImage::read_from(&dest).unwrap();
        let layer_path = read.layers[0].path.clone();
        assert_eq!(std::fs::metadata(&layer_path).unwrap().len(), read.layers[0].size);
        drop(read);
        assert!(!layer_path.exists());
    }

    #[test]
    fn test_write_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        pulled_image().write_to(&dir.path().join("latest")).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["latest".to_string()]);
    }

    #[test]
    fn test_composed_manifest_gzips_plain_layers() {
        let staging = staging_dir(None).unwrap();
        let config = stage(&staging, "config", b"{}");
        let layer = stage(&staging, "layer", b"uncompressed tar bytes");
        let image = StagedImage::new(staging, config, vec![layer], Vec::new(), None);

        let plan = image.into_upload_plan().unwrap();
        let manifest: ImageManifest = serde_json::from_slice(&plan.manifest).unwrap();
        assert_eq!(manifest.layers[0].media_type, DOCKER_LAYER_GZIP);
        assert_ne!(manifest.layers[0].media_type, DOCKER_LAYER_TAR);

        let layer = &plan.blobs[1];
        assert_eq!(layer.digest, manifest.layers[0].digest);
        assert_eq!(layer.size, manifest.layers[0].size);
        let compressed = std::fs::read(&layer.path).unwrap();
        assert_eq!(DigestUtils::compute_docker_digest(&compressed), layer.digest);
        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"uncompressed tar bytes");
    }

    #[test]
    fn test_read_follows_symlinked_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.tar");
        let mut builder = Builder::new(File::create(&path).unwrap());
        let entries = r#"[{"Config":"config.json","RepoTags":["app:1"],"Layers":["abc/layer.tar","def/layer.tar"]}]"#;
        append_member(&mut builder, "config.json", b"{}").unwrap();
        append_member(&mut builder, "abc/layer.tar", b"shared layer").unwrap();
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        builder.append_link(&mut link, "def/layer.tar", "../abc/layer.tar").unwrap();
        append_member(&mut builder, MANIFEST_FILE, entries.as_bytes()).unwrap();
        builder.finish().unwrap();

        let image = StagedImage::read_from(&path).unwrap();
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0], image.layers[1]);
        assert_eq!(image.layers[0].digest, DigestUtils::compute_docker_digest(b"shared layer"));
        assert!(image.source_manifest.is_none());
    }

    #[test]
    fn test_read_rejects_multi_image_archives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.tar");
        let mut builder = Builder::new(File::create(&path).unwrap());
        let entries = r#"[{"Config":"a.json","RepoTags":null,"Layers":[]},{"Config":"b.json","RepoTags":null,"Layers":[]}]"#;
        append_member(&mut builder, MANIFEST_FILE, entries.as_bytes()).unwrap();
        builder.finish().unwrap();

        let err = StagedImage::read_from(&path).unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn test_normalize_member() {
        assert_eq!(normalize_member(Path::new("./manifest.json")), "manifest.json");
        assert_eq!(normalize_member(Path::new("abc/../def/layer.tar")), "def/layer.tar");
    }
}
