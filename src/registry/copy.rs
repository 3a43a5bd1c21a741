//! Image copy capability
//!
//! [`ImageCopier`] is the seam between relocation logic and the bytes on the
//! wire. [`DistributionCopier`] implements it over the registry API and
//! docker-archive tarballs. Every copy is checked against a [`TrustPolicy`]
//! first, and a registry tag is written only after all of the image's blobs
//! are present, so a failed copy never publishes a partial image.

use crate::config::{AuthConfig, TransferConfig};
use crate::error::{RelocatorError, Result};
use crate::image::digest::DigestUtils;
use crate::image::{
    ImageManifest, ImageReference, SourceManifest, StagedBlob, StagedImage, UploadPlan, staging_dir,
};
use crate::registry::client::RegistryClient;
use crate::registry::transport::TransportRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Which copy sources are acceptable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TrustPolicy {
    /// Accept every source without signature verification
    #[default]
    InsecureAcceptAnything,
    /// Refuse every source
    Reject,
    /// Accept registry sources on the listed hosts and local archives
    TrustedRegistries { registries: Vec<String> },
}

impl TrustPolicy {
    pub fn check(&self, source: &TransportRef) -> Result<()> {
        match (self, source) {
            (TrustPolicy::InsecureAcceptAnything, _) => Ok(()),
            (TrustPolicy::Reject, _) => Err(RelocatorError::PolicyRejected(format!(
                "{}: policy rejects all sources",
                source
            ))),
            (TrustPolicy::TrustedRegistries { .. }, TransportRef::DockerArchive(_)) => Ok(()),
            (TrustPolicy::TrustedRegistries { registries }, TransportRef::Registry(reference)) => {
                let domain = reference.domain.as_deref().unwrap_or(DOCKER_HUB_DOMAIN);
                if registries.iter().any(|trusted| trusted == domain) {
                    Ok(())
                } else {
                    Err(RelocatorError::PolicyRejected(format!(
                        "{}: registry {} is not trusted",
                        source, domain
                    )))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub trust_policy: TrustPolicy,
    /// Drop signatures instead of copying them
    pub remove_signatures: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            trust_policy: TrustPolicy::InsecureAcceptAnything,
            remove_signatures: true,
        }
    }
}

/// Copies one whole image between two transports
#[async_trait]
pub trait ImageCopier: Send + Sync {
    async fn copy(
        &self,
        source: &TransportRef,
        destination: &TransportRef,
        options: &CopyOptions,
    ) -> Result<()>;
}

/// [`ImageCopier`] over the Docker Registry HTTP API v2 and docker-archive files
pub struct DistributionCopier {
    settings: TransferConfig,
    credentials: HashMap<String, AuthConfig>,
    clients: Mutex<HashMap<String, Arc<RegistryClient>>>,
}

impl DistributionCopier {
    pub fn new(settings: TransferConfig, credentials: HashMap<String, AuthConfig>) -> Self {
        Self {
            settings,
            credentials,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, host: &str) -> Result<Arc<RegistryClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(host) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(
            RegistryClient::builder(host)
                .with_credentials(self.credentials_for(host).cloned())
                .with_skip_tls(self.settings.skip_tls)
                .with_plain_http(self.settings.is_plain_http(host))
                .with_timeout(self.settings.timeout())
                .build()?,
        );
        clients.insert(host.to_string(), Arc::clone(&client));
        Ok(client)
    }

    fn credentials_for(&self, host: &str) -> Option<&AuthConfig> {
        if let Some(credentials) = self.credentials.get(host) {
            return Some(credentials);
        }
        if host == DOCKER_HUB_REGISTRY {
            return DOCKER_HUB_ALIASES
                .iter()
                .find_map(|alias| self.credentials.get(*alias));
        }
        None
    }

    /// Pull an image from its registry, streaming its blobs into a staging
    /// directory created inside `near` (or the system temp dir)
    async fn fetch_image(&self, reference: &ImageReference, near: Option<&Path>) -> Result<StagedImage> {
        let (host, repository) = registry_endpoint(reference);
        let client = self.client_for(&host).await?;

        let (bytes, media_type) = client
            .get_manifest(&repository, reference.manifest_reference())
            .await?;
        if let Some(digest) = &reference.digest {
            DigestUtils::verify_data_integrity(&bytes, digest)?;
        }
        let manifest = ImageManifest::from_slice(&bytes, media_type.as_deref())?;

        let staging = staging_dir(near)?;
        let config = client
            .download_blob(
                &repository,
                &manifest.config.digest,
                &staged_blob_path(staging.path(), &manifest.config.digest),
            )
            .await?;
        let mut layers: Vec<StagedBlob> = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            if let Some(staged) = layers.iter().find(|staged| staged.digest == layer.digest).cloned() {
                layers.push(staged);
                continue;
            }
            let dest = staged_blob_path(staging.path(), &layer.digest);
            layers.push(client.download_blob(&repository, &layer.digest, &dest).await?);
        }

        tracing::debug!(
            image = %reference,
            layers = layers.len(),
            "fetched image from registry"
        );

        let repo_tags = reference
            .tag
            .is_some()
            .then(|| vec![reference.to_string()])
            .unwrap_or_default();
        Ok(StagedImage::new(
            staging,
            config,
            layers,
            repo_tags,
            Some(SourceManifest { bytes, manifest }),
        ))
    }

    /// Push blobs then the manifest; the tag exists only once everything else does
    async fn publish_image(&self, plan: UploadPlan, reference: &ImageReference) -> Result<()> {
        if let Some(expected) = &reference.digest {
            let actual = plan.manifest_digest();
            if &actual != expected {
                return Err(RelocatorError::Registry(format!(
                    "cannot push {} by digest: the archived manifest has digest {}",
                    reference, actual
                )));
            }
        }

        let (host, repository) = registry_endpoint(reference);
        let client = self.client_for(&host).await?;

        let mut seen = HashSet::new();
        for blob in &plan.blobs {
            if !seen.insert(blob.digest.as_str()) {
                continue;
            }
            if client.blob_exists(&repository, &blob.digest).await? {
                tracing::debug!(digest = %DigestUtils::format_digest_short(&blob.digest), "blob already present");
                continue;
            }
            client.push_blob(&repository, blob).await?;
        }

        let reported = client
            .put_manifest(
                &repository,
                reference.manifest_reference(),
                &plan.manifest,
                &plan.media_type,
            )
            .await?;
        tracing::debug!(image = %reference, digest = ?reported, "published manifest");
        Ok(())
    }
}

#[async_trait]
impl ImageCopier for DistributionCopier {
    async fn copy(
        &self,
        source: &TransportRef,
        destination: &TransportRef,
        options: &CopyOptions,
    ) -> Result<()> {
        options.trust_policy.check(source)?;

        if let TransportRef::DockerArchive(_) = destination {
            if !options.remove_signatures {
                return Err(RelocatorError::Configuration(
                    "docker-archive destinations cannot store signatures; enable remove_signatures"
                        .to_string(),
                ));
            }
        }

        tracing::debug!(%source, %destination, "copying image");

        match (source, destination) {
            (TransportRef::Registry(from), TransportRef::DockerArchive(to)) => {
                let near = to.parent().filter(|dir| !dir.as_os_str().is_empty());
                let image = self.fetch_image(from, near).await?;
                write_archive(image, to.clone()).await
            }
            (TransportRef::DockerArchive(from), TransportRef::Registry(to)) => {
                let plan = read_upload_plan(from.clone()).await?;
                self.publish_image(plan, to).await
            }
            (TransportRef::Registry(from), TransportRef::Registry(to)) => {
                let image = self.fetch_image(from, None).await?;
                let plan = blocking(move || image.into_upload_plan()).await?;
                self.publish_image(plan, to).await
            }
            (TransportRef::DockerArchive(from), TransportRef::DockerArchive(to)) => {
                let from = from.clone();
                let image = blocking(move || StagedImage::read_from(&from)).await?;
                write_archive(image, to.clone()).await
            }
        }
    }
}

/// Registry host and repository path the API is addressed with
fn registry_endpoint(reference: &ImageReference) -> (String, String) {
    match reference.domain.as_deref() {
        None => docker_hub_endpoint(&reference.name),
        Some(domain) if DOCKER_HUB_ALIASES.contains(&domain) => docker_hub_endpoint(&reference.name),
        Some(domain) => (domain.to_string(), reference.name.clone()),
    }
}

fn docker_hub_endpoint(name: &str) -> (String, String) {
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    (DOCKER_HUB_REGISTRY.to_string(), repository)
}

/// Staging file for a downloaded blob, named after its digest
fn staged_blob_path(staging: &Path, digest: &str) -> PathBuf {
    staging.join(digest.replace(':', "_"))
}

async fn write_archive(image: StagedImage, path: PathBuf) -> Result<()> {
    blocking(move || image.write_to(&path)).await
}

async fn read_upload_plan(path: PathBuf) -> Result<UploadPlan> {
    blocking(move || StagedImage::read_from(&path)?.into_upload_plan()).await
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RelocatorError::Archive(format!("archive task failed: {}", e)))?
}
