//! Docker Registry HTTP API v2 client
//!
//! One [`RegistryClient`] talks to one registry host. Requests that come back
//! `401` are answered through [`Auth`] and retried once; the resulting
//! authorization is cached per scope for later requests.
//!
//! Blob bodies are streamed between the network and staging files in chunks.

use crate::config::AuthConfig;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{RelocatorError, Result};
use crate::image::archive::StagedBlob;
use crate::image::digest::{BlobHasher, DigestUtils};
use crate::image::manifest::ACCEPTED_MANIFEST_TYPES;
use crate::registry::auth::{Auth, Authorization, Challenge};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use url::Url;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

pub struct RegistryClientBuilder {
    host: String,
    credentials: Option<AuthConfig>,
    skip_tls: bool,
    plain_http: bool,
    timeout: Option<Duration>,
}

impl RegistryClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            credentials: None,
            skip_tls: false,
            plain_http: false,
            timeout: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<AuthConfig>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_skip_tls(mut self, skip_tls: bool) -> Self {
        self.skip_tls = skip_tls;
        self
    }

    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if self.skip_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let scheme = if self.plain_http { "http" } else { "https" };
        let base_url = Url::parse(&format!("{}://{}/", scheme, self.host))?;

        Ok(RegistryClient {
            auth: Auth::new(client.clone()),
            client,
            base_url,
            credentials: self.credentials,
            authorizations: Mutex::new(HashMap::new()),
        })
    }
}

pub struct RegistryClient {
    client: Client,
    base_url: Url,
    credentials: Option<AuthConfig>,
    auth: Auth,
    authorizations: Mutex<HashMap<String, Authorization>>,
}

impl RegistryClient {
    pub fn builder(host: impl Into<String>) -> RegistryClientBuilder {
        RegistryClientBuilder::new(host)
    }

    /// Fetch a manifest by tag or digest, returning its bytes and media type
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let url = self.endpoint(&format!("v2/{}/manifests/{}", repository, reference))?;
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let response = self
            .send(&pull_scope(repository), |client| {
                client.get(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        let response = check(response, "manifest fetch").await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_string());
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, media_type))
    }

    /// Stream a blob into `dest`, verifying it against its digest
    pub async fn download_blob(&self, repository: &str, digest: &str, dest: &Path) -> Result<StagedBlob> {
        let url = self.endpoint(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = self
            .send(&pull_scope(repository), |client| client.get(url.clone()))
            .await?;
        let response = check(response, "blob download").await?;

        let file = File::create(dest)
            .await
            .map_err(|e| RelocatorError::path(dest, e))?;
        let mut writer = BufWriter::new(file);
        let mut hasher = BlobHasher::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| RelocatorError::path(dest, e))?;
        }
        writer.flush().await.map_err(|e| RelocatorError::path(dest, e))?;

        let (computed, size) = hasher.finish();
        DigestUtils::verify_computed(&computed, digest)?;
        tracing::debug!(
            digest = %DigestUtils::format_digest_short(digest),
            size,
            "downloaded blob"
        );
        Ok(StagedBlob {
            digest: computed,
            size,
            path: dest.to_path_buf(),
        })
    }

    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = self.endpoint(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = self
            .send(&push_scope(repository), |client| client.head(url.clone()))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(HttpErrorHandler::handle_registry_error(
                status,
                "",
                "blob existence check",
            )),
        }
    }

    /// Monolithic blob upload: start a session, then PUT the whole blob
    pub async fn push_blob(&self, repository: &str, blob: &StagedBlob) -> Result<()> {
        let scope = push_scope(repository);
        let start_url = self.endpoint(&format!("v2/{}/blobs/uploads/", repository))?;
        let response = self
            .send(&scope, |client| client.post(start_url.clone()))
            .await?;
        let response = check(response, "blob upload start").await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                RelocatorError::Registry("No Location header in upload response".to_string())
            })?;
        let mut upload_url = self.base_url.join(location)?;
        upload_url.query_pairs_mut().append_pair("digest", &blob.digest);

        // Streamed bodies cannot be replayed; the POST has already authorized this scope.
        let file = File::open(&blob.path)
            .await
            .map_err(|e| RelocatorError::path(&blob.path, e))?;
        let request = self
            .client
            .put(upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, blob.size)
            .body(file_body(file));
        let response = self.authorized(&scope, request).await.send().await?;
        check(response, "blob upload").await?;

        tracing::debug!(
            digest = %DigestUtils::format_digest_short(&blob.digest),
            size = blob.size,
            "uploaded blob"
        );
        Ok(())
    }

    /// Upload a manifest, returning the digest the registry reports for it
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<Option<String>> {
        let url = self.endpoint(&format!("v2/{}/manifests/{}", repository, reference))?;
        let response = self
            .send(&push_scope(repository), |client| {
                client
                    .put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(manifest.to_vec())
            })
            .await?;
        let response = check(response, "manifest upload").await?;

        Ok(response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Send a request, answering one authentication challenge if needed
    async fn send<F>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.authorized(scope, build(&self.client)).await.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(Challenge::parse)
        else {
            return Ok(response);
        };

        tracing::debug!(scope, "registry requested authentication");
        let authorization = self
            .auth
            .authorize(&challenge, scope, self.credentials.as_ref())
            .await?;
        let response = authorization.apply(build(&self.client)).send().await?;
        self.authorizations
            .lock()
            .await
            .insert(scope.to_string(), authorization);
        Ok(response)
    }

    async fn authorized(&self, scope: &str, request: RequestBuilder) -> RequestBuilder {
        match self.authorizations.lock().await.get(scope) {
            Some(authorization) => authorization.apply(request),
            None => request,
        }
    }
}

/// Request body that reads `file` in chunks as it is sent
fn file_body(file: File) -> Body {
    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
        let read = file.read(&mut chunk).await?;
        if read == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        chunk.truncate(read);
        Ok(Some((chunk, file)))
    });
    Body::wrap_stream(chunks)
}

fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

fn push_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}

async fn check(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(HttpErrorHandler::handle_registry_error(status, &text, operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme() {
        let client = RegistryClient::builder("myregistry.io").build().unwrap();
        assert_eq!(client.base_url.as_str(), "https://myregistry.io/");

        let client = RegistryClient::builder("localhost:5000")
            .with_plain_http(true)
            .build()
            .unwrap();
        assert_eq!(client.base_url.as_str(), "http://localhost:5000/");
    }

    #[test]
    fn test_endpoint_paths() {
        let client = RegistryClient::builder("myregistry.io").build().unwrap();
        let url = client.endpoint("v2/myns/app/manifests/1.2.3").unwrap();
        assert_eq!(url.as_str(), "https://myregistry.io/v2/myns/app/manifests/1.2.3");

        let upload = client.base_url.join("/v2/myns/app/blobs/uploads/abc?state=x").unwrap();
        assert_eq!(upload.host_str(), Some("myregistry.io"));
        let absolute = client
            .base_url
            .join("https://storage.example.com/upload/abc")
            .unwrap();
        assert_eq!(absolute.host_str(), Some("storage.example.com"));
    }

    #[test]
    fn test_scopes() {
        assert_eq!(pull_scope("library/nginx"), "repository:library/nginx:pull");
        assert_eq!(push_scope("myns/app"), "repository:myns/app:pull,push");
    }
}
