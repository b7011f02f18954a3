use std::{ops::RangeBounds, str::FromStr};

use bytes::Bytes;
use futures::{future, stream::BoxStream, StreamExt};
use getset::Getters;
use oci_spec::image::{
    Descriptor, Digest, DigestAlgorithm, ImageIndex, ImageManifest, MediaType, Platform,
};
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{
    config::DEFAULT_OCI_REGISTRY,
    utils::{self, to_range_header},
    ImageVmError, ImageVmResult,
};

use super::{select_manifest, OciStore, Reference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Base URL for the Docker Hub registry v2 API.
const DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// The service name used during Docker Hub token authentication.
const DOCKER_AUTH_SERVICE: &str = "registry.docker.io";

/// Endpoint for acquiring Docker Hub authentication tokens.
const DOCKER_AUTH_REALM: &str = "https://auth.docker.io/token";

/// The MIME type of Docker v2 manifests.
pub const DOCKER_MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type of Docker v2 manifest lists.
pub const DOCKER_MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const OCI_MANIFEST_MIME_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const OCI_INDEX_MIME_TYPE: &str = "application/vnd.oci.image.index.v1+json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for the registry HTTP API v2 that pulls images into an [`OciStore`].
///
/// Docker Hub is accessed with anonymous bearer tokens. Other registries are accessed without
/// authentication over HTTPS.
///
/// [Docker Registry API]: https://distribution.github.io/distribution/spec/api/#introduction
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerRegistry {
    /// The HTTP client used to make requests to the registry.
    client: ClientWithMiddleware,

    /// The platform picked from multi-platform images.
    platform: Platform,
}

/// Authentication material handed out by the Docker Hub token endpoint.
#[derive(Debug, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerAuthMaterial {
    /// The token used to authenticate registry requests.
    token: String,

    /// How long the token is valid for, in seconds.
    #[serde(default)]
    expires_in: Option<u32>,

    /// When the token was issued.
    #[serde(default)]
    issued_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// An error response body returned by a registry.
#[derive(Debug, Serialize, Deserialize, Error)]
#[error("status {status}: {errors}")]
pub struct DockerRegistryResponseError {
    /// The HTTP status code of the response.
    #[serde(skip)]
    status: u16,

    /// The errors returned by the registry.
    #[serde(default)]
    errors: serde_json::Value,
}

struct RegistryEndpoint {
    base_url: String,
    docker_hub: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerRegistry {
    /// Creates a registry client that retries transient failures with exponential backoff.
    pub fn new() -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            platform: Platform::default(),
        }
    }

    /// Sets the platform picked from multi-platform images.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Pulls an image into `store` under `namespace`: the top-level manifest or index, the
    /// platform manifest, the config and every layer. Blobs already in the store are skipped.
    /// The reference is tagged in the store only after all blobs are present.
    pub async fn pull_image(
        &self,
        store: &OciStore,
        namespace: &str,
        reference: &Reference,
    ) -> ImageVmResult<()> {
        tracing::info!("pulling image {reference}");

        let endpoint = RegistryEndpoint::for_reference(reference);
        let repository = reference.get_repository();
        let token = self.get_token(&endpoint, repository).await?;

        // Top-level manifest or index
        let (top_bytes, top_media_type) = self
            .fetch_manifest_bytes(
                &endpoint,
                repository,
                &reference.manifest_reference(),
                token.as_deref(),
            )
            .await
            .map_err(|e| not_found(reference, e))?;

        let top_digest = sha256_digest(&top_bytes)?;
        if let Some(pinned) = reference.pinned_digest() {
            if pinned != &top_digest {
                return Err(ImageVmError::DigestMismatch {
                    expected: pinned.to_string(),
                    actual: top_digest.to_string(),
                });
            }
        }
        store.write_blob(namespace, &top_digest, &top_bytes).await?;

        let top_is_index = is_index(&top_media_type, &top_bytes);
        let top_media_type = match (top_media_type.is_empty(), top_is_index) {
            (false, _) => MediaType::from(top_media_type.as_str()),
            (true, true) => MediaType::ImageIndex,
            (true, false) => MediaType::ImageManifest,
        };
        let top_descriptor =
            Descriptor::new(top_media_type, top_bytes.len() as u64, top_digest.clone());

        // Platform manifest
        let manifest_bytes = if top_is_index {
            let index: ImageIndex = serde_json::from_slice(&top_bytes).map_err(|e| {
                ImageVmError::ManifestUnreadable {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                }
            })?;

            let platform = &self.platform;
            let manifest_desc = select_manifest(&index, platform).ok_or_else(|| {
                ImageVmError::ManifestUnreadable {
                    reference: reference.to_string(),
                    reason: format!(
                        "no manifest for platform {}/{}",
                        platform.os(),
                        platform.architecture()
                    ),
                }
            })?;

            let (bytes, _) = self
                .fetch_manifest_bytes(
                    &endpoint,
                    repository,
                    &manifest_desc.digest().to_string(),
                    token.as_deref(),
                )
                .await?;
            store
                .write_blob(namespace, manifest_desc.digest(), &bytes)
                .await?;
            bytes
        } else {
            top_bytes
        };

        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            ImageVmError::ManifestUnreadable {
                reference: reference.to_string(),
                reason: e.to_string(),
            }
        })?;

        // Config
        let config_digest = manifest.config().digest();
        if !store.has_blob(namespace, config_digest).await {
            let config = self
                .fetch_blob_bytes(&endpoint, repository, config_digest, token.as_deref())
                .await?;
            store.write_blob(namespace, config_digest, &config).await?;
        }

        // Layers are downloaded concurrently, their order only matters when applying them
        let layer_futures: Vec<_> = manifest
            .layers()
            .iter()
            .map(|layer| async {
                if store.has_blob(namespace, layer.digest()).await {
                    tracing::info!("layer {} already exists, skipping download", layer.digest());
                    return Ok::<_, ImageVmError>(());
                }

                self.download_image_blob(
                    store,
                    namespace,
                    &endpoint,
                    repository,
                    layer.digest(),
                    layer.size(),
                    token.as_deref(),
                )
                .await
            })
            .collect();

        for result in future::join_all(layer_futures).await {
            result?;
        }

        store.tag(namespace, reference, &top_descriptor).await?;
        tracing::info!("pulled image {reference} ({top_digest})");

        Ok(())
    }

    /// Downloads a blob into the store's partial file, resuming a previous partial download, and
    /// commits it once the digest checks out.
    #[allow(clippy::too_many_arguments)]
    async fn download_image_blob(
        &self,
        store: &OciStore,
        namespace: &str,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &Digest,
        download_size: u64,
        token: Option<&str>,
    ) -> ImageVmResult<()> {
        let partial_path = store.partial_blob_path(namespace, digest);
        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let downloaded_size = match fs::metadata(&partial_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        if downloaded_size < download_size {
            let mut file = if downloaded_size == 0 {
                OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&partial_path)
                    .await?
            } else {
                tracing::info!("resuming download of {digest} at byte {downloaded_size}");
                OpenOptions::new().append(true).open(&partial_path).await?
            };

            let mut stream = self
                .fetch_image_blob(endpoint, repository, digest, downloaded_size.., token)
                .await?;

            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
        }

        store.commit_partial_blob(namespace, digest).await
    }

    async fn get_token(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
    ) -> ImageVmResult<Option<String>> {
        if !endpoint.docker_hub {
            return Ok(None);
        }

        let request = self
            .client
            .get(DOCKER_AUTH_REALM)
            .query(&[
                ("service", DOCKER_AUTH_SERVICE),
                ("scope", &format!("repository:{repository}:pull")),
            ])
            .build()?;

        let response = self.client.execute(request).await?;
        let auth = response.json::<DockerAuthMaterial>().await?;
        tracing::debug!(
            "acquired registry token for {repository} (expires in {:?}s)",
            auth.expires_in
        );

        Ok(Some(auth.token))
    }

    async fn fetch_manifest_bytes(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> ImageVmResult<(Bytes, String)> {
        let accept = [
            OCI_INDEX_MIME_TYPE,
            OCI_MANIFEST_MIME_TYPE,
            DOCKER_MANIFEST_LIST_MIME_TYPE,
            DOCKER_MANIFEST_MIME_TYPE,
        ]
        .join(", ");

        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/manifests/{}",
                endpoint.base_url, repository, reference
            ))
            .header("Accept", accept);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let status = response.status();
        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        let bytes = response.bytes().await?;

        check_status(status, &bytes)?;
        Ok((bytes, media_type))
    }

    async fn fetch_blob_bytes(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &Digest,
        token: Option<&str>,
    ) -> ImageVmResult<Bytes> {
        let mut request = self.client.get(format!(
            "{}/v2/{}/blobs/{}",
            endpoint.base_url, repository, digest
        ));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        check_status(status, &bytes)?;
        Ok(bytes)
    }

    async fn fetch_image_blob(
        &self,
        endpoint: &RegistryEndpoint,
        repository: &str,
        digest: &Digest,
        range: impl RangeBounds<u64>,
        token: Option<&str>,
    ) -> ImageVmResult<BoxStream<'static, ImageVmResult<Bytes>>> {
        let range = to_range_header(range);
        tracing::info!("fetching blob: {repository} {digest} {range}");

        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/blobs/{}",
                endpoint.base_url, repository, digest
            ))
            .header("Range", range);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await?;
            return Err(check_status(status, &bytes).unwrap_err());
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(ImageVmError::from));

        Ok(stream.boxed())
    }
}

impl RegistryEndpoint {
    fn for_reference(reference: &Reference) -> Self {
        let registry = reference.get_registry();
        if registry == DEFAULT_OCI_REGISTRY || registry == "registry-1.docker.io" {
            Self {
                base_url: DOCKER_REGISTRY_URL.to_string(),
                docker_hub: true,
            }
        } else {
            Self {
                base_url: format!("https://{registry}"),
                docker_hub: false,
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a manifest response is an index (OCI index or Docker manifest list).
pub(crate) fn is_index(media_type: &str, bytes: &[u8]) -> bool {
    match media_type {
        OCI_INDEX_MIME_TYPE | DOCKER_MANIFEST_LIST_MIME_TYPE => true,
        OCI_MANIFEST_MIME_TYPE | DOCKER_MANIFEST_MIME_TYPE => false,
        _ => serde_json::from_slice::<serde_json::Value>(bytes)
            .map(|v| v.get("manifests").is_some())
            .unwrap_or(false),
    }
}

fn sha256_digest(bytes: &[u8]) -> ImageVmResult<Digest> {
    let hash = utils::get_bytes_hash(bytes, &DigestAlgorithm::Sha256)?;
    Digest::from_str(&format!("sha256:{}", hex::encode(hash))).map_err(ImageVmError::custom)
}

fn check_status(status: StatusCode, body: &[u8]) -> ImageVmResult<()> {
    if status.is_success() {
        return Ok(());
    }

    let mut error = serde_json::from_slice::<DockerRegistryResponseError>(body).unwrap_or(
        DockerRegistryResponseError {
            status: 0,
            errors: serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
        },
    );
    error.status = status.as_u16();

    Err(error.into())
}

fn not_found(reference: &Reference, error: ImageVmError) -> ImageVmError {
    match error {
        ImageVmError::DockerRegistry(e) if e.status == StatusCode::NOT_FOUND.as_u16() => {
            ImageVmError::ImageNotFound {
                reference: reference.to_string(),
                reason: e.to_string(),
            }
        }
        other => other,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DockerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
