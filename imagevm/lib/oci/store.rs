use std::{
    io::Read,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use getset::Getters;
use oci_spec::image::{Descriptor, Digest};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    utils::{
        self, BLOBS_SUBDIR, OCI_INDEX_FILENAME, OCI_LAYOUT_FILENAME, PARTIAL_BLOB_SUFFIX,
    },
    ImageVmError, ImageVmResult,
};

use super::{DockerRegistry, Reference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The annotation key recording the reference a top-level descriptor was pulled as.
pub const OCI_REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A content-addressed image store, namespaced by an isolation key.
///
/// The image resolver only ever talks to a store through this trait, so tests can back it with
/// fixtures and the CLI can back it with an on-disk layout that pulls from a registry.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Makes the image available in the namespace, downloading it if needed.
    async fn fetch(&self, namespace: &str, reference: &Reference) -> ImageVmResult<()>;

    /// Returns the top-level descriptor (an index or a manifest) recorded for the reference.
    async fn resolve(&self, namespace: &str, reference: &Reference) -> ImageVmResult<Descriptor>;

    /// Reads a whole blob into memory. Meant for manifests and configs.
    async fn read_blob(&self, namespace: &str, descriptor: &Descriptor) -> ImageVmResult<Bytes>;

    /// Opens a blob for streaming. Meant for layers.
    async fn open_blob(
        &self,
        namespace: &str,
        descriptor: &Descriptor,
    ) -> ImageVmResult<Box<dyn Read + Send>>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An on-disk content store using the OCI image layout, one layout per namespace:
///
/// ```text
/// <root>/<namespace>/oci-layout
/// <root>/<namespace>/index.json
/// <root>/<namespace>/blobs/<algorithm>/<hex>
/// ```
///
/// Every blob written is checked against its digest. References are recorded in `index.json` as
/// `org.opencontainers.image.ref.name` annotations on the top-level descriptors.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct OciStore {
    /// The directory holding one layout per namespace.
    root: PathBuf,

    /// The registry used to fetch images that are not present.
    registry: Option<DockerRegistry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,

    #[serde(default)]
    manifests: Vec<Descriptor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciStore {
    /// Creates a store rooted at `root`. Without a registry, [`ContentStore::fetch`] only
    /// succeeds for images that are already present.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: None,
        }
    }

    /// Sets the registry used to fetch missing images.
    pub fn with_registry(mut self, registry: DockerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The layout directory of a namespace.
    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Where the blob with the given digest is stored.
    pub fn blob_path(&self, namespace: &str, digest: &Digest) -> PathBuf {
        self.namespace_dir(namespace)
            .join(BLOBS_SUBDIR)
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    /// Where a blob is written while it is being downloaded.
    pub fn partial_blob_path(&self, namespace: &str, digest: &Digest) -> PathBuf {
        let mut path = self.blob_path(namespace, digest).into_os_string();
        path.push(PARTIAL_BLOB_SUFFIX);
        PathBuf::from(path)
    }

    /// Whether the blob is present.
    pub async fn has_blob(&self, namespace: &str, digest: &Digest) -> bool {
        fs::try_exists(self.blob_path(namespace, digest))
            .await
            .unwrap_or(false)
    }

    /// Writes an in-memory blob after checking it against its digest.
    pub async fn write_blob(
        &self,
        namespace: &str,
        digest: &Digest,
        bytes: &[u8],
    ) -> ImageVmResult<()> {
        verify_digest(digest, &utils::get_bytes_hash(bytes, digest.algorithm())?)?;

        self.ensure_layout(namespace).await?;
        let path = self.blob_path(namespace, digest);
        write_atomic(&path, bytes).await
    }

    /// Moves a fully downloaded partial blob into place once its digest checks out. A partial
    /// blob with the wrong content is removed.
    pub async fn commit_partial_blob(&self, namespace: &str, digest: &Digest) -> ImageVmResult<()> {
        let partial = self.partial_blob_path(namespace, digest);
        let actual = utils::get_file_hash(&partial, digest.algorithm()).await?;

        if let Err(e) = verify_digest(digest, &actual) {
            fs::remove_file(&partial).await?;
            return Err(e);
        }

        fs::rename(&partial, self.blob_path(namespace, digest)).await?;
        Ok(())
    }

    /// Records `descriptor` as the top-level descriptor of `reference`, replacing any previous
    /// entry for the same reference.
    pub async fn tag(
        &self,
        namespace: &str,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> ImageVmResult<()> {
        self.ensure_layout(namespace).await?;

        let name = reference.to_string();
        let mut index = self.read_index(namespace).await?;
        index.manifests.retain(|d| ref_name(d) != Some(name.as_str()));

        let mut annotations = descriptor.annotations().clone().unwrap_or_default();
        annotations.insert(OCI_REF_NAME_ANNOTATION.to_string(), name);

        let mut tagged = descriptor.clone();
        tagged.set_annotations(Some(annotations));
        index.manifests.push(tagged);

        let path = self.namespace_dir(namespace).join(OCI_INDEX_FILENAME);
        write_atomic(&path, &serde_json::to_vec_pretty(&index)?).await
    }

    /// Looks up the top-level descriptor recorded for a reference.
    pub async fn lookup(
        &self,
        namespace: &str,
        reference: &Reference,
    ) -> ImageVmResult<Option<Descriptor>> {
        let name = reference.to_string();
        let index = self.read_index(namespace).await?;

        Ok(index
            .manifests
            .into_iter()
            .find(|d| ref_name(d) == Some(name.as_str())))
    }

    async fn read_index(&self, namespace: &str) -> ImageVmResult<LayoutIndex> {
        let path = self.namespace_dir(namespace).join(OCI_INDEX_FILENAME);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LayoutIndex {
                schema_version: 2,
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_layout(&self, namespace: &str) -> ImageVmResult<()> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(dir.join(BLOBS_SUBDIR)).await?;

        let layout = dir.join(OCI_LAYOUT_FILENAME);
        if !fs::try_exists(&layout).await? {
            fs::write(&layout, OCI_LAYOUT_CONTENT).await?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(OCI_REF_NAME_ANNOTATION))
        .map(String::as_str)
}

fn verify_digest(digest: &Digest, actual: &[u8]) -> ImageVmResult<()> {
    let actual = hex::encode(actual);
    if actual != digest.digest() {
        return Err(ImageVmError::DigestMismatch {
            expected: digest.to_string(),
            actual: format!("{}:{}", digest.algorithm(), actual),
        });
    }

    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> ImageVmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContentStore for OciStore {
    async fn fetch(&self, namespace: &str, reference: &Reference) -> ImageVmResult<()> {
        if self.lookup(namespace, reference).await?.is_some() {
            tracing::info!("image {reference} already exists in namespace {namespace}, skipping pull");
            return Ok(());
        }

        match &self.registry {
            Some(registry) => registry.pull_image(self, namespace, reference).await,
            None => Err(ImageVmError::ImageNotFound {
                reference: reference.to_string(),
                reason: format!("not present in namespace {namespace} and pulling is disabled"),
            }),
        }
    }

    async fn resolve(&self, namespace: &str, reference: &Reference) -> ImageVmResult<Descriptor> {
        self.lookup(namespace, reference)
            .await?
            .ok_or_else(|| ImageVmError::ImageNotFound {
                reference: reference.to_string(),
                reason: format!("no such image in namespace {namespace}"),
            })
    }

    async fn read_blob(&self, namespace: &str, descriptor: &Descriptor) -> ImageVmResult<Bytes> {
        let bytes = fs::read(self.blob_path(namespace, descriptor.digest())).await?;
        Ok(Bytes::from(bytes))
    }

    async fn open_blob(
        &self,
        namespace: &str,
        descriptor: &Descriptor,
    ) -> ImageVmResult<Box<dyn Read + Send>> {
        let file = fs::File::open(self.blob_path(namespace, descriptor.digest())).await?;
        Ok(Box::new(file.into_std().await))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use oci_spec::image::MediaType;

    use super::*;

    fn sha256_digest(bytes: &[u8]) -> anyhow::Result<Digest> {
        let hash = utils::get_bytes_hash(bytes, &oci_spec::image::DigestAlgorithm::Sha256)?;
        Ok(Digest::from_str(&format!("sha256:{}", hex::encode(hash)))?)
    }

    #[test_log::test(tokio::test)]
    async fn test_oci_store_write_and_read_blob() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciStore::new(dir.path());
        let content = b"{\"schemaVersion\":2}";
        let digest = sha256_digest(content)?;

        store.write_blob("ns", &digest, content).await?;
        assert!(store.has_blob("ns", &digest).await);
        assert!(dir.path().join("ns/oci-layout").exists());

        let descriptor = Descriptor::new(MediaType::ImageManifest, content.len() as u64, digest);
        let bytes = store.read_blob("ns", &descriptor).await?;
        assert_eq!(&bytes[..], content);

        let mut read = String::new();
        store
            .open_blob("ns", &descriptor)
            .await?
            .read_to_string(&mut read)?;
        assert_eq!(read.as_bytes(), content);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_oci_store_rejects_digest_mismatch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciStore::new(dir.path());
        let digest = sha256_digest(b"expected")?;

        let result = store.write_blob("ns", &digest, b"tampered").await;
        assert!(matches!(result, Err(ImageVmError::DigestMismatch { .. })));
        assert!(!store.has_blob("ns", &digest).await);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_oci_store_tag_and_namespaces_are_isolated() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciStore::new(dir.path());
        let reference = Reference::from_str("docker.io/library/alpine:3.20")?;
        let content = b"manifest";
        let digest = sha256_digest(content)?;
        let descriptor = Descriptor::new(MediaType::ImageManifest, content.len() as u64, digest);

        store.tag("one", &reference, &descriptor).await?;
        // Re-tagging replaces the entry instead of duplicating it
        store.tag("one", &reference, &descriptor).await?;

        let found = store.resolve("one", &reference).await?;
        assert_eq!(found.digest(), descriptor.digest());
        assert_eq!(store.read_index("one").await?.manifests.len(), 1);

        let missing = store.resolve("two", &reference).await;
        assert!(matches!(missing, Err(ImageVmError::ImageNotFound { .. })));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_oci_store_fetch_without_registry_fails_for_missing_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = OciStore::new(dir.path());
        let reference = Reference::from_str("docker.io/library/alpine:3.20")?;

        let result = store.fetch("ns", &reference).await;
        assert!(matches!(result, Err(ImageVmError::ImageNotFound { .. })));

        Ok(())
    }
}
