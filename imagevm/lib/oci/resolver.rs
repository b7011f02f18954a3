use getset::Getters;
use oci_spec::image::{
    Descriptor, Digest, ImageConfiguration, ImageIndex, ImageManifest, MediaType, Os, Platform,
};

use crate::{ImageVmError, ImageVmResult};

use super::{is_index, ContentStore, Reference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The annotation key used to identify attestation manifests in Docker indexes.
const DOCKER_REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parts of an image configuration needed to boot it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageConfig {
    /// The boot command: the image entrypoint followed by its cmd.
    command: Vec<String>,

    /// `KEY=VALUE` environment entries in image order.
    env: Vec<String>,
}

/// A layer of an image and its position in the manifest.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LayerDescriptor {
    /// The layer's position in the manifest, starting at zero.
    index: usize,

    /// The layer's content descriptor.
    descriptor: Descriptor,
}

/// The result of resolving an image reference.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ResolvedImage {
    /// The reference that was resolved.
    reference: Reference,

    /// The digest of the platform manifest.
    manifest_digest: Digest,

    /// The descriptor of the config blob.
    config_descriptor: Descriptor,

    /// The boot-relevant parts of the config.
    config: ImageConfig,

    /// The layers in manifest order.
    layers: Vec<LayerDescriptor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageConfig {
    /// Creates an image config from a boot command and environment.
    pub fn new(command: Vec<String>, env: Vec<String>) -> Self {
        Self { command, env }
    }

    /// Extracts the boot command and environment from an image configuration.
    pub fn from_configuration(configuration: &ImageConfiguration) -> Self {
        let Some(config) = configuration.config() else {
            return Self::default();
        };

        let command = config
            .entrypoint()
            .iter()
            .flatten()
            .chain(config.cmd().iter().flatten())
            .cloned()
            .collect();
        let env = config.env().clone().unwrap_or_default();

        Self { command, env }
    }

    /// The boot command joined by spaces.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

impl LayerDescriptor {
    /// Creates a layer descriptor.
    pub fn new(index: usize, descriptor: Descriptor) -> Self {
        Self { index, descriptor }
    }

    /// The layer digest.
    pub fn digest(&self) -> &Digest {
        self.descriptor.digest()
    }

    /// The layer media type.
    pub fn media_type(&self) -> &MediaType {
        self.descriptor.media_type()
    }

    /// The compressed size of the layer in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves an image reference to its boot command, environment and ordered layers.
///
/// With `pull` set, the store is first asked to fetch the image; any failure to do so, or to find
/// the image afterwards, is reported as [`ImageNotFound`][ImageVmError::ImageNotFound]. Manifests
/// that cannot be read are [`ManifestUnreadable`][ImageVmError::ManifestUnreadable], configs that
/// cannot be parsed are [`ConfigUnparsable`][ImageVmError::ConfigUnparsable].
pub async fn resolve_image<S: ContentStore + ?Sized>(
    store: &S,
    namespace: &str,
    reference: &Reference,
    platform: &Platform,
    pull: bool,
) -> ImageVmResult<ResolvedImage> {
    let not_found = |reason: String| ImageVmError::ImageNotFound {
        reference: reference.to_string(),
        reason,
    };
    let unreadable = |reason: String| ImageVmError::ManifestUnreadable {
        reference: reference.to_string(),
        reason,
    };

    if pull {
        store.fetch(namespace, reference).await.map_err(|e| match e {
            e @ ImageVmError::ImageNotFound { .. } => e,
            e @ ImageVmError::ManifestUnreadable { .. } => e,
            other => not_found(other.to_string()),
        })?;
    }

    let top = store.resolve(namespace, reference).await.map_err(|e| match e {
        e @ ImageVmError::ImageNotFound { .. } => e,
        other => not_found(other.to_string()),
    })?;

    let top_bytes = store
        .read_blob(namespace, &top)
        .await
        .map_err(|e| unreadable(e.to_string()))?;

    let manifest_descriptor = if is_index(&top.media_type().to_string(), &top_bytes) {
        let index: ImageIndex =
            serde_json::from_slice(&top_bytes).map_err(|e| unreadable(e.to_string()))?;
        select_manifest(&index, platform)
            .cloned()
            .ok_or_else(|| {
                unreadable(format!(
                    "no manifest for platform {}/{}",
                    platform.os(),
                    platform.architecture()
                ))
            })?
    } else {
        top
    };

    let manifest_bytes = store
        .read_blob(namespace, &manifest_descriptor)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    let manifest: ImageManifest =
        serde_json::from_slice(&manifest_bytes).map_err(|e| unreadable(e.to_string()))?;

    let config_descriptor = manifest.config().clone();
    let config_bytes = store
        .read_blob(namespace, &config_descriptor)
        .await
        .map_err(|e| ImageVmError::ConfigUnparsable {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;
    let configuration: ImageConfiguration =
        serde_json::from_slice(&config_bytes).map_err(|e| ImageVmError::ConfigUnparsable {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;

    let layers = manifest
        .layers()
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, descriptor)| LayerDescriptor::new(index, descriptor))
        .collect::<Vec<_>>();

    let config = ImageConfig::from_configuration(&configuration);

    tracing::info!(
        "resolved {reference}: {} layer(s), command {:?}",
        layers.len(),
        config.command_line()
    );

    Ok(ResolvedImage {
        reference: reference.clone(),
        manifest_digest: manifest_descriptor.digest().clone(),
        config_descriptor,
        config,
        layers,
    })
}

/// Picks the manifest for `platform` from an index.
///
/// Attestation manifests are skipped. A manifest matching both OS and architecture wins, then
/// one matching only the architecture.
pub fn select_manifest<'a>(index: &'a ImageIndex, platform: &Platform) -> Option<&'a Descriptor> {
    let candidates = || {
        index.manifests().iter().filter(|m| {
            !m.annotations()
                .as_ref()
                .is_some_and(|a| a.contains_key(DOCKER_REFERENCE_TYPE_ANNOTATION))
        })
    };

    candidates()
        .find(|m| {
            m.platform().as_ref().is_some_and(|p| {
                p.os() == platform.os() && p.architecture() == platform.architecture()
            })
        })
        .or_else(|| {
            candidates().find(|m| {
                m.platform().as_ref().is_some_and(|p| {
                    matches!(p.os(), Os::Linux) && p.architecture() == platform.architecture()
                })
            })
        })
        .or_else(|| {
            candidates().find(|m| {
                m.platform()
                    .as_ref()
                    .is_some_and(|p| p.architecture() == platform.architecture())
            })
        })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
