use std::{fmt, str::FromStr, sync::LazyLock};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::{
    config::{DEFAULT_OCI_REFERENCE_REPO_NAMESPACE, DEFAULT_OCI_REFERENCE_TAG},
    utils::get_oci_registry,
    ImageVmError, ImageVmResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static REGISTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").expect("registry pattern is a valid regex")
});

static REPOSITORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("repository pattern is a valid regex")
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w[\w.-]{0,127}$").expect("tag pattern is a valid regex"));

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An OCI image reference such as `docker.io/library/alpine:3.20`.
///
/// Missing parts are filled in while parsing: the registry defaults to
/// [`get_oci_registry`], the tag to `latest`, and single-segment repositories get the
/// `library/` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry where the image is hosted.
    registry: String,

    /// The repository name of the image.
    repository: String,

    /// The tag and/or digest selecting an image in the repository.
    selector: ReferenceSelector,
}

/// The part of a reference that selects an image within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// A tag, optionally pinned to a digest.
    Tag {
        /// The image tag.
        tag: String,

        /// The optional digest.
        digest: Option<Digest>,
    },

    /// A digest only.
    Digest(Digest),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// The string a registry expects after `/manifests/` to address this image.
    pub fn manifest_reference(&self) -> String {
        match &self.selector {
            ReferenceSelector::Tag {
                digest: Some(digest),
                ..
            } => digest.to_string(),
            ReferenceSelector::Tag { tag, digest: None } => tag.clone(),
            ReferenceSelector::Digest(digest) => digest.to_string(),
        }
    }

    /// The digest the reference is pinned to, if any.
    pub fn pinned_digest(&self) -> Option<&Digest> {
        match &self.selector {
            ReferenceSelector::Tag { digest, .. } => digest.as_ref(),
            ReferenceSelector::Digest(digest) => Some(digest),
        }
    }
}

impl ReferenceSelector {
    /// Creates a selector with the specified tag and no digest.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag {
            tag: tag.into(),
            digest: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = ImageVmError;

    /// Parses `[registry/]repository[:tag][@digest]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ImageVmError::ImageReferenceError(
                "input string is empty".into(),
            ));
        }

        let default_registry = get_oci_registry();
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    ImageVmError::ImageReferenceError(format!("invalid digest {digest}: {e}"))
                })?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        let (registry, remainder) = extract_registry_and_path(name, &default_registry);
        let (repository, tag) = extract_repository_and_tag(remainder, &registry)?;

        validate_registry(&registry)?;
        validate_repository(&repository)?;

        let selector = match (tag, digest) {
            (Some(tag), digest) => {
                validate_tag(&tag)?;
                ReferenceSelector::Tag { tag, digest }
            }
            (None, Some(digest)) => ReferenceSelector::Digest(digest),
            (None, None) => ReferenceSelector::tag(DEFAULT_OCI_REFERENCE_TAG),
        };

        Ok(Reference {
            registry,
            repository,
            selector,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag {
                tag,
                digest: Some(d),
            } => write!(f, ":{}@{}", tag, d),
            ReferenceSelector::Tag { tag, digest: None } => write!(f, ":{}", tag),
            ReferenceSelector::Digest(d) => write!(f, "@{}", d),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn validate_registry(registry: &str) -> ImageVmResult<()> {
    if REGISTRY_REGEX.is_match(registry) {
        Ok(())
    } else {
        Err(ImageVmError::ImageReferenceError(format!(
            "invalid registry: {registry}"
        )))
    }
}

fn validate_repository(repository: &str) -> ImageVmResult<()> {
    if REPOSITORY_REGEX.is_match(repository) {
        Ok(())
    } else {
        Err(ImageVmError::ImageReferenceError(format!(
            "invalid repository: {repository}"
        )))
    }
}

fn validate_tag(tag: &str) -> ImageVmResult<()> {
    if TAG_REGEX.is_match(tag) {
        Ok(())
    } else {
        Err(ImageVmError::ImageReferenceError(format!(
            "invalid tag: {tag}"
        )))
    }
}

/// Splits off the registry if the first path segment looks like a host.
fn extract_registry_and_path<'a>(reference: &'a str, default_registry: &str) -> (String, &'a str) {
    match reference.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest)
        }
        _ => (default_registry.to_string(), reference),
    }
}

/// Splits the repository from an optional tag. Docker Hub repositories without a namespace get
/// `library/`.
fn extract_repository_and_tag(
    path: &str,
    registry: &str,
) -> ImageVmResult<(String, Option<String>)> {
    let (repo_part, tag) = match path.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
        _ => (path, None),
    };

    if repo_part.is_empty() {
        return Err(ImageVmError::ImageReferenceError(
            "repository is empty".into(),
        ));
    }

    let repository = if !repo_part.contains('/') && registry == "docker.io" {
        format!("{DEFAULT_OCI_REFERENCE_REPO_NAMESPACE}/{repo_part}")
    } else {
        repo_part.to_string()
    };

    Ok((repository, tag))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:9b8ba1bca4a8ea47c5a5e8f7b3c6dc6c3d2b1de35e2d1da1c6bd7bd64e9d4f7c";

    #[test]
    fn test_reference_valid_reference_with_registry_and_tag() -> anyhow::Result<()> {
        let reference = "docker.io/library/alpine:3.12".parse::<Reference>()?;
        assert_eq!(reference.get_registry(), "docker.io");
        assert_eq!(reference.get_repository(), "library/alpine");
        assert_eq!(reference.get_selector(), &ReferenceSelector::tag("3.12"));
        assert_eq!(reference.manifest_reference(), "3.12");
        assert_eq!(reference.to_string(), "docker.io/library/alpine:3.12");
        Ok(())
    }

    #[test]
    fn test_reference_docker_hub_short_name() -> anyhow::Result<()> {
        let reference = "docker.io/ubuntu".parse::<Reference>()?;
        assert_eq!(reference.get_repository(), "library/ubuntu");
        assert_eq!(
            reference.get_selector(),
            &ReferenceSelector::tag(DEFAULT_OCI_REFERENCE_TAG)
        );
        Ok(())
    }

    #[test]
    fn test_reference_registry_with_port_keeps_repository() -> anyhow::Result<()> {
        let reference = "localhost:5000/myimage:v1".parse::<Reference>()?;
        assert_eq!(reference.get_registry(), "localhost:5000");
        assert_eq!(reference.get_repository(), "myimage");
        assert_eq!(reference.manifest_reference(), "v1");

        let reference = "localhost:5000/team/myimage".parse::<Reference>()?;
        assert_eq!(reference.get_repository(), "team/myimage");
        assert_eq!(reference.manifest_reference(), DEFAULT_OCI_REFERENCE_TAG);
        Ok(())
    }

    #[test]
    fn test_reference_with_digest() -> anyhow::Result<()> {
        let reference = format!("docker.io/library/alpine@{DIGEST}").parse::<Reference>()?;
        assert!(matches!(
            reference.get_selector(),
            ReferenceSelector::Digest(_)
        ));
        assert_eq!(reference.manifest_reference(), DIGEST);
        assert_eq!(
            reference.to_string(),
            format!("docker.io/library/alpine@{DIGEST}")
        );

        let reference = format!("docker.io/library/alpine:3.20@{DIGEST}").parse::<Reference>()?;
        assert_eq!(reference.manifest_reference(), DIGEST);
        assert_eq!(
            reference.pinned_digest().map(|d| d.to_string()),
            Some(DIGEST.to_string())
        );
        Ok(())
    }

    #[test]
    fn test_reference_invalid_inputs() {
        for input in [
            "",
            "   ",
            "docker.io/Alpine:latest",
            "docker.io/library/alpine:-bad",
            "docker.io/library/alpine@sha256",
            "docker.io/:latest",
        ] {
            assert!(
                matches!(
                    input.parse::<Reference>(),
                    Err(ImageVmError::ImageReferenceError(_))
                ),
                "expected {input:?} to be rejected"
            );
        }
    }
}
