use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use thiserror::Error;

use crate::{oci::DockerRegistryResponseError, pipeline::Stage};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an imagevm-related operation.
pub type ImageVmResult<T> = Result<T, ImageVmError>;

/// An error that occurred while turning an image into a running microVM.
#[derive(pretty_error_debug::Debug, Error)]
pub enum ImageVmError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error returned by a Docker registry.
    #[error("docker registry error: {0}")]
    DockerRegistry(#[from] DockerRegistryResponseError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    ImageReferenceError(String),

    /// The image is not present in the content store and could not be fetched.
    #[error("image not found: {reference}: {reason}")]
    ImageNotFound {
        /// The image reference that was requested.
        reference: String,

        /// Why the image could not be found.
        reason: String,
    },

    /// The image manifest (or index) could not be read or parsed.
    #[error("manifest unreadable for {reference}: {reason}")]
    ManifestUnreadable {
        /// The image reference whose manifest was requested.
        reference: String,

        /// Why the manifest could not be read.
        reason: String,
    },

    /// The image configuration blob could not be parsed.
    #[error("image config unparsable for {reference}: {reason}")]
    ConfigUnparsable {
        /// The image reference whose config was requested.
        reference: String,

        /// Why the config could not be parsed.
        reason: String,
    },

    /// A digest did not match the content it names.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the content was expected to have.
        expected: String,

        /// The digest the content actually has.
        actual: String,
    },

    /// An unsupported digest algorithm was used.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    /// The disk image file could not be allocated.
    #[error("failed to allocate disk image {path}: {reason}")]
    AllocationFailed {
        /// The path of the disk image.
        path: PathBuf,

        /// Why the allocation failed.
        reason: String,
    },

    /// The disk image could not be formatted.
    #[error("failed to format disk image {path}: {reason}")]
    FormatFailed {
        /// The path of the disk image.
        path: PathBuf,

        /// Why formatting failed.
        reason: String,
    },

    /// The disk image could not be mounted.
    #[error("failed to mount {path} at {mount_point}: {reason}")]
    MountFailed {
        /// The path of the disk image.
        path: PathBuf,

        /// The mount point.
        mount_point: PathBuf,

        /// Why mounting failed.
        reason: String,
    },

    /// A layer could not be applied onto the mounted rootfs.
    #[error("failed to apply layer {digest}: {reason}")]
    LayerApplyFailed {
        /// The digest of the layer that failed.
        digest: String,

        /// Why the layer could not be applied.
        reason: String,
    },

    /// The boot-init script could not be written.
    #[error("failed to write boot init script {path}: {source}")]
    InitScriptWriteFailed {
        /// The host path of the script.
        path: PathBuf,

        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The rootfs could not be unmounted.
    #[error("failed to unmount {mount_point}: {reason}")]
    UnmountFailed {
        /// The mount point.
        mount_point: PathBuf,

        /// Why unmounting failed.
        reason: String,
    },

    /// An unmount was requested for a mount point that is not mounted.
    #[error("not mounted: {0}")]
    NotMounted(PathBuf),

    /// The rootfs mount state machine was asked to make an illegal transition.
    #[error("invalid rootfs state transition from {from} to {to}")]
    InvalidMountTransition {
        /// The current state.
        from: String,

        /// The requested state.
        to: String,
    },

    /// The machine configuration is invalid.
    #[error("invalid machine configuration: {0}")]
    ConfigurationInvalid(String),

    /// The hypervisor could not be launched or configured.
    #[error("failed to start vm: {0}")]
    VmStartFailed(String),

    /// The hypervisor exited abnormally or could not be waited on.
    #[error("vm runtime error: {0}")]
    VmRuntimeError(String),

    /// The run was cancelled by the caller.
    #[error("cancelled by caller")]
    CancelledByCaller,

    /// A pipeline stage failed. Carries the originating error and every failure that happened
    /// while reverting host state afterwards.
    #[error("stage `{stage}` failed: {source}{}", format_cleanup_failures(.cleanup_failures))]
    StageFailed {
        /// The stage that failed.
        stage: Stage,

        /// The originating error.
        source: Box<ImageVmError>,

        /// Errors raised by cleanup actions during unwind.
        cleanup_failures: Vec<ImageVmError>,
    },
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageVmError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> ImageVmError {
        ImageVmError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps the error with the stage it happened in.
    pub fn in_stage(self, stage: Stage) -> ImageVmError {
        match self {
            ImageVmError::StageFailed { .. } => self,
            other => ImageVmError::StageFailed {
                stage,
                source: Box::new(other),
                cleanup_failures: Vec::new(),
            },
        }
    }

    /// Attaches cleanup failures to a stage failure. Other errors are wrapped as-is.
    pub fn with_cleanup_failures(self, failures: Vec<ImageVmError>) -> ImageVmError {
        if failures.is_empty() {
            return self;
        }

        match self {
            ImageVmError::StageFailed {
                stage,
                source,
                mut cleanup_failures,
            } => {
                cleanup_failures.extend(failures);
                ImageVmError::StageFailed {
                    stage,
                    source,
                    cleanup_failures,
                }
            }
            other => {
                tracing::warn!(
                    "dropping {} cleanup failure(s) attached to unstaged error: {}",
                    failures.len(),
                    other
                );
                other
            }
        }
    }

    /// Returns the originating error, looking through stage wrappers.
    pub fn root_cause(&self) -> &ImageVmError {
        match self {
            ImageVmError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the stage the error happened in, if known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ImageVmError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns the cleanup failures attached to this error.
    pub fn cleanup_failures(&self) -> &[ImageVmError] {
        match self {
            ImageVmError::StageFailed {
                cleanup_failures, ..
            } => cleanup_failures,
            _ => &[],
        }
    }

    /// Whether this error (or the error it wraps) is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), ImageVmError::CancelledByCaller)
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `ImageVmResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> ImageVmResult<T> {
    Result::Ok(value)
}

fn format_cleanup_failures(failures: &[ImageVmError]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let joined = failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");

    format!(" (cleanup also failed: {joined})")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stage_wrapping_keeps_root_cause() {
        let err = ImageVmError::LayerApplyFailed {
            digest: "sha256:abc".into(),
            reason: "truncated archive".into(),
        }
        .in_stage(Stage::ApplyLayers);

        assert_eq!(err.stage(), Some(Stage::ApplyLayers));
        assert!(matches!(
            err.root_cause(),
            ImageVmError::LayerApplyFailed { digest, .. } if digest == "sha256:abc"
        ));

        // Wrapping twice keeps the first stage
        let err = err.in_stage(Stage::Unmount);
        assert_eq!(err.stage(), Some(Stage::ApplyLayers));
    }

    #[test]
    fn test_error_cleanup_failures_do_not_replace_primary() {
        let err = ImageVmError::CancelledByCaller
            .in_stage(Stage::WaitVm)
            .with_cleanup_failures(vec![ImageVmError::UnmountFailed {
                mount_point: "/mnt".into(),
                reason: "device busy".into(),
            }]);

        assert!(err.is_cancelled());
        assert_eq!(err.cleanup_failures().len(), 1);

        let message = err.to_string();
        assert!(message.starts_with("stage `wait vm` failed: cancelled by caller"));
        assert!(message.contains("device busy"));
    }
}
