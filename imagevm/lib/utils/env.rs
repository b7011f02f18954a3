use std::path::PathBuf;

use crate::config::{DEFAULT_IMAGEVM_HOME, DEFAULT_OCI_REGISTRY};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the imagevm home directory.
pub const IMAGEVM_HOME_ENV_VAR: &str = "IMAGEVM_HOME";

/// Environment variable for the OCI registry domain used when a reference has none.
pub const OCI_REGISTRY_ENV_VAR: &str = "OCI_REGISTRY_DOMAIN";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path to the imagevm home directory.
///
/// Uses `IMAGEVM_HOME` if it is set, otherwise `~/.imagevm`.
pub fn get_imagevm_home() -> PathBuf {
    match std::env::var(IMAGEVM_HOME_ENV_VAR) {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => DEFAULT_IMAGEVM_HOME.clone(),
    }
}

/// Returns the domain of the OCI registry to use for references without one.
///
/// Uses `OCI_REGISTRY_DOMAIN` if it is set, otherwise `docker.io`.
pub fn get_oci_registry() -> String {
    match std::env::var(OCI_REGISTRY_ENV_VAR) {
        Ok(registry) if !registry.is_empty() => registry,
        _ => DEFAULT_OCI_REGISTRY.to_string(),
    }
}
