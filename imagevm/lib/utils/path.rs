//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where imagevm keeps its data.
pub const IMAGEVM_HOME_DIR: &str = ".imagevm";

/// The sub directory of the imagevm home that holds the OCI content store.
pub const OCI_SUBDIR: &str = "oci";

/// The sub directory of a namespace that holds content-addressed blobs.
pub const BLOBS_SUBDIR: &str = "blobs";

/// The file name of an OCI image layout index.
pub const OCI_INDEX_FILENAME: &str = "index.json";

/// The file name of the OCI image layout marker.
pub const OCI_LAYOUT_FILENAME: &str = "oci-layout";

/// The suffix used for blobs that are still being downloaded.
pub const PARTIAL_BLOB_SUFFIX: &str = ".partial";
