use std::path::Path;

use oci_spec::image::DigestAlgorithm;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{ImageVmError, ImageVmResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Hasher {
    fn new(algorithm: &DigestAlgorithm) -> ImageVmResult<Self> {
        match algorithm {
            DigestAlgorithm::Sha256 => Ok(Self::Sha256(Sha256::new())),
            DigestAlgorithm::Sha384 => Ok(Self::Sha384(Sha384::new())),
            DigestAlgorithm::Sha512 => Ok(Self::Sha512(Sha512::new())),
            _ => Err(ImageVmError::UnsupportedDigestAlgorithm(
                algorithm.to_string(),
            )),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Gets the hash of a file, reading it in chunks.
pub async fn get_file_hash(path: &Path, algorithm: &DigestAlgorithm) -> ImageVmResult<Vec<u8>> {
    let mut hasher = Hasher::new(algorithm)?;
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Gets the hash of an in-memory buffer.
pub fn get_bytes_hash(bytes: &[u8], algorithm: &DigestAlgorithm) -> ImageVmResult<Vec<u8>> {
    let mut hasher = Hasher::new(algorithm)?;
    hasher.update(bytes);
    Ok(hasher.finalize())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_file_hash_matches_bytes_hash() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("blob");
        let content = b"hello imagevm".repeat(10_000);
        tokio::fs::write(&path, &content).await?;

        let from_file = get_file_hash(&path, &DigestAlgorithm::Sha256).await?;
        let from_bytes = get_bytes_hash(&content, &DigestAlgorithm::Sha256)?;
        assert_eq!(from_file, from_bytes);

        Ok(())
    }

    #[test]
    fn test_bytes_hash_known_value() -> anyhow::Result<()> {
        let hash = get_bytes_hash(b"", &DigestAlgorithm::Sha256)?;
        assert_eq!(
            hex::encode(hash),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        Ok(())
    }
}
