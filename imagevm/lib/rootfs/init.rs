use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use getset::Getters;
use tokio::{fs, io::AsyncWriteExt};
use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{ImageVmError, ImageVmResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The interpreter line every boot-init script starts with.
pub const BOOT_INIT_SHEBANG: &str = "#!/bin/sh";

/// The mode boot-init scripts are written with.
pub const BOOT_INIT_MODE: u32 = 0o755;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A shell script placed in the rootfs that exports the image environment and runs its command.
/// The guest kernel runs it as process 1.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BootInitScript {
    /// The script's path inside the guest filesystem.
    path: Utf8UnixPathBuf,

    /// The script content.
    content: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootInitScript {
    /// Creates the script for an image environment and boot command. `file_name` is relative to
    /// the root of the guest filesystem.
    pub fn new(file_name: &str, env: &[String], command: &[String]) -> ImageVmResult<Self> {
        let relative = Utf8UnixPathBuf::from(file_name);
        let is_relative = relative.components().next().is_some()
            && relative
                .components()
                .all(|c| matches!(c, Utf8UnixComponent::Normal(_)));
        if !is_relative {
            return Err(ImageVmError::ConfigurationInvalid(format!(
                "boot init file name must be a relative path inside the rootfs: {file_name:?}"
            )));
        }

        Ok(Self {
            path: Utf8UnixPathBuf::from("/").join(relative),
            content: Self::render(env, command),
        })
    }

    /// Renders the script: a shebang, one `export` per environment entry, then the command.
    pub fn render(env: &[String], command: &[String]) -> String {
        let mut script = format!("{BOOT_INIT_SHEBANG}\n");
        for entry in env {
            script.push_str("export ");
            script.push_str(entry);
            script.push('\n');
        }
        script.push_str(&command.join(" "));
        script.push('\n');
        script
    }

    /// The script's host path when the guest filesystem is mounted at `root`.
    pub fn host_path(&self, root: &Path) -> PathBuf {
        self.path
            .components()
            .filter_map(|c| match c {
                Utf8UnixComponent::Normal(part) => Some(part),
                _ => None,
            })
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }

    /// Writes the script under `root` with mode 0755, creating parent directories. A symlink at
    /// the target is replaced, never followed.
    pub async fn write(&self, root: &Path) -> ImageVmResult<PathBuf> {
        let host_path = self.host_path(root);
        self.write_at(&host_path)
            .await
            .map_err(|source| ImageVmError::InitScriptWriteFailed {
                path: host_path.clone(),
                source,
            })?;

        tracing::debug!("wrote boot init script {}", host_path.display());
        Ok(host_path)
    }

    async fn write_at(&self, host_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::symlink_metadata(host_path).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                fs::remove_file(host_path).await?;
            }
            Ok(metadata) if metadata.is_dir() => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a directory exists at the boot init path",
                ));
            }
            _ => {}
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(BOOT_INIT_MODE)
            .open(host_path)
            .await?;
        file.write_all(self.content.as_bytes()).await?;
        file.flush().await?;

        // The create mode is subject to the umask and does not apply to existing files
        fs::set_permissions(host_path, std::fs::Permissions::from_mode(BOOT_INIT_MODE)).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_init_render_exact_content() {
        let script = BootInitScript::render(
            &["FOO=bar".to_string()],
            &["/bin/echo".to_string(), "hi".to_string()],
        );
        assert_eq!(script, "#!/bin/sh\nexport FOO=bar\n/bin/echo hi\n");
    }

    #[test]
    fn test_boot_init_render_empty_env_and_command() {
        assert_eq!(BootInitScript::render(&[], &[]), "#!/bin/sh\n\n");
    }

    #[test]
    fn test_boot_init_guest_path() -> anyhow::Result<()> {
        let script = BootInitScript::new("sbin/custom.init", &[], &[])?;
        assert_eq!(script.get_path().as_str(), "/sbin/custom.init");
        assert_eq!(
            script.host_path(Path::new("/mnt")),
            PathBuf::from("/mnt/sbin/custom.init")
        );

        assert!(BootInitScript::new("../escape", &[], &[]).is_err());
        assert!(BootInitScript::new("/abs", &[], &[]).is_err());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_boot_init_write_replaces_symlink() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let outside = tempfile::tempdir()?;
        let victim = outside.path().join("victim");
        std::fs::write(&victim, "untouched")?;
        std::os::unix::fs::symlink(&victim, root.path().join("custom.init"))?;

        let script = BootInitScript::new("custom.init", &[], &["/bin/true".to_string()])?;
        let written = script.write(root.path()).await?;

        assert!(!std::fs::symlink_metadata(&written)?.file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&victim)?, "untouched");
        assert_eq!(std::fs::read_to_string(&written)?, "#!/bin/sh\n/bin/true\n");

        Ok(())
    }
}
