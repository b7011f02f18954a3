use std::{
    collections::HashSet,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use imagevm::{
    config::PipelineConfig,
    oci::{OciStore, Reference},
    pipeline::{PipelineController, Stage},
    rootfs::{FilesystemKind, MountState, RootfsHost},
    utils,
    vm::InitCommand,
    ImageVmError, ImageVmResult,
};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, DigestAlgorithm, ImageManifestBuilder, MediaType,
    SCHEMA_VERSION,
};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const NAMESPACE: &str = "pipeline-test";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A rootfs host backed by a plain directory. Mounting only records the mount point, so layers
/// land in the mount point directory itself.
#[derive(Default)]
struct DirHost {
    mounted: Mutex<HashSet<PathBuf>>,
    allocations: AtomicUsize,
}

/// A temporary workspace with a content store, a disk image path and a mount point.
struct Fixture {
    dir: TempDir,
    store: OciStore,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirHost {
    fn is_mounted(&self, mount_point: &Path) -> bool {
        self.mounted
            .lock()
            .map(|m| m.contains(mount_point))
            .unwrap_or(false)
    }
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("mnt"))?;
        let store = OciStore::new(dir.path().join("store"));
        Ok(Self { dir, store })
    }

    fn disk(&self) -> PathBuf {
        self.dir.path().join("disk.img")
    }

    fn mount_point(&self) -> PathBuf {
        self.dir.path().join("mnt")
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::builder()
            .namespace(NAMESPACE)
            .store_path(self.dir.path().join("store"))
            .rootfs_path(self.disk())
            .rootfs_size_bytes(16 * 1024 * 1024)
            .mount_point(self.mount_point())
            .firecracker_socket(self.dir.path().join("fc.sock"))
            .socket_wait_timeout(Duration::from_millis(500))
            .shutdown_timeout(Duration::from_millis(500))
            .build()
    }

    async fn blob(&self, media_type: MediaType, bytes: &[u8]) -> anyhow::Result<Descriptor> {
        let hash = utils::get_bytes_hash(bytes, &DigestAlgorithm::Sha256)?;
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode(hash)))?;
        self.store.write_blob(NAMESPACE, &digest, bytes).await?;

        Ok(DescriptorBuilder::default()
            .media_type(media_type)
            .size(bytes.len() as u64)
            .digest(digest)
            .build()?)
    }

    /// Stores an image made of `layers` with the given entrypoint and env, tagged as `image`.
    async fn image(
        &self,
        image: &str,
        entrypoint: &[&str],
        env: &[&str],
        layers: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Descriptor>> {
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Entrypoint": entrypoint, "Env": env },
            "rootfs": { "type": "layers", "diff_ids": [] }
        });
        let config = self
            .blob(MediaType::ImageConfig, &serde_json::to_vec(&config)?)
            .await?;

        let mut layer_descriptors = Vec::new();
        for layer in layers {
            layer_descriptors.push(self.blob(MediaType::ImageLayerGzip, layer).await?);
        }

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(layer_descriptors.clone())
            .build()?;
        let manifest = self
            .blob(MediaType::ImageManifest, &serde_json::to_vec(&manifest)?)
            .await?;

        self.store
            .tag(NAMESPACE, &Reference::from_str(image)?, &manifest)
            .await?;

        Ok(layer_descriptors)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RootfsHost for DirHost {
    async fn allocate(&self, path: &Path, size_bytes: u64, overwrite: bool) -> ImageVmResult<()> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        if path.exists() && !overwrite {
            return Err(ImageVmError::AllocationFailed {
                path: path.to_path_buf(),
                reason: "file already exists".into(),
            });
        }

        let file = std::fs::File::create(path)?;
        file.set_len(size_bytes)?;
        Ok(())
    }

    async fn format(&self, _: &Path, _: FilesystemKind) -> ImageVmResult<()> {
        Ok(())
    }

    async fn mount(&self, path: &Path, mount_point: &Path) -> ImageVmResult<()> {
        let mut mounted = self.mounted.lock().map_err(|e| ImageVmError::MountFailed {
            path: path.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason: e.to_string(),
        })?;

        if !mount_point.is_dir() || !mounted.insert(mount_point.to_path_buf()) {
            return Err(ImageVmError::MountFailed {
                path: path.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason: "mount point unusable".into(),
            });
        }

        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> ImageVmResult<()> {
        let removed = self
            .mounted
            .lock()
            .map(|mut m| m.remove(mount_point))
            .unwrap_or(false);

        if removed {
            Ok(())
        } else {
            Err(ImageVmError::NotMounted(mount_point.to_path_buf()))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn tar_of(entries: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = Header::new_gnu();
        header.set_path(path)?;
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, content.as_bytes())?;
    }

    Ok(builder.into_inner()?)
}

fn layer(entries: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_of(entries)?)?;
    Ok(encoder.finish()?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_build_applies_layers_in_manifest_order() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image(
            "docker.io/library/ordered:1",
            &["/bin/echo", "hi"],
            &["FOO=bar"],
            &[
                layer(&[("a", "from l0"), ("c", "kept")])?,
                layer(&[(".wh.a", ""), ("b", "from l1")])?,
            ],
        )
        .await?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    let rootfs = controller.build("docker.io/library/ordered:1").await?;

    let root = fixture.mount_point();
    assert_eq!(rootfs.get_state(), &MountState::Unmounted);
    assert!(!controller.host().is_mounted(&root));
    assert!(!root.join("a").exists());
    assert_eq!(std::fs::read_to_string(root.join("b"))?, "from l1");
    assert_eq!(std::fs::read_to_string(root.join("c"))?, "kept");

    let script = root.join("custom.init");
    assert_eq!(
        std::fs::read_to_string(&script)?,
        "#!/bin/sh\nexport FOO=bar\n/bin/echo hi\n"
    );
    assert_eq!(
        std::fs::metadata(&script)?.permissions().mode() & 0o777,
        0o755
    );
    assert_eq!(
        std::fs::metadata(fixture.disk())?.len(),
        16 * 1024 * 1024
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_layer_failure_leaves_rootfs_unmounted() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let good = layer(&[("a", "ok")])?;
    let broken = tar_of(&[("big", &"x".repeat(4096))])?[..600].to_vec();

    let layers = fixture
        .image("docker.io/library/broken:1", &["/bin/true"], &[], &[good, broken])
        .await?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    let err = controller
        .build("docker.io/library/broken:1")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected the build to fail"))?;

    assert_eq!(err.stage(), Some(Stage::ApplyLayers));
    assert!(matches!(
        err.root_cause(),
        ImageVmError::LayerApplyFailed { digest, .. } if *digest == layers[1].digest().to_string()
    ));
    assert!(err.cleanup_failures().is_empty());

    // A second unmount finds nothing mounted
    let again = controller.host().unmount(&fixture.mount_point()).await;
    assert!(matches!(again, Err(ImageVmError::NotMounted(_))));

    // The incomplete disk image is removed
    assert!(!fixture.disk().exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_empty_image_builds_and_boots_without_init() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image("docker.io/library/empty:1", &[], &[], &[])
        .await?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    assert!(*controller.config().get_generate_boot_init());

    let rootfs = controller.build("docker.io/library/empty:1").await?;
    assert_eq!(rootfs.get_state(), &MountState::Unmounted);
    assert_eq!(std::fs::read_dir(fixture.mount_point())?.count(), 0);

    let resolved = controller.pull("docker.io/library/empty:1").await?;
    assert_eq!(
        controller.init_command(&resolved),
        InitCommand::Command(vec![])
    );

    let machine = controller.machine_config(&resolved, &rootfs)?;
    assert_eq!(
        machine.get_kernel_args(),
        "console=ttyS0 reboot=k panic=1 pci=off"
    );
    assert_eq!(machine.get_drives()[0].get_path_on_host(), &fixture.disk());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_image_command_boots_through_boot_init_script() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image("docker.io/library/cmd:1", &["/bin/sleep", "1"], &[], &[])
        .await?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    let rootfs = controller.build("docker.io/library/cmd:1").await?;
    let resolved = controller.pull("docker.io/library/cmd:1").await?;

    let machine = controller.machine_config(&resolved, &rootfs)?;
    assert_eq!(
        machine.get_kernel_args(),
        "console=ttyS0 reboot=k panic=1 pci=off init=\"/custom.init\""
    );
    assert!(fixture.mount_point().join("custom.init").is_file());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unknown_image_is_not_found_before_allocation() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );

    let err = controller
        .run("docker.io/library/does-not-exist:1")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected the run to fail"))?;

    assert_eq!(err.stage(), Some(Stage::Resolve));
    assert!(matches!(err.root_cause(), ImageVmError::ImageNotFound { .. }));
    assert_eq!(controller.host().allocations.load(Ordering::SeqCst), 0);
    assert!(!fixture.disk().exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_missing_firecracker_fails_to_start_without_hanging() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image("docker.io/library/boot:1", &["/bin/sh"], &[], &[layer(&[("etc/hostname", "vm")])?])
        .await?;

    let config = PipelineConfig::builder()
        .namespace(NAMESPACE)
        .rootfs_path(fixture.disk())
        .rootfs_size_bytes(1024 * 1024)
        .mount_point(fixture.mount_point())
        .firecracker_path(fixture.dir.path().join("no-such-firecracker"))
        .firecracker_socket(fixture.dir.path().join("fc.sock"))
        .build();
    let controller = PipelineController::new(
        config,
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );

    let result =
        tokio::time::timeout(Duration::from_secs(10), controller.run("docker.io/library/boot:1"))
            .await?;
    let err = result
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected the run to fail"))?;

    assert_eq!(err.stage(), Some(Stage::StartVm));
    assert!(matches!(err.root_cause(), ImageVmError::VmStartFailed(_)));
    assert!(!controller.host().is_mounted(&fixture.mount_point()));

    // The rootfs was complete before boot, so it is kept
    assert!(fixture.disk().exists());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_existing_disk_image_is_not_overwritten() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image("docker.io/library/reuse:1", &["/bin/true"], &[], &[])
        .await?;
    std::fs::write(fixture.disk(), "populated")?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    let err = controller
        .build("docker.io/library/reuse:1")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected the build to fail"))?;

    assert_eq!(err.stage(), Some(Stage::Allocate));
    assert_eq!(std::fs::read_to_string(fixture.disk())?, "populated");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_cancelled_controller_does_not_touch_the_host() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fixture
        .image("docker.io/library/cancel:1", &["/bin/true"], &[], &[])
        .await?;

    let controller = PipelineController::new(
        fixture.config(),
        OciStore::new(fixture.dir.path().join("store")),
        DirHost::default(),
    );
    controller.cancellation_token().cancel();

    let err = controller
        .build("docker.io/library/cancel:1")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected the build to be cancelled"))?;

    assert!(err.is_cancelled());
    assert_eq!(controller.host().allocations.load(Ordering::SeqCst), 0);

    Ok(())
}
