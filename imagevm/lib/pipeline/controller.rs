use std::process::ExitStatus;

use tokio_util::sync::CancellationToken;

use crate::{
    config::PipelineConfig,
    oci::{resolve_image, ContentStore, Reference, ResolvedImage},
    rootfs::{BootInitScript, RootfsBuilder, RootfsHost, RootfsImage},
    vm::{translate, InitCommand, MachineConfig, VmSupervisor},
    ImageVmError, ImageVmResult,
};

use super::{CleanupStack, Guard, RunResources, Stage};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs an image as a microVM, one stage at a time.
///
/// The controller owns the only cross-stage state of a run. Each stage that changes host state
/// registers a [`Guard`]; when a later stage fails, the run's cancellation scope is cancelled and
/// the guards are unwound in reverse before the error is returned wrapped in
/// [`StageFailed`][ImageVmError::StageFailed].
///
/// Cancelling [`cancellation_token`][Self::cancellation_token] stops a run at the next stage
/// boundary, between layers, or while waiting on the VM.
pub struct PipelineController<S, H>
where
    S: ContentStore,
    H: RootfsHost,
{
    config: PipelineConfig,
    store: S,
    host: H,
    cancel: CancellationToken,
}

type StageResult<T> = Result<T, (Stage, ImageVmError)>;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S, H> PipelineController<S, H>
where
    S: ContentStore,
    H: RootfsHost,
{
    /// Creates a controller over a content store and a rootfs host.
    pub fn new(config: PipelineConfig, store: S, host: H) -> Self {
        Self {
            config,
            store,
            host,
            cancel: CancellationToken::new(),
        }
    }

    /// The token that cancels every run of this controller.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The configuration runs use.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The content store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The rootfs host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Resolves `image`, fetching it into the content store if needed.
    pub async fn pull(&self, image: &str) -> ImageVmResult<ResolvedImage> {
        self.resolve(image).await.map_err(|(stage, e)| e.in_stage(stage))
    }

    /// Resolves `image` and builds its rootfs without booting it.
    pub async fn build(&self, image: &str) -> ImageVmResult<RootfsImage> {
        let resolved = self.pull(image).await?;
        let run = self.cancel.child_token();
        let mut resources = RunResources::new(self.rootfs_builder());
        let mut cleanup = CleanupStack::default();

        let result = self
            .build_rootfs(&resolved, &mut resources, &mut cleanup, &run)
            .await;

        match result {
            Ok(()) => Ok(resources.rootfs.into_image()),
            Err(failure) => Err(self.abort(failure, &mut resources, &mut cleanup, &run).await),
        }
    }

    /// Resolves `image`, builds its rootfs, boots it and waits for the VM to exit.
    pub async fn run(&self, image: &str) -> ImageVmResult<ExitStatus> {
        let resolved = self.pull(image).await?;
        let run = self.cancel.child_token();
        let mut resources = RunResources::new(self.rootfs_builder());
        let mut cleanup = CleanupStack::default();

        let result: StageResult<ExitStatus> = async {
            self.build_rootfs(&resolved, &mut resources, &mut cleanup, &run)
                .await?;
            let machine = self
                .machine_config(&resolved, resources.rootfs.image())
                .map_err(|e| (Stage::Translate, e))?;
            self.boot(&machine, &mut resources, &mut cleanup, &run).await
        }
        .await;

        match result {
            Ok(status) => Ok(status),
            Err(failure) => Err(self.abort(failure, &mut resources, &mut cleanup, &run).await),
        }
    }

    async fn resolve(&self, image: &str) -> StageResult<ResolvedImage> {
        self.config
            .validate()
            .map_err(|e| (Stage::Validate, e))?;
        check_cancelled(&self.cancel, Stage::Resolve)?;

        let reference = image
            .parse::<Reference>()
            .map_err(|e| (Stage::Resolve, e))?;

        tracing::info!(reference = %reference, "pulling image");
        resolve_image(
            &self.store,
            self.config.get_namespace(),
            &reference,
            self.config.get_platform(),
            *self.config.get_pull(),
        )
        .await
        .map_err(|e| (Stage::Resolve, e))
    }

    async fn build_rootfs(
        &self,
        resolved: &ResolvedImage,
        resources: &mut RunResources<'_, H>,
        cleanup: &mut CleanupStack,
        run: &CancellationToken,
    ) -> StageResult<()> {
        let rootfs = &mut resources.rootfs;
        let config = resolved.get_config();

        // Built before any host change so a bad file name never allocates
        tracing::info!(command = %config.command_line(), "extracting init command");
        let script = if self.writes_boot_init(resolved) {
            Some(
                BootInitScript::new(
                    self.config.get_boot_init_file_name(),
                    config.get_env(),
                    config.get_command(),
                )
                .map_err(|e| (Stage::WriteBootInit, e))?,
            )
        } else {
            if *self.config.get_generate_boot_init() {
                tracing::info!("image has no command, skipping boot init script");
            }
            None
        };

        tracing::info!(path = %rootfs.image().get_path().display(), "creating rootfs");
        check_cancelled(run, Stage::Allocate)?;
        rootfs.allocate().await.map_err(|e| (Stage::Allocate, e))?;
        cleanup.push(Guard::DiskImage);

        check_cancelled(run, Stage::Format)?;
        rootfs.format().await.map_err(|e| (Stage::Format, e))?;

        check_cancelled(run, Stage::Mount)?;
        rootfs.mount().await.map_err(|e| (Stage::Mount, e))?;
        cleanup.push(Guard::Mount);

        tracing::info!(
            mount_point = %rootfs.image().get_mount_point().display(),
            "unpacking image"
        );
        rootfs
            .apply_layers(
                &self.store,
                self.config.get_namespace(),
                resolved.get_layers(),
                run,
            )
            .await
            .map_err(|e| (Stage::ApplyLayers, e))?;

        if let Some(script) = &script {
            check_cancelled(run, Stage::WriteBootInit)?;
            tracing::info!(path = %script.get_path(), "generating boot init script");
            rootfs
                .write_boot_init(script)
                .await
                .map_err(|e| (Stage::WriteBootInit, e))?;
        }

        rootfs.unmount().await.map_err(|e| (Stage::Unmount, e))?;
        cleanup.disarm(Guard::Mount);
        cleanup.disarm(Guard::DiskImage);

        tracing::info!(path = %rootfs.image().get_path().display(), "rootfs ready");
        Ok(())
    }

    /// What the guest kernel runs as init for `resolved`.
    ///
    /// The boot-init script when one is written, otherwise the image command. An image without a
    /// command never gets a script, so its kernel command line carries no `init=`.
    pub fn init_command(&self, resolved: &ResolvedImage) -> InitCommand {
        if self.writes_boot_init(resolved) {
            InitCommand::Script(self.config.get_boot_init_arg().clone())
        } else {
            InitCommand::Command(resolved.get_config().get_command().clone())
        }
    }

    /// Translates `resolved` and a built `rootfs` into the machine configuration a run boots.
    pub fn machine_config(
        &self,
        resolved: &ResolvedImage,
        rootfs: &RootfsImage,
    ) -> ImageVmResult<MachineConfig> {
        translate(&self.init_command(resolved), rootfs, &self.config)
    }

    fn writes_boot_init(&self, resolved: &ResolvedImage) -> bool {
        *self.config.get_generate_boot_init() && !resolved.get_config().get_command().is_empty()
    }

    async fn boot(
        &self,
        machine: &MachineConfig,
        resources: &mut RunResources<'_, H>,
        cleanup: &mut CleanupStack,
        run: &CancellationToken,
    ) -> StageResult<ExitStatus> {
        check_cancelled(run, Stage::StartVm)?;

        let vm = resources.vm.insert(VmSupervisor::new(
            self.config.get_firecracker_path().clone(),
            machine.get_socket_path().clone(),
            self.config.get_vmm_stdio().clone(),
            *self.config.get_socket_wait_timeout(),
            *self.config.get_shutdown_timeout(),
        ));
        cleanup.push(Guard::Vm);

        tracing::info!(kernel_args = %machine.get_kernel_args(), "starting VM");
        vm.start(machine).await.map_err(|e| (Stage::StartVm, e))?;

        let status = vm.wait(run).await.map_err(|e| (Stage::WaitVm, e))?;
        cleanup.disarm(Guard::Vm);

        Ok(status)
    }

    fn rootfs_builder(&self) -> RootfsBuilder<'_, H> {
        RootfsBuilder::new(
            &self.host,
            RootfsImage::new(
                self.config.get_rootfs_path().clone(),
                *self.config.get_rootfs_size_bytes(),
                *self.config.get_filesystem(),
                self.config.get_mount_point().clone(),
            ),
            *self.config.get_overwrite_rootfs(),
            *self.config.get_preserve_ownership(),
        )
    }

    /// Cancels the run, unwinds its guards and wraps the error with its stage.
    async fn abort(
        &self,
        (stage, error): (Stage, ImageVmError),
        resources: &mut RunResources<'_, H>,
        cleanup: &mut CleanupStack,
        run: &CancellationToken,
    ) -> ImageVmError {
        tracing::error!("stage {stage} failed: {error}");
        run.cancel();

        let failures = cleanup.unwind(resources).await;
        error.in_stage(stage).with_cleanup_failures(failures)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn check_cancelled(token: &CancellationToken, stage: Stage) -> StageResult<()> {
    if token.is_cancelled() {
        Err((stage, ImageVmError::CancelledByCaller))
    } else {
        Ok(())
    }
}
