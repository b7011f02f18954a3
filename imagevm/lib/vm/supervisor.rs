use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use getset::Getters;
use nix::{sys::signal::Signal, unistd::Pid};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{ImageVmError, ImageVmResult};

use super::{ApiAction, FirecrackerApi, MachineConfig, VmEvent, VmState};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where Firecracker's stdout and stderr go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VmmStdio {
    /// Shared with this process, so the guest console shows up in the terminal.
    #[default]
    Inherit,

    /// Discarded.
    Null,

    /// Appended to a file.
    File(PathBuf),
}

/// Launches Firecracker, boots a microVM and makes sure the process is gone on every exit path.
///
/// ```text
/// NotStarted -> Starting -> Running -> Stopped
///                    \          \
///                     +----------+--> Failed
/// ```
///
/// [`stop`][Self::stop] is safe in every state and may be called any number of times. The child
/// is spawned with kill-on-drop, so dropping a supervisor never leaks the process.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmSupervisor {
    /// The Firecracker binary.
    firecracker_path: PathBuf,

    /// The API socket.
    socket_path: PathBuf,

    /// Where Firecracker's output goes.
    stdio: VmmStdio,

    /// How long to wait for the API socket to appear, and then for the API to accept the
    /// configuration and boot request.
    socket_wait_timeout: Duration,

    /// How long to wait for the guest to shut down before killing the process.
    shutdown_timeout: Duration,

    /// The current lifecycle state.
    state: VmState,

    #[getset(skip)]
    child: Option<Child>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmSupervisor {
    /// Creates a supervisor. Nothing is launched until [`start`][Self::start].
    pub fn new(
        firecracker_path: impl Into<PathBuf>,
        socket_path: impl Into<PathBuf>,
        stdio: VmmStdio,
        socket_wait_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            firecracker_path: firecracker_path.into(),
            socket_path: socket_path.into(),
            stdio,
            socket_wait_timeout,
            shutdown_timeout,
            state: VmState::NotStarted,
            child: None,
        }
    }

    /// Launches Firecracker, applies `config` and boots the guest.
    ///
    /// On failure the process is killed, the socket removed, the state becomes
    /// [`Failed`][VmState::Failed] and [`VmStartFailed`][ImageVmError::VmStartFailed] is returned.
    pub async fn start(&mut self, config: &MachineConfig) -> ImageVmResult<()> {
        if self.state != VmState::NotStarted {
            return Err(ImageVmError::VmStartFailed(format!(
                "vm already {}",
                self.state
            )));
        }

        match self.launch_and_boot(config).await {
            Ok(()) => {
                self.apply(VmEvent::Booted);
                tracing::info!(socket = %self.socket_path.display(), "vm running");
                Ok(())
            }
            Err(reason) => {
                tracing::error!("failed to start vm: {reason}");
                self.kill_child().await;
                self.remove_socket().await;
                self.apply(VmEvent::Faulted);
                Err(ImageVmError::VmStartFailed(reason))
            }
        }
    }

    /// Blocks until the Firecracker process exits.
    ///
    /// A non-zero exit is a [`VmRuntimeError`][ImageVmError::VmRuntimeError]. If `cancel` fires
    /// first, the VM is stopped in an orderly way and
    /// [`CancelledByCaller`][ImageVmError::CancelledByCaller] is returned.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> ImageVmResult<ExitStatus> {
        if self.state != VmState::Running {
            return Err(ImageVmError::VmRuntimeError(format!(
                "cannot wait on a vm that is {}",
                self.state
            )));
        }

        let Some(child) = self.child.as_mut() else {
            return Err(ImageVmError::VmRuntimeError("no vm process".to_string()));
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                tracing::info!("cancellation requested, stopping vm");
                if let Err(e) = self.stop().await {
                    tracing::error!("failed to stop vm after cancellation: {e}");
                }
                return Err(ImageVmError::CancelledByCaller);
            }
        };

        self.child = None;
        self.apply(VmEvent::Exited);
        self.remove_socket().await;

        let status = status
            .map_err(|e| ImageVmError::VmRuntimeError(format!("failed to wait on vm: {e}")))?;
        if status.success() {
            tracing::info!("vm exited successfully");
            Ok(status)
        } else {
            tracing::error!("vm exited with {status}");
            Err(ImageVmError::VmRuntimeError(format!("vm exited with {status}")))
        }
    }

    /// Stops the VM: Ctrl-Alt-Del if the guest is running, SIGTERM otherwise or when the API does
    /// not answer within the shutdown timeout, then SIGKILL once the shutdown timeout passes again.
    /// Removes the API socket.
    ///
    /// Without a process this does nothing and succeeds.
    pub async fn stop(&mut self) -> ImageVmResult<()> {
        let Some(mut child) = self.child.take() else {
            self.apply(VmEvent::Exited);
            return Ok(());
        };

        if self.state == VmState::Running {
            let api = FirecrackerApi::new(&self.socket_path);
            let request = api.action(ApiAction::SendCtrlAltDel);
            let answered = match tokio::time::timeout(self.shutdown_timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(ImageVmError::VmRuntimeError(format!(
                    "shutdown request not answered within {:?}",
                    self.shutdown_timeout
                ))),
            };

            if let Err(e) = answered {
                tracing::warn!("graceful vm shutdown request failed, sending SIGTERM: {e}");
                if let Err(e) = signal_child(&child, Signal::SIGTERM) {
                    tracing::warn!("{e}");
                }
            }
        } else if let Err(e) = signal_child(&child, Signal::SIGTERM) {
            tracing::warn!("{e}");
        }

        let exited = tokio::time::timeout(self.shutdown_timeout, child.wait()).await;
        let result = match exited {
            Ok(Ok(status)) => {
                tracing::info!("vm stopped with {status}");
                Ok(())
            }
            Ok(Err(e)) => Err(ImageVmError::VmRuntimeError(format!(
                "failed to wait on vm: {e}"
            ))),
            Err(_) => {
                tracing::warn!(
                    "vm did not stop within {:?}, killing it",
                    self.shutdown_timeout
                );
                child
                    .kill()
                    .await
                    .map_err(|e| ImageVmError::VmRuntimeError(format!("failed to kill vm: {e}")))
            }
        };

        self.apply(VmEvent::Exited);
        self.remove_socket().await;
        result
    }

    async fn launch_and_boot(&mut self, config: &MachineConfig) -> Result<(), String> {
        if config.get_socket_path() != &self.socket_path {
            return Err(format!(
                "machine config socket {} does not match supervisor socket {}",
                config.get_socket_path().display(),
                self.socket_path.display()
            ));
        }

        self.remove_socket().await;

        let (stdout, stderr) = self
            .stdio_handles()
            .map_err(|e| format!("failed to open vmm output: {e}"))?;

        tracing::info!(
            "launching {} --api-sock {}",
            self.firecracker_path.display(),
            self.socket_path.display()
        );

        let child = Command::new(&self.firecracker_path)
            .arg("--api-sock")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                format!(
                    "failed to launch {}: {e}",
                    self.firecracker_path.display()
                )
            })?;
        self.child = Some(child);
        self.apply(VmEvent::Launched);

        self.wait_for_socket().await?;

        let api = FirecrackerApi::new(&self.socket_path);
        let boot = async {
            api.configure(config)
                .await
                .map_err(|e| format!("configuration rejected: {e}"))?;
            api.action(ApiAction::InstanceStart)
                .await
                .map_err(|e| format!("instance start rejected: {e}"))
        };

        tokio::time::timeout(self.socket_wait_timeout, boot)
            .await
            .map_err(|_| {
                format!(
                    "firecracker api did not answer within {:?}",
                    self.socket_wait_timeout
                )
            })?
    }

    /// Polls for the API socket, failing if the process exits or the timeout passes.
    async fn wait_for_socket(&mut self) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + self.socket_wait_timeout;

        loop {
            if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
                return Ok(());
            }

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(format!("firecracker exited early with {status}"));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "api socket {} did not appear within {:?}",
                    self.socket_path.display(),
                    self.socket_wait_timeout
                ));
            }

            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    fn stdio_handles(&self) -> std::io::Result<(Stdio, Stdio)> {
        Ok(match &self.stdio {
            VmmStdio::Inherit => (Stdio::inherit(), Stdio::inherit()),
            VmmStdio::Null => (Stdio::null(), Stdio::null()),
            VmmStdio::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                (Stdio::from(file.try_clone()?), Stdio::from(file))
            }
        })
    }

    async fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill firecracker: {e}");
            }
        }
    }

    async fn remove_socket(&self) {
        remove_socket_file(&self.socket_path).await;
    }

    fn apply(&mut self, event: VmEvent) {
        match self.state.transition(event) {
            Some(next) => self.state = next,
            None => tracing::debug!("ignoring {event:?} in state {}", self.state),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn signal_child(child: &Child, signal: Signal) -> ImageVmResult<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| ImageVmError::VmRuntimeError(format!("failed to send {signal}: {e}")))
}

async fn remove_socket_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("removed socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove socket {}: {e}", path.display()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
