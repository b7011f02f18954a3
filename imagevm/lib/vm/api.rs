use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use crate::{ImageVmError, ImageVmResult};

use super::{Drive, MachineConfig};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for the Firecracker API served over a Unix socket.
///
/// Every request opens its own connection.
#[derive(Debug, Clone)]
pub struct FirecrackerApi {
    socket_path: PathBuf,
}

/// An action accepted by `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApiAction {
    /// Boots the guest.
    InstanceStart,

    /// Sends Ctrl-Alt-Del to the guest, asking it to shut down.
    SendCtrlAltDel,
}

#[derive(Serialize)]
struct ActionBody {
    action_type: ApiAction,
}

#[derive(Deserialize)]
struct ApiFault {
    fault_message: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerApi {
    /// Creates a client for the API socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Applies the machine sizing, boot source and drives of `config`.
    pub async fn configure(&self, config: &MachineConfig) -> ImageVmResult<()> {
        self.put("/machine-config", &config.machine_configuration_body())
            .await?;
        self.put("/boot-source", &config.boot_source_body()).await?;
        for drive in config.get_drives() {
            self.put_drive(drive).await?;
        }

        Ok(())
    }

    /// Attaches a drive.
    pub async fn put_drive(&self, drive: &Drive) -> ImageVmResult<()> {
        self.put(&format!("/drives/{}", drive.get_drive_id()), drive)
            .await
    }

    /// Performs an action.
    pub async fn action(&self, action: ApiAction) -> ImageVmResult<()> {
        self.put(
            "/actions",
            &ActionBody {
                action_type: action,
            },
        )
        .await
    }

    /// Sends `body` as JSON to `route` with `PUT`.
    ///
    /// A non-success response fails with the `fault_message` Firecracker reports, or the raw body
    /// when it has none.
    pub async fn put<T: Serialize + ?Sized>(&self, route: &str, body: &T) -> ImageVmResult<()> {
        let json = serde_json::to_vec(body)?;
        let (status, response) = self.send(Method::PUT, route, Bytes::from(json)).await?;

        if status.is_success() {
            tracing::debug!("PUT {route} -> {status}");
            return Ok(());
        }

        let message = serde_json::from_slice::<ApiFault>(&response)
            .map(|fault| fault.fault_message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&response).into_owned());

        Err(ImageVmError::custom(anyhow::anyhow!(
            "PUT {route} failed with {status}: {message}"
        )))
    }

    async fn send(
        &self,
        method: Method,
        route: &str,
        body: Bytes,
    ) -> ImageVmResult<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(ImageVmError::custom)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("firecracker api connection closed: {e}");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(route)
            .header(header::HOST, "localhost")
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(ImageVmError::custom)?;

        let response = sender
            .send_request(request)
            .await
            .map_err(ImageVmError::custom)?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(ImageVmError::custom)?
            .to_bytes();

        Ok((status, bytes))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
