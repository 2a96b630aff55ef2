use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, header};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;

use crate::container::ContainerID;

use super::models::ContainerInspect;
use super::{ContainerRuntime, ContainerState, ContainerSummary, Error, Result, UsageSnapshot};

/// Docker Engine API client speaking HTTP/1.1 over the daemon's unix socket.
///
/// Every request opens its own connection and is bounded by the configured timeout, so an
/// unresponsive daemon stalls at most one call.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DockerClient {
    /// Creates a client for the socket at `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketUnavailable`] if the socket path does not exist or cannot be
    /// checked.
    pub fn new(socket_path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        match socket_path.try_exists() {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::SocketUnavailable {
                    path: socket_path,
                    source: std::io::ErrorKind::NotFound.into(),
                });
            }
            Err(source) => {
                return Err(Error::SocketUnavailable {
                    path: socket_path,
                    source,
                });
            }
        }

        Ok(Self {
            socket_path,
            timeout,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: String) -> Result<T> {
        match tokio::time::timeout(self.timeout, self.get(&endpoint)).await {
            Ok(body) => serde_json::from_slice(&body?)
                .map_err(|source| Error::Decode { endpoint, source }),
            Err(_) => Err(Error::Timeout {
                endpoint,
                timeout: self.timeout,
            }),
        }
    }

    async fn get(&self, endpoint: &str) -> Result<Bytes> {
        log::trace!("GET {} via {}", endpoint, self.socket_path.display());
        let stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| Error::SocketConnect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| Error::Handshake {
                path: self.socket_path.clone(),
                source,
            })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::debug!("docker connection closed with error: {}", err);
            }
        });

        let request = Request::get(endpoint)
            .header(header::HOST, "docker")
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|source| Error::BuildRequest {
                endpoint: endpoint.to_owned(),
                source,
            })?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|source| Error::Request {
                endpoint: endpoint.to_owned(),
                source,
            })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|source| Error::Request {
                endpoint: endpoint.to_owned(),
                source,
            })?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Status {
                endpoint: endpoint.to_owned(),
                status,
                body: String::from_utf8_lossy(&body).trim().to_owned(),
            });
        }

        Ok(body)
    }
}

impl ContainerRuntime for DockerClient {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.get_json("/containers/json".to_owned()).await
    }

    async fn sample_usage(&self, id: &ContainerID) -> Result<UsageSnapshot> {
        self.get_json(format!("/containers/{id}/stats?stream=false&one-shot=true"))
            .await
    }

    async fn inspect(&self, id: &ContainerID) -> Result<ContainerState> {
        let inspect: ContainerInspect = self.get_json(format!("/containers/{id}/json")).await?;
        Ok(inspect.state)
    }
}
