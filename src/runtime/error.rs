use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container runtime socket `{path}` is not available: {source}")]
    SocketUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to socket `{path}`: {source}")]
    SocketConnect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP handshake on `{path}` failed: {source}")]
    Handshake {
        path: PathBuf,
        #[source]
        source: hyper::Error,
    },
    #[error("failed to build request for `{endpoint}`: {source}")]
    BuildRequest {
        endpoint: String,
        #[source]
        source: hyper::http::Error,
    },
    #[error("request to `{endpoint}` failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: hyper::Error,
    },
    #[error("`{endpoint}` responded with status {status}: {body}")]
    Status {
        endpoint: String,
        status: hyper::StatusCode,
        body: String,
    },
    #[error("failed to decode response of `{endpoint}`: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request to `{endpoint}` timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
}

pub type Result<T> = std::result::Result<T, Error>;
