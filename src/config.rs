use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::labels::LabelSchema;
use crate::reconcile;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base path `{path}` is not a readable directory: {source}")]
    InvalidBasePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exports resource usage of Docker containers and capacity of data mounts as Prometheus
/// metrics.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "creo-exporter", version, about)]
pub struct Config {
    /// Directory whose subdirectories are reported as data mounts. `/` reports the root
    /// filesystem itself.
    #[arg(default_value = "/", env = "CREO_EXPORTER_BASE_PATH")]
    pub base_path: PathBuf,

    /// Address the metrics endpoint listens on.
    #[arg(long, env = "CREO_EXPORTER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path of the Docker daemon socket.
    #[arg(long, env = "DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Seconds between the starts of two reconciliation cycles.
    #[arg(
        long,
        env = "CREO_EXPORTER_INTERVAL",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// Deadline in seconds for a single call to the Docker daemon or a single filesystem stat.
    #[arg(
        long,
        env = "CREO_EXPORTER_REQUEST_TIMEOUT",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub request_timeout: u64,

    /// Identity labels attached to container and network series.
    #[arg(
        long,
        env = "CREO_EXPORTER_LABEL_SCHEMA",
        value_enum,
        default_value = "compose"
    )]
    pub label_schema: LabelSchema,

    /// Export the `container_info` series. Requires one inspect call per container and cycle.
    #[arg(
        long,
        env = "CREO_EXPORTER_CONTAINER_INFO",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub container_info: bool,
}

impl Config {
    /// Checks that the base path can be read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBasePath`] if the base path cannot be listed.
    pub fn validate(&self) -> Result<()> {
        std::fs::read_dir(&self.base_path).map_err(|source| Error::InvalidBasePath {
            path: self.base_path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn reconcile_options(&self) -> reconcile::Options {
        reconcile::Options {
            base_path: self.base_path.clone(),
            label_schema: self.label_schema,
            container_info: self.container_info,
            stat_timeout: self.request_timeout(),
        }
    }
}
