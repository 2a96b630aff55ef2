//! Boundary to the container runtime's management API.
//!
//! The reconciliation loop only depends on the [`ContainerRuntime`] trait and the response
//! shapes in [`models`]. [`DockerClient`] implements the trait against the Docker Engine API
//! served on a unix socket.
//!
//! # Consumed endpoints
//!
//! - `GET /containers/json` lists running containers.
//! - `GET /containers/{id}/stats?stream=false&one-shot=true` samples resource usage once.
//! - `GET /containers/{id}/json` inspects the full container state.
mod docker;
mod error;
pub mod models;

use std::future::Future;

pub use docker::DockerClient;
pub use error::{Error, Result};
pub use models::{ContainerState, ContainerSummary, NetworkUsage, UsageSnapshot};

use crate::container::ContainerID;

pub trait ContainerRuntime {
    /// Lists the currently running containers.
    fn list_containers(&self) -> impl Future<Output = Result<Vec<ContainerSummary>>> + Send;

    /// Fetches a single point-in-time resource usage sample for a container.
    fn sample_usage(&self, id: &ContainerID) -> impl Future<Output = Result<UsageSnapshot>> + Send;

    /// Fetches the full state of a container.
    fn inspect(&self, id: &ContainerID) -> impl Future<Output = Result<ContainerState>> + Send;
}
