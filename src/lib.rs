//! Creo Exporter: exports the resource usage of Docker containers and the capacity of data
//! mounts as Prometheus metrics.
//!
//! A [`reconcile::Reconciler`] polls the container runtime and the filesystem on a fixed
//! interval and keeps a [`registry::MetricRegistry`] in agreement with what it observed. The
//! [`api::APIServer`] serves the registry to scrapers.

use std::sync::Arc;

pub mod api;
pub mod capacity;
pub mod config;
pub mod container;
pub mod error;
pub mod labels;
pub mod reconcile;
pub mod registry;
pub mod runtime;

/// Runs the Creo Exporter.
///
/// Validates the configuration, spawns the reconciliation loop and serves the metrics
/// endpoint until the process exits.
///
/// # Errors
///
/// Possible errors include:
/// - An unreadable base path.
/// - A missing Docker socket.
/// - A listen address that cannot be bound.
pub async fn run(config: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    log::debug!("Base path: {}", config.base_path.display());

    let registry = Arc::new(registry::MetricRegistry::new(
        config.label_schema,
        config.container_info,
    )?);
    let docker = runtime::DockerClient::new(&config.docker_socket, config.request_timeout())?;
    log::debug!("Using Docker socket {}", config.docker_socket.display());

    let reconciler = reconcile::Reconciler::new(
        docker,
        capacity::Statvfs,
        Arc::clone(&registry),
        config.reconcile_options(),
    );
    tokio::spawn(reconciler.run(config.interval()));

    api::APIServer::new(registry).listen(config.listen).await?;

    Ok(())
}
