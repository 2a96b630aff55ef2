use clap::Parser;

/// Entry point for the Creo exporter.
///
/// Polls the Docker daemon for container resource usage, samples the capacity of the data
/// mounts below the base path and serves both as Prometheus metrics.
///
/// # Errors
///
/// Returns an error if startup fails (e.g., unreadable base path, missing Docker socket, or
/// a listener that cannot be bound).
///
/// # Examples
///
/// ```bash
/// RUST_LOG=debug cargo run -- /srv/data --interval 10
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = creo_exporter::config::Config::parse();
    creo_exporter::run(config).await
}
