//! Process-wide collection of gauge series exported to scrapers.
//!
//! Every series belongs to one [`EntityKind`], which fixes its label schema. Values are
//! stored in `prometheus` gauges, so a concurrent [`MetricRegistry::export`] observes each
//! label set with either its old or its new value, never a torn one.

use std::collections::HashMap;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::labels::{INFO_LABELS, LabelSchema, LabelSet, MOUNT_LABELS};

pub const PIDS: &str = "container_pids";
pub const CPU_USAGE_USER: &str = "container_cpu_usage_user_seconds_total";
pub const CPU_USAGE_KERNEL: &str = "container_cpu_usage_kernel_seconds_total";
pub const CPU_USAGE_TOTAL: &str = "container_cpu_usage_seconds_total";
pub const MEMORY_USAGE: &str = "container_memory_usage_bytes";
pub const MEMORY_LIMIT: &str = "container_memory_limit_bytes";

pub const NETWORK_RECEIVE_BYTES: &str = "container_network_receive_bytes_total";
pub const NETWORK_TRANSMIT_BYTES: &str = "container_network_transmit_bytes_total";
pub const NETWORK_RECEIVE_PACKETS: &str = "container_network_receive_packets_total";
pub const NETWORK_TRANSMIT_PACKETS: &str = "container_network_transmit_packets_total";
pub const NETWORK_RECEIVE_ERRORS: &str = "container_network_receive_errors_total";
pub const NETWORK_TRANSMIT_ERRORS: &str = "container_network_transmit_errors_total";
pub const NETWORK_RECEIVE_DROPPED: &str = "container_network_receive_dropped_total";
pub const NETWORK_TRANSMIT_DROPPED: &str = "container_network_transmit_dropped_total";

pub const CONTAINER_INFO: &str = "container_info";

pub const DATA_FREE: &str = "container_data_free_bytes";
pub const DATA_AVAILABLE: &str = "container_data_available_bytes";
pub const DATA_SIZE: &str = "container_data_size_bytes";
pub const DATA_INODES_FREE: &str = "container_data_inodes_free";
pub const DATA_INODES: &str = "container_data_inodes_total";

/// The kind of observed entity a series describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Container,
    Interface,
    Info,
    Mount,
}

/// Name and help text of one exported series.
#[derive(Debug, Clone, Copy)]
pub struct SeriesSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: EntityKind,
}

const fn spec(name: &'static str, help: &'static str, kind: EntityKind) -> SeriesSpec {
    SeriesSpec { name, help, kind }
}

pub const SERIES: &[SeriesSpec] = &[
    spec(PIDS, "Number of running processes in the container", EntityKind::Container),
    spec(CPU_USAGE_USER, "Container CPU usage in user mode", EntityKind::Container),
    spec(CPU_USAGE_KERNEL, "Container CPU usage in kernel mode", EntityKind::Container),
    spec(CPU_USAGE_TOTAL, "Container CPU usage", EntityKind::Container),
    spec(MEMORY_USAGE, "Container memory usage without page cache", EntityKind::Container),
    spec(MEMORY_LIMIT, "Container memory limit", EntityKind::Container),
    spec(NETWORK_RECEIVE_BYTES, "Container network received bytes", EntityKind::Interface),
    spec(NETWORK_TRANSMIT_BYTES, "Container network transmitted bytes", EntityKind::Interface),
    spec(NETWORK_RECEIVE_PACKETS, "Container network received packets", EntityKind::Interface),
    spec(NETWORK_TRANSMIT_PACKETS, "Container network transmitted packets", EntityKind::Interface),
    spec(NETWORK_RECEIVE_ERRORS, "Container network receive errors", EntityKind::Interface),
    spec(NETWORK_TRANSMIT_ERRORS, "Container network transmit errors", EntityKind::Interface),
    spec(NETWORK_RECEIVE_DROPPED, "Container network receive drops", EntityKind::Interface),
    spec(NETWORK_TRANSMIT_DROPPED, "Container network transmit drops", EntityKind::Interface),
    spec(CONTAINER_INFO, "Container info", EntityKind::Info),
    spec(DATA_FREE, "Free bytes on the data filesystem", EntityKind::Mount),
    spec(DATA_AVAILABLE, "Bytes available to unprivileged users on the data filesystem", EntityKind::Mount),
    spec(DATA_SIZE, "Size of the data filesystem in bytes", EntityKind::Mount),
    spec(DATA_INODES_FREE, "Free inodes on the data filesystem", EntityKind::Mount),
    spec(DATA_INODES, "Total inodes on the data filesystem", EntityKind::Mount),
];

/// Names of all series describing entities of `kind`.
pub fn series_of(kind: EntityKind) -> impl Iterator<Item = &'static str> {
    SERIES
        .iter()
        .filter(move |spec| spec.kind == kind)
        .map(|spec| spec.name)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to register series `{name}`: {source}")]
    Register {
        name: &'static str,
        #[source]
        source: prometheus::Error,
    },
    #[error("unknown series `{0}`")]
    UnknownSeries(String),
    #[error("label set {labels:?} does not match series `{name}`: {source}")]
    Labels {
        name: String,
        labels: LabelSet,
        #[source]
        source: prometheus::Error,
    },
    #[error("failed to encode metrics: {0}")]
    Encode(#[source] prometheus::Error),
    #[error("encoded metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Named gauge series keyed by label sets.
#[derive(Debug)]
pub struct MetricRegistry {
    registry: Registry,
    series: HashMap<&'static str, GaugeVec>,
}

impl MetricRegistry {
    /// Registers the series catalogue.
    ///
    /// Container and interface series use the label names of `schema`. The `container_info`
    /// series is only registered if `container_info` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Register`] if a series cannot be created or registered.
    pub fn new(schema: LabelSchema, container_info: bool) -> Result<Self> {
        let registry = Registry::new();
        let mut series = HashMap::with_capacity(SERIES.len());

        for spec in SERIES {
            let label_names = match spec.kind {
                EntityKind::Container => schema.container_labels(),
                EntityKind::Interface => schema.network_labels(),
                EntityKind::Info if container_info => INFO_LABELS,
                EntityKind::Info => continue,
                EntityKind::Mount => MOUNT_LABELS,
            };
            let gauge = GaugeVec::new(Opts::new(spec.name, spec.help), label_names)
                .map_err(|source| Error::Register {
                    name: spec.name,
                    source,
                })?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|source| Error::Register {
                    name: spec.name,
                    source,
                })?;
            series.insert(spec.name, gauge);
        }

        Ok(Self { registry, series })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    fn gauge_vec(&self, name: &str) -> Result<&GaugeVec> {
        self.series
            .get(name)
            .ok_or_else(|| Error::UnknownSeries(name.to_owned()))
    }

    /// Sets the value of `name` for `labels`, creating the entry if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSeries`] or [`Error::Labels`] if the series does not exist or
    /// `labels` does not match its schema.
    pub fn set(&self, name: &str, labels: &LabelSet, value: f64) -> Result<()> {
        let gauge = self
            .gauge_vec(name)?
            .get_metric_with(&labels.as_map())
            .map_err(|source| Error::Labels {
                name: name.to_owned(),
                labels: labels.clone(),
                source,
            })?;
        gauge.set(value);
        Ok(())
    }

    /// Removes the entry of `name` for exactly `labels`. Removing an absent entry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSeries`] if the series does not exist.
    pub fn remove(&self, name: &str, labels: &LabelSet) -> Result<()> {
        if self.gauge_vec(name)?.remove(&labels.as_map()).is_err() {
            log::trace!("series `{}` had no entry for {:?}", name, labels);
        }
        Ok(())
    }

    /// Encodes all current entries in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if encoding fails.
    pub fn export(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(Error::Encode)?;
        Ok(String::from_utf8(buffer)?)
    }
}
