//! Derives the label sets that identify exported series.
//!
//! Every function here is a pure function of its input: normalizing the same descriptor twice
//! yields equal label sets. Which fields a container label set carries is selected by
//! [`LabelSchema`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::runtime::{ContainerState, ContainerSummary};

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

const NAME_PREFIX: char = '/';
const DIGEST_SCHEME_PREFIX: &str = "sha256:";

const COMPOSE_CONTAINER_LABELS: &[&str] = &["container_name", "compose_project", "compose_service"];
const COMPOSE_NETWORK_LABELS: &[&str] = &[
    "container_name",
    "compose_project",
    "compose_service",
    "interface",
];
const DETAILED_CONTAINER_LABELS: &[&str] = &[
    "container_id",
    "container_name",
    "compose_project",
    "compose_service",
    "container_image_id",
    "container_image_name",
];
const DETAILED_NETWORK_LABELS: &[&str] = &[
    "container_id",
    "container_name",
    "compose_project",
    "compose_service",
    "container_image_id",
    "container_image_name",
    "interface",
];
pub const INFO_LABELS: &[&str] = &[
    "container_id",
    "container_name",
    "compose_project",
    "compose_service",
    "container_image_id",
    "container_image_name",
    "container_state",
    "container_state_running",
    "container_state_paused",
    "container_state_restarting",
    "container_state_oomkilled",
    "container_state_dead",
];
pub const MOUNT_LABELS: &[&str] = &["name", "path"];

/// Selects the identity fields attached to container and interface series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LabelSchema {
    /// Container name plus compose project and service.
    #[default]
    Compose,
    /// Additionally the container id and image identity.
    Detailed,
}

impl LabelSchema {
    pub fn container_labels(self) -> &'static [&'static str] {
        match self {
            LabelSchema::Compose => COMPOSE_CONTAINER_LABELS,
            LabelSchema::Detailed => DETAILED_CONTAINER_LABELS,
        }
    }

    pub fn network_labels(self) -> &'static [&'static str] {
        match self {
            LabelSchema::Compose => COMPOSE_NETWORK_LABELS,
            LabelSchema::Detailed => DETAILED_NETWORK_LABELS,
        }
    }
}

/// An immutable mapping of label names to values.
///
/// Ordered by label name, so equal sets compare, hash and serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct LabelSet(BTreeMap<&'static str, String>);

impl LabelSet {
    fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(name, value)| (*name, value.as_str()))
    }

    /// Borrows the set in the shape the metrics backend expects.
    pub fn as_map(&self) -> HashMap<&str, &str> {
        self.iter().collect()
    }

    /// Serializes the set into a stable string, used as identity key for info series.
    pub fn to_key(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| format!("{:?}", self.0))
    }
}

/// Strips the leading `/` the runtime puts in front of container names.
///
/// # Examples
///
/// ```
/// # use creo_exporter::labels::strip_name_prefix;
/// assert_eq!(strip_name_prefix("/web-1"), "web-1");
/// assert_eq!(strip_name_prefix("web-1"), "web-1");
/// ```
pub fn strip_name_prefix(name: &str) -> &str {
    name.strip_prefix(NAME_PREFIX).unwrap_or(name)
}

/// Strips the `sha256:` content hash scheme, leaving the bare digest.
pub fn strip_digest_scheme(image_id: &str) -> &str {
    image_id
        .strip_prefix(DIGEST_SCHEME_PREFIX)
        .unwrap_or(image_id)
}

fn display_name(container: &ContainerSummary) -> &str {
    container
        .names
        .first()
        .map(|name| strip_name_prefix(name))
        .unwrap_or_default()
}

fn runtime_label<'a>(container: &'a ContainerSummary, key: &str) -> &'a str {
    container
        .labels
        .get(key)
        .map(String::as_str)
        .unwrap_or_default()
}

fn identity(container: &ContainerSummary) -> LabelSet {
    LabelSet::default()
        .with("container_name", display_name(container))
        .with(
            "compose_project",
            runtime_label(container, COMPOSE_PROJECT_LABEL),
        )
        .with(
            "compose_service",
            runtime_label(container, COMPOSE_SERVICE_LABEL),
        )
}

fn detailed_identity(container: &ContainerSummary) -> LabelSet {
    identity(container)
        .with("container_id", container.id.as_str())
        .with("container_image_id", strip_digest_scheme(&container.image_id))
        .with("container_image_name", container.image.as_str())
}

/// Label set for container level series.
pub fn container_labels(schema: LabelSchema, container: &ContainerSummary) -> LabelSet {
    match schema {
        LabelSchema::Compose => identity(container),
        LabelSchema::Detailed => detailed_identity(container),
    }
}

/// Label set for the series of one network interface of a container.
pub fn network_labels(schema: LabelSchema, container: &ContainerSummary, interface: &str) -> LabelSet {
    container_labels(schema, container).with("interface", interface)
}

/// Label set for the `container_info` series, carrying the current state flags.
pub fn info_labels(container: &ContainerSummary, state: &ContainerState) -> LabelSet {
    detailed_identity(container)
        .with("container_state", container.state.as_str())
        .with("container_state_running", state.running.to_string())
        .with("container_state_paused", state.paused.to_string())
        .with("container_state_restarting", state.restarting.to_string())
        .with("container_state_oomkilled", state.oom_killed.to_string())
        .with("container_state_dead", state.dead.to_string())
}

/// Label set for the capacity series of a filesystem mount.
pub fn mount_labels(name: &str, path: &Path) -> LabelSet {
    LabelSet::default()
        .with("name", name)
        .with("path", path.to_string_lossy())
}
