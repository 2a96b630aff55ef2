//! Reconciliation of the metric registry with the observed containers and data mounts.
//!
//! Each cycle observes every entity, writes its series and records its label set in a fresh
//! [`Snapshot`]. Label sets recorded in the previous snapshot that are no longer live are
//! then removed from the registry, and the fresh snapshot replaces the previous one.
//!
//! An entity whose individual fetch fails keeps its previous label sets in the fresh
//! snapshot, so its series stay untouched until it is observed again or vanishes from the
//! listing.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capacity::{self, CapacitySource, FsCapacity};
use crate::container::ContainerID;
use crate::error::{Failure, Operation};
use crate::labels::{self, LabelSchema, LabelSet};
use crate::registry::{self, EntityKind, MetricRegistry};
use crate::runtime::{ContainerRuntime, ContainerSummary, NetworkUsage, UsageSnapshot};

/// Settings of a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory whose data mounts are sampled.
    pub base_path: PathBuf,
    pub label_schema: LabelSchema,
    /// Whether to inspect containers and export `container_info`.
    pub container_info: bool,
    /// Deadline for listing the data mounts and for each mount's stat call.
    pub stat_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InterfaceKey {
    container: ContainerID,
    interface: String,
}

/// Label sets written during one cycle, keyed by entity identity.
#[derive(Debug, Default)]
struct Snapshot {
    containers: HashMap<ContainerID, LabelSet>,
    interfaces: HashMap<InterfaceKey, LabelSet>,
    /// Keyed by the serialized label set, which changes with the state flags.
    infos: HashMap<String, LabelSet>,
    mounts: HashMap<PathBuf, LabelSet>,
}

/// Outcome of a single reconciliation cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Containers observed successfully.
    pub containers: usize,
    /// Mounts sampled successfully.
    pub mounts: usize,
    /// Label sets removed from the registry.
    pub removed: usize,
    pub failures: Vec<Failure>,
}

impl CycleReport {
    pub fn is_degraded(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(failure, Failure::CycleDegraded { .. }))
    }
}

/// Keeps the registry in agreement with the running containers and data mounts.
pub struct Reconciler<R, C> {
    runtime: R,
    capacity: C,
    registry: Arc<MetricRegistry>,
    options: Options,
    known: Snapshot,
}

impl<R, C> Reconciler<R, C>
where
    R: ContainerRuntime,
    C: CapacitySource,
{
    pub fn new(runtime: R, capacity: C, registry: Arc<MetricRegistry>, options: Options) -> Self {
        Self {
            runtime,
            capacity,
            registry,
            options,
            known: Snapshot::default(),
        }
    }

    /// Runs a cycle every `interval` until the task is dropped.
    ///
    /// A cycle that overruns the interval delays the next one instead of triggering a burst.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let before = Instant::now();
            let report = self.reconcile().await;
            log::debug!(
                "Reconciled {} containers and {} mounts, removed {} label sets, {} failures",
                report.containers,
                report.mounts,
                report.removed,
                report.failures.len()
            );
            log::trace!("reconcile() took {} milliseconds", before.elapsed().as_millis());
        }
    }

    /// Runs a single cycle.
    pub async fn reconcile(&mut self) -> CycleReport {
        let mut next = Snapshot::default();
        let mut report = CycleReport::default();

        self.observe_containers(&mut next, &mut report).await;
        self.observe_mounts(&mut next, &mut report).await;

        report.removed = self.retire(&next);
        self.known = next;

        report
    }

    async fn observe_containers(&self, next: &mut Snapshot, report: &mut CycleReport) {
        let containers = match self.runtime.list_containers().await {
            Ok(containers) => containers,
            Err(err) => {
                let failure = Failure::degraded(Operation::ListContainers, err);
                log::error!("{}", failure);
                report.failures.push(failure);
                return;
            }
        };
        log::trace!("Found {} running containers", containers.len());

        for container in &containers {
            match self.observe_container(container, next).await {
                Ok(()) => report.containers += 1,
                Err(failure) => {
                    log::warn!("{}", failure);
                    self.carry_over_container(&container.id, next);
                    report.failures.push(failure);
                }
            }
        }
    }

    async fn observe_container(
        &self,
        container: &ContainerSummary,
        next: &mut Snapshot,
    ) -> Result<(), Failure> {
        let state = if self.options.container_info {
            let state = self
                .runtime
                .inspect(&container.id)
                .await
                .map_err(|err| Failure::skipped(&container.id, Operation::InspectContainer, err))?;
            Some(state)
        } else {
            None
        };
        let usage = self
            .runtime
            .sample_usage(&container.id)
            .await
            .map_err(|err| Failure::skipped(&container.id, Operation::SampleUsage, err))?;

        let schema = self.options.label_schema;
        let container_labels = labels::container_labels(schema, container);
        self.set_container_series(&container_labels, &usage);
        next.containers.insert(container.id.clone(), container_labels);

        for (interface, network) in &usage.networks {
            let network_labels = labels::network_labels(schema, container, interface);
            self.set_network_series(&network_labels, network);
            next.interfaces.insert(
                InterfaceKey {
                    container: container.id.clone(),
                    interface: interface.clone(),
                },
                network_labels,
            );
        }

        if let Some(state) = state {
            let info_labels = labels::info_labels(container, &state);
            self.set(registry::CONTAINER_INFO, &info_labels, 1.0);
            next.infos.insert(info_labels.to_key(), info_labels);
        }

        Ok(())
    }

    /// Copies the previous label sets of a container that could not be observed.
    fn carry_over_container(&self, id: &ContainerID, next: &mut Snapshot) {
        if let Some(labels) = self.known.containers.get(id) {
            next.containers.insert(id.clone(), labels.clone());
        }
        next.interfaces.extend(
            self.known
                .interfaces
                .iter()
                .filter(|(key, _)| &key.container == id)
                .map(|(key, labels)| (key.clone(), labels.clone())),
        );
        next.infos.extend(
            self.known
                .infos
                .iter()
                .filter(|(_, labels)| labels.get("container_id") == Some(id.as_str()))
                .map(|(key, labels)| (key.clone(), labels.clone())),
        );
    }

    async fn observe_mounts(&self, next: &mut Snapshot, report: &mut CycleReport) {
        let timeout = self.options.stat_timeout;
        let mounts = match capacity::list_mounts_within(&self.options.base_path, timeout).await {
            Ok(mounts) => mounts,
            Err(err) => {
                let failure = Failure::degraded(Operation::ListMounts, err);
                log::error!("{}", failure);
                report.failures.push(failure);
                return;
            }
        };

        for mount in mounts {
            match capacity::stat_within(&self.capacity, &mount.path, timeout).await {
                Ok(capacity) => {
                    let mount_labels = labels::mount_labels(&mount.name, &mount.path);
                    self.set_mount_series(&mount_labels, &capacity);
                    next.mounts.insert(mount.path, mount_labels);
                    report.mounts += 1;
                }
                Err(err) => {
                    let failure = Failure::skipped(mount.path.display(), Operation::StatMount, err);
                    log::warn!("{}", failure);
                    self.carry_over_mount(&mount.path, next);
                    report.failures.push(failure);
                }
            }
        }
    }

    fn carry_over_mount(&self, path: &Path, next: &mut Snapshot) {
        if let Some(labels) = self.known.mounts.get(path) {
            next.mounts.insert(path.to_path_buf(), labels.clone());
        }
    }

    fn set_container_series(&self, labels: &LabelSet, usage: &UsageSnapshot) {
        self.set(registry::PIDS, labels, usage.pids());
        self.set(registry::CPU_USAGE_USER, labels, usage.cpu_user_seconds());
        self.set(registry::CPU_USAGE_KERNEL, labels, usage.cpu_kernel_seconds());
        self.set(registry::CPU_USAGE_TOTAL, labels, usage.cpu_total_seconds());
        self.set(registry::MEMORY_USAGE, labels, usage.memory_working_set_bytes());
        self.set(registry::MEMORY_LIMIT, labels, usage.memory_limit_bytes());
    }

    fn set_network_series(&self, labels: &LabelSet, network: &NetworkUsage) {
        self.set(registry::NETWORK_RECEIVE_BYTES, labels, network.rx_bytes as f64);
        self.set(registry::NETWORK_TRANSMIT_BYTES, labels, network.tx_bytes as f64);
        self.set(registry::NETWORK_RECEIVE_PACKETS, labels, network.rx_packets as f64);
        self.set(registry::NETWORK_TRANSMIT_PACKETS, labels, network.tx_packets as f64);
        self.set(registry::NETWORK_RECEIVE_ERRORS, labels, network.rx_errors as f64);
        self.set(registry::NETWORK_TRANSMIT_ERRORS, labels, network.tx_errors as f64);
        self.set(registry::NETWORK_RECEIVE_DROPPED, labels, network.rx_dropped as f64);
        self.set(registry::NETWORK_TRANSMIT_DROPPED, labels, network.tx_dropped as f64);
    }

    fn set_mount_series(&self, labels: &LabelSet, capacity: &FsCapacity) {
        self.set(registry::DATA_FREE, labels, capacity.free_bytes());
        self.set(registry::DATA_AVAILABLE, labels, capacity.available_bytes());
        self.set(registry::DATA_SIZE, labels, capacity.size_bytes());
        self.set(registry::DATA_INODES_FREE, labels, capacity.inodes_free as f64);
        self.set(registry::DATA_INODES, labels, capacity.inodes as f64);
    }

    fn set(&self, name: &str, labels: &LabelSet, value: f64) {
        if let Err(err) = self.registry.set(name, labels, value) {
            log::error!("failed to set series: {}", err);
        }
    }

    /// Removes every previously written label set that is not live in `next`.
    fn retire(&self, next: &Snapshot) -> usize {
        let known = &self.known;
        let registry = &self.registry;
        retire_kind(registry, EntityKind::Container, &known.containers, &next.containers)
            + retire_kind(registry, EntityKind::Interface, &known.interfaces, &next.interfaces)
            + retire_kind(registry, EntityKind::Info, &known.infos, &next.infos)
            + retire_kind(registry, EntityKind::Mount, &known.mounts, &next.mounts)
    }
}

/// Removes the series of `kind` for label sets in `previous` that are not in `current`.
///
/// Compares label sets rather than keys, so an entity whose labels changed under the same key
/// (e.g. a renamed container) does not leave its old series behind.
fn retire_kind<K: Eq + Hash>(
    registry: &MetricRegistry,
    kind: EntityKind,
    previous: &HashMap<K, LabelSet>,
    current: &HashMap<K, LabelSet>,
) -> usize {
    let live: HashSet<&LabelSet> = current.values().collect();
    let mut removed = 0;
    for labels in previous.values().filter(|labels| !live.contains(labels)) {
        log::debug!("Removing {:?} series for {:?}", kind, labels);
        for name in registry::series_of(kind).filter(|name| registry.contains(name)) {
            if let Err(err) = registry.remove(name, labels) {
                log::error!("failed to remove series: {}", err);
            }
        }
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::registry::tests::samples;
    use crate::runtime::{self, ContainerState};

    #[derive(Debug, Default)]
    struct FakeState {
        /// `None` makes the listing fail.
        containers: Option<Vec<ContainerSummary>>,
        usage: HashMap<String, UsageSnapshot>,
        states: HashMap<String, ContainerState>,
        failing_usage: HashSet<String>,
        failing_inspect: HashSet<String>,
        inspect_calls: usize,
        /// Start time of every listing.
        list_calls: Vec<tokio::time::Instant>,
        /// Delay applied to the next listing only.
        list_delay: Duration,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeRuntime(Arc<Mutex<FakeState>>);

    fn timeout(endpoint: &str) -> runtime::Error {
        runtime::Error::Timeout {
            endpoint: endpoint.to_owned(),
            timeout: Duration::from_secs(10),
        }
    }

    impl FakeRuntime {
        fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
            f(&mut self.0.lock().unwrap())
        }

        fn add(&self, container: ContainerSummary, usage: UsageSnapshot) {
            self.with(|state| {
                state
                    .usage
                    .insert(container.id.to_string(), usage);
                state
                    .states
                    .insert(container.id.to_string(), running());
                state
                    .containers
                    .get_or_insert_with(Vec::new)
                    .push(container);
            });
        }

        fn remove(&self, id: &str) {
            self.with(|state| {
                if let Some(containers) = state.containers.as_mut() {
                    containers.retain(|c| c.id.as_str() != id);
                }
            });
        }
    }

    impl ContainerRuntime for FakeRuntime {
        async fn list_containers(&self) -> runtime::Result<Vec<ContainerSummary>> {
            let delay = self.with(|state| {
                state.list_calls.push(tokio::time::Instant::now());
                std::mem::take(&mut state.list_delay)
            });
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.with(|state| {
                state
                    .containers
                    .clone()
                    .ok_or_else(|| timeout("/containers/json"))
            })
        }

        async fn sample_usage(&self, id: &ContainerID) -> runtime::Result<UsageSnapshot> {
            self.with(|state| {
                if state.failing_usage.contains(id.as_str()) {
                    return Err(timeout("/containers/{id}/stats"));
                }
                Ok(state.usage.get(id.as_str()).cloned().unwrap_or_default())
            })
        }

        async fn inspect(&self, id: &ContainerID) -> runtime::Result<ContainerState> {
            self.with(|state| {
                state.inspect_calls += 1;
                if state.failing_inspect.contains(id.as_str()) {
                    return Err(timeout("/containers/{id}/json"));
                }
                Ok(state.states.get(id.as_str()).cloned().unwrap_or_default())
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    struct FakeCapacity {
        capacities: Arc<Mutex<HashMap<PathBuf, FsCapacity>>>,
        /// Blocks every stat call for this long, like a hung network mount.
        stall: Arc<Mutex<Duration>>,
    }

    impl FakeCapacity {
        fn insert(&self, path: PathBuf, capacity: FsCapacity) {
            self.capacities.lock().unwrap().insert(path, capacity);
        }

        fn fail(&self, path: &Path) {
            self.capacities.lock().unwrap().remove(path);
        }

        fn stall(&self, duration: Duration) {
            *self.stall.lock().unwrap() = duration;
        }
    }

    impl CapacitySource for FakeCapacity {
        fn stat(&self, path: &Path) -> capacity::Result<FsCapacity> {
            let stall = *self.stall.lock().unwrap();
            if !stall.is_zero() {
                std::thread::sleep(stall);
            }
            self.capacities
                .lock()
                .unwrap()
                .get(path)
                .copied()
                .ok_or_else(|| capacity::Error::Stat {
                    path: path.to_path_buf(),
                    source: std::io::ErrorKind::NotFound.into(),
                })
        }
    }

    fn running() -> ContainerState {
        ContainerState {
            status: "running".to_owned(),
            running: true,
            ..Default::default()
        }
    }

    fn container(id: &str, name: &str) -> ContainerSummary {
        ContainerSummary {
            id: ContainerID::new(id).unwrap(),
            names: vec![format!("/{name}")],
            image: "nginx:1.27".to_owned(),
            image_id: "sha256:abcd1234".to_owned(),
            labels: HashMap::from([
                (labels::COMPOSE_PROJECT_LABEL.to_owned(), "shop".to_owned()),
                (labels::COMPOSE_SERVICE_LABEL.to_owned(), "web".to_owned()),
            ]),
            state: "running".to_owned(),
        }
    }

    fn usage(pids: u64, interfaces: &[&str]) -> UsageSnapshot {
        let mut usage = UsageSnapshot::default();
        usage.pids_stats.current = pids;
        usage.cpu_stats.cpu_usage.total_usage = 2_500_000_000;
        usage.cpu_stats.cpu_usage.usage_in_usermode = 2_000_000_000;
        usage.cpu_stats.cpu_usage.usage_in_kernelmode = 500_000_000;
        usage.memory_stats.usage = 100_000_000;
        usage.memory_stats.limit = 200_000_000;
        usage
            .memory_stats
            .stats
            .insert("cache".to_owned(), 20_000_000);
        usage.networks = interfaces
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    NetworkUsage {
                        rx_bytes: 10,
                        tx_bytes: 20,
                        ..Default::default()
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        usage
    }

    struct Harness {
        runtime: FakeRuntime,
        capacity: FakeCapacity,
        registry: Arc<MetricRegistry>,
        reconciler: Reconciler<FakeRuntime, FakeCapacity>,
        base: tempfile::TempDir,
    }

    fn harness(schema: LabelSchema, container_info: bool) -> Harness {
        let runtime = FakeRuntime::default();
        runtime.with(|state| state.containers = Some(Vec::new()));
        let capacity = FakeCapacity::default();
        let registry = Arc::new(MetricRegistry::new(schema, container_info).unwrap());
        let base = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(
            runtime.clone(),
            capacity.clone(),
            Arc::clone(&registry),
            Options {
                base_path: base.path().to_path_buf(),
                label_schema: schema,
                container_info,
                stat_timeout: Duration::from_secs(5),
            },
        );
        Harness {
            runtime,
            capacity,
            registry,
            reconciler,
            base,
        }
    }

    impl Harness {
        fn export(&self) -> String {
            self.registry.export().unwrap()
        }

        fn add_mount(&self, name: &str) -> PathBuf {
            let path = self.base.path().join(name);
            std::fs::create_dir(&path).unwrap();
            self.capacity.insert(
                path.clone(),
                FsCapacity {
                    block_size: 4096,
                    blocks: 100,
                    blocks_free: 40,
                    blocks_available: 30,
                    inodes: 1000,
                    inodes_free: 900,
                },
            );
            path
        }
    }

    fn container_count(export: &str, name: &str) -> usize {
        samples(export, name).len()
    }

    #[tokio::test]
    async fn test_writes_all_series_of_observed_container() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(3, &["eth0"]));

        let report = h.reconciler.reconcile().await;
        assert_eq!(report.containers, 1);
        assert!(report.failures.is_empty());

        let export = h.export();
        for name in registry::series_of(EntityKind::Container)
            .chain(registry::series_of(EntityKind::Interface))
            .chain(registry::series_of(EntityKind::Info))
        {
            assert_eq!(container_count(&export, name), 1, "series {name}");
        }
        let pids = samples(&export, registry::PIDS);
        assert!(pids[0].contains(r#"container_name="web-1""#));
        assert!(pids[0].contains(r#"compose_project="shop""#));
        assert!(pids[0].ends_with(" 3"));
        assert!(samples(&export, registry::CPU_USAGE_TOTAL)[0].ends_with(" 2.5"));
        assert!(samples(&export, registry::CPU_USAGE_KERNEL)[0].ends_with(" 0.5"));
        assert!(samples(&export, registry::MEMORY_USAGE)[0].ends_with(" 80000000"));
        assert!(samples(&export, registry::MEMORY_LIMIT)[0].ends_with(" 200000000"));
        assert!(samples(&export, registry::NETWORK_TRANSMIT_BYTES)[0].contains(r#"interface="eth0""#));
        let info = samples(&export, registry::CONTAINER_INFO);
        assert!(info[0].contains(r#"container_image_id="abcd1234""#));
        assert!(info[0].contains(r#"container_state_running="true""#));
        assert!(info[0].ends_with(" 1"));
    }

    #[tokio::test]
    async fn test_compose_siblings_get_distinct_series() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("c1", "shop-web-1"), usage(1, &[]));
        h.runtime.add(container("c2", "shop-web-2"), usage(2, &[]));

        h.reconciler.reconcile().await;

        let export = h.export();
        let pids = samples(&export, registry::PIDS);
        assert_eq!(pids.len(), 2);
        assert!(pids.iter().any(|l| l.contains(r#"container_name="shop-web-1""#) && l.ends_with(" 1")));
        assert!(pids.iter().any(|l| l.contains(r#"container_name="shop-web-2""#) && l.ends_with(" 2")));
    }

    #[tokio::test]
    async fn test_detailed_schema_keys_by_container_id() {
        let mut h = harness(LabelSchema::Detailed, false);
        h.runtime.add(container("c1", "web"), usage(1, &["eth0"]));
        h.runtime.add(container("c2", "web"), usage(2, &["eth0"]));

        h.reconciler.reconcile().await;

        let export = h.export();
        let pids = samples(&export, registry::PIDS);
        assert_eq!(pids.len(), 2);
        assert!(pids.iter().any(|l| l.contains(r#"container_id="c1""#)));
        assert!(pids.iter().any(|l| l.contains(r#"container_id="c2""#)));
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_BYTES), 2);
    }

    #[tokio::test]
    async fn test_converges_over_cycles() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(1, &["eth0"]));
        h.reconciler.reconcile().await;

        h.runtime.add(container("c2", "db-1"), usage(1, &["eth0", "eth1"]));
        h.reconciler.reconcile().await;
        let export = h.export();
        assert_eq!(container_count(&export, registry::PIDS), 2);
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_PACKETS), 3);
        assert_eq!(container_count(&export, registry::CONTAINER_INFO), 2);

        h.runtime.remove("c1");
        let report = h.reconciler.reconcile().await;
        // container, interface and info label sets of c1
        assert_eq!(report.removed, 3);
        let export = h.export();
        assert_eq!(container_count(&export, registry::PIDS), 1);
        assert!(samples(&export, registry::PIDS)[0].contains(r#"container_name="db-1""#));
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_PACKETS), 2);
        assert_eq!(container_count(&export, registry::CONTAINER_INFO), 1);

        h.runtime.remove("c2");
        h.reconciler.reconcile().await;
        let export = h.export();
        for name in registry::SERIES.iter().map(|spec| spec.name) {
            assert_eq!(container_count(&export, name), 0, "series {name}");
        }
    }

    #[tokio::test]
    async fn test_vanished_interface_is_removed() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("c1", "web-1"), usage(1, &["eth0", "eth1"]));
        h.reconciler.reconcile().await;

        h.runtime
            .with(|state| state.usage.insert("c1".to_owned(), usage(1, &["eth0"])));
        let report = h.reconciler.reconcile().await;

        assert_eq!(report.removed, 1);
        let export = h.export();
        let lines = samples(&export, registry::NETWORK_RECEIVE_DROPPED);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(r#"interface="eth0""#));
        assert_eq!(container_count(&export, registry::PIDS), 1);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_previous_values() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(3, &["eth0"]));
        h.runtime.add(container("c2", "db-1"), usage(4, &[]));
        h.reconciler.reconcile().await;
        let before = h.export();

        h.runtime.with(|state| {
            state.failing_usage.insert("c1".to_owned());
            state.usage.insert("c1".to_owned(), usage(99, &[]));
        });
        let report = h.reconciler.reconcile().await;
        assert_eq!(report.containers, 1);
        assert_eq!(report.removed, 0);
        assert!(!report.is_degraded());
        assert!(matches!(
            &report.failures[..],
            [Failure::EntitySkipped { operation: Operation::SampleUsage, entity, .. }] if entity == "c1"
        ));
        assert_eq!(h.export(), before);

        // still failing on the next cycle: still retained
        h.reconciler.reconcile().await;
        assert_eq!(h.export(), before);

        // once gone from the listing it is removed like any other container
        h.runtime.remove("c1");
        let report = h.reconciler.reconcile().await;
        assert_eq!(report.removed, 3);
        let export = h.export();
        assert_eq!(container_count(&export, registry::PIDS), 1);
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_BYTES), 0);
        assert_eq!(container_count(&export, registry::CONTAINER_INFO), 1);
    }

    #[tokio::test]
    async fn test_recovered_sample_updates_values() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));
        h.runtime
            .with(|state| state.failing_usage.insert("c1".to_owned()));
        h.reconciler.reconcile().await;
        assert_eq!(container_count(&h.export(), registry::PIDS), 0);

        h.runtime
            .with(|state| state.failing_usage.remove("c1"));
        h.reconciler.reconcile().await;
        let export = h.export();
        assert!(samples(&export, registry::PIDS)[0].ends_with(" 3"));
    }

    #[tokio::test]
    async fn test_failed_inspect_skips_container() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));
        h.runtime
            .with(|state| state.failing_inspect.insert("c1".to_owned()));

        let report = h.reconciler.reconcile().await;
        assert_eq!(report.containers, 0);
        assert_eq!(report.failures[0].operation(), Operation::InspectContainer);
        assert_eq!(container_count(&h.export(), registry::PIDS), 0);
    }

    #[tokio::test]
    async fn test_info_disabled_never_inspects() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));

        h.reconciler.reconcile().await;

        assert_eq!(h.runtime.with(|state| state.inspect_calls), 0);
        assert!(!h.export().contains(registry::CONTAINER_INFO));
    }

    #[tokio::test]
    async fn test_failed_listing_removes_all_containers() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(3, &["eth0"]));
        h.add_mount("postgres");
        h.reconciler.reconcile().await;

        h.runtime.with(|state| state.containers = None);
        let report = h.reconciler.reconcile().await;

        assert!(report.is_degraded());
        assert_eq!(report.failures[0].operation(), Operation::ListContainers);
        let export = h.export();
        assert_eq!(container_count(&export, registry::PIDS), 0);
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_BYTES), 0);
        assert_eq!(container_count(&export, registry::CONTAINER_INFO), 0);
        assert_eq!(container_count(&export, registry::DATA_SIZE), 1);
    }

    #[tokio::test]
    async fn test_state_change_replaces_info_series() {
        let mut h = harness(LabelSchema::Compose, true);
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));
        h.reconciler.reconcile().await;

        h.runtime.with(|state| {
            state.states.insert(
                "c1".to_owned(),
                ContainerState {
                    status: "paused".to_owned(),
                    paused: true,
                    ..Default::default()
                },
            )
        });
        let report = h.reconciler.reconcile().await;

        assert_eq!(report.removed, 1);
        let export = h.export();
        let info = samples(&export, registry::CONTAINER_INFO);
        assert_eq!(info.len(), 1);
        assert!(info[0].contains(r#"container_state_paused="true""#));
        assert!(info[0].contains(r#"container_state_running="false""#));
    }

    #[tokio::test]
    async fn test_renamed_container_leaves_no_stale_series() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));
        h.reconciler.reconcile().await;

        h.runtime.with(|state| {
            if let Some(containers) = state.containers.as_mut() {
                containers[0].names = vec!["/frontend".to_owned()];
            }
        });
        h.reconciler.reconcile().await;

        let export = h.export();
        let pids = samples(&export, registry::PIDS);
        assert_eq!(pids.len(), 1);
        assert!(pids[0].contains(r#"container_name="frontend""#));
    }

    #[tokio::test]
    async fn test_mount_lifecycle() {
        let mut h = harness(LabelSchema::Compose, false);
        let postgres = h.add_mount("postgres");
        let grafana = h.add_mount("grafana");

        let report = h.reconciler.reconcile().await;
        assert_eq!(report.mounts, 2);
        let export = h.export();
        for name in registry::series_of(EntityKind::Mount) {
            assert_eq!(container_count(&export, name), 2, "series {name}");
        }
        let free = samples(&export, registry::DATA_FREE);
        assert!(free.iter().any(|l| l.contains(r#"name="postgres""#) && l.ends_with(" 163840")));
        assert!(samples(&export, registry::DATA_INODES)[0].ends_with(" 1000"));

        // stat failure keeps the previous values
        h.capacity.fail(&grafana);
        let report = h.reconciler.reconcile().await;
        assert_eq!(report.failures[0].operation(), Operation::StatMount);
        assert_eq!(h.export(), export);

        // removed directory drops its series
        std::fs::remove_dir(&postgres).unwrap();
        let report = h.reconciler.reconcile().await;
        assert_eq!(report.removed, 1);
        let export = h.export();
        assert_eq!(container_count(&export, registry::DATA_SIZE), 1);
        assert!(samples(&export, registry::DATA_SIZE)[0].contains(r#"name="grafana""#));
    }

    #[tokio::test]
    async fn test_unreadable_base_path_degrades_mounts() {
        let mut h = harness(LabelSchema::Compose, false);
        h.add_mount("postgres");
        h.reconciler.reconcile().await;

        h.reconciler.options.base_path = h.base.path().join("missing");
        let report = h.reconciler.reconcile().await;

        assert!(report.is_degraded());
        assert_eq!(report.failures[0].operation(), Operation::ListMounts);
        assert_eq!(container_count(&h.export(), registry::DATA_SIZE), 0);
    }

    #[tokio::test]
    async fn test_recreated_container_keeps_series() {
        let mut h = harness(LabelSchema::Compose, false);
        h.runtime.add(container("old", "web-1"), usage(3, &["eth0"]));
        h.reconciler.reconcile().await;

        h.runtime.remove("old");
        h.runtime.add(container("new", "web-1"), usage(7, &["eth0"]));
        let report = h.reconciler.reconcile().await;

        assert_eq!(report.removed, 0);
        let export = h.export();
        let pids = samples(&export, registry::PIDS);
        assert_eq!(pids.len(), 1);
        assert!(pids[0].contains(r#"container_name="web-1""#));
        assert!(pids[0].ends_with(" 7"));
        assert_eq!(container_count(&export, registry::NETWORK_RECEIVE_BYTES), 1);
    }

    #[tokio::test]
    async fn test_stalled_mount_does_not_block_runtime() {
        let mut h = harness(LabelSchema::Compose, false);
        h.add_mount("nfs");
        h.capacity.stall(Duration::from_millis(500));

        let timer = tokio::spawn(async {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            start.elapsed()
        });
        let report = h.reconciler.reconcile().await;

        assert_eq!(report.mounts, 1);
        assert!(timer.await.unwrap() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stalled_mount_is_skipped_after_timeout() {
        let mut h = harness(LabelSchema::Compose, false);
        let nfs = h.add_mount("nfs");
        h.runtime.add(container("c1", "web-1"), usage(3, &[]));
        h.reconciler.reconcile().await;
        let before = h.export();

        h.capacity.stall(Duration::from_millis(500));
        h.reconciler.options.stat_timeout = Duration::from_millis(20);
        let report = h.reconciler.reconcile().await;

        assert_eq!(report.containers, 1);
        assert_eq!(report.mounts, 0);
        assert!(!report.is_degraded());
        match &report.failures[..] {
            [
                Failure::EntitySkipped {
                    entity,
                    operation: Operation::StatMount,
                    source: crate::error::Error::Capacity(capacity::Error::Timeout { .. }),
                },
            ] => assert_eq!(entity, &nfs.display().to_string()),
            other => panic!("unexpected failures: {other:?}"),
        }
        assert_eq!(h.export(), before);
    }

    fn cycle_offsets(runtime: &FakeRuntime, start: tokio::time::Instant) -> Vec<u64> {
        runtime.with(|state| {
            state
                .list_calls
                .iter()
                .map(|at| at.duration_since(start).as_secs())
                .collect()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cycles_once_per_interval() {
        let Harness {
            runtime,
            reconciler,
            base: _base,
            ..
        } = harness(LabelSchema::Compose, false);
        let start = tokio::time::Instant::now();

        let task = tokio::spawn(reconciler.run(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(21)).await;
        task.abort();

        assert_eq!(cycle_offsets(&runtime, start), vec![0, 5, 10, 15, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_delays_after_slow_cycle() {
        let Harness {
            runtime,
            reconciler,
            base: _base,
            ..
        } = harness(LabelSchema::Compose, false);
        runtime.with(|state| state.list_delay = Duration::from_secs(12));
        let start = tokio::time::Instant::now();

        let task = tokio::spawn(reconciler.run(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(23)).await;
        task.abort();

        // the ticks missed during the slow cycle collapse into one
        assert_eq!(cycle_offsets(&runtime, start), vec![0, 12, 17, 22]);
    }
}
