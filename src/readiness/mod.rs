//! Readiness tracking for the self-hosted control plane
//!
//! A [`ReadinessTracker`] keeps a live index of every pod in the cluster (a
//! kube-rs reflector store fed by a watcher) and answers one question: does
//! every required role have a pod that is running and ready?
//!
//! Roles are matched by name prefix against pod identifiers of the form
//! `namespace/name`. When several pods match the same role the first one
//! returned by the index wins. The index does not promise an order, so the
//! binding can change between polls when pods share a prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Pod phase reported by running pods
pub const POD_PHASE_RUNNING: &str = "Running";
/// Condition type carrying pod readiness
pub const POD_CONDITION_READY: &str = "Ready";

/// Required roles: role name to acceptable pod identifier prefixes
pub type RequiredPods = BTreeMap<String, Vec<String>>;

/// The last known state of the pod bound to a role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadObservation {
    /// Pod phase (`Pending`, `Running`, ...), empty if not reported yet
    pub phase: String,
    /// Whether the pod's Ready condition is `True`
    pub ready: bool,
}

impl WorkloadObservation {
    /// Observation taken from a pod's status
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .rev()
                    .find(|c| c.type_ == POD_CONDITION_READY)
            })
            .is_some_and(|c| c.status == "True");
        Self { phase, ready }
    }

    /// Running and ready
    pub fn is_running_and_ready(&self) -> bool {
        self.phase == POD_PHASE_RUNNING && self.ready
    }
}

/// Observations per role at one instant; `None` means no matching pod
pub type ReadinessSnapshot = BTreeMap<String, Option<WorkloadObservation>>;

/// The state reported for a role on a status line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleStatus {
    /// No pod matches the role
    DoesNotExist,
    /// Running and ready
    Ready,
    /// Running but the Ready condition is not true
    RunningNotReady,
    /// Any other phase, reported verbatim
    Phase(String),
}

impl RoleStatus {
    /// Classify an observation
    pub fn of(observation: Option<&WorkloadObservation>) -> Self {
        match observation {
            None => Self::DoesNotExist,
            Some(o) if o.phase == POD_PHASE_RUNNING && o.ready => Self::Ready,
            Some(o) if o.phase == POD_PHASE_RUNNING => Self::RunningNotReady,
            Some(o) => Self::Phase(o.phase.clone()),
        }
    }
}

impl fmt::Display for RoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoesNotExist => f.write_str("DoesNotExist"),
            Self::Ready => f.write_str("Ready"),
            Self::RunningNotReady => f.write_str("RunningNotReady"),
            Self::Phase(phase) => f.write_str(phase),
        }
    }
}

/// Read side of the pod index
pub trait InstanceSource: Send + Sync {
    /// Every pod currently known
    fn instances(&self) -> Result<Vec<Arc<Pod>>>;
}

impl InstanceSource for Store<Pod> {
    fn instances(&self) -> Result<Vec<Arc<Pod>>> {
        Ok(self.state())
    }
}

/// A reflector store kept up to date by a background pod watch
#[derive(Clone)]
pub struct PodWatch {
    store: Store<Pod>,
    terminated: Arc<AtomicBool>,
}

impl PodWatch {
    /// Start watching pods in all namespaces.
    ///
    /// The watch runs until the process exits; it is never stopped explicitly.
    pub fn spawn(client: Client) -> Self {
        let api: Api<Pod> = Api::all(client);
        let (store, writer) = reflector::store();
        let terminated = Arc::new(AtomicBool::new(false));

        let flag = terminated.clone();
        tokio::spawn(async move {
            reflector(writer, watcher(api, watcher::Config::default()).default_backoff())
                .for_each(|event| async move {
                    if let Err(e) = event {
                        debug!(error = %e, "pod watch error");
                    }
                })
                .await;
            flag.store(true, Ordering::SeqCst);
            warn!("pod watch stream ended");
        });

        Self { store, terminated }
    }
}

impl InstanceSource for PodWatch {
    fn instances(&self) -> Result<Vec<Arc<Pod>>> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::readiness("pod watch has stopped, index is stale"));
        }
        Ok(self.store.state())
    }
}

/// Identifier used for prefix matching: `namespace/name`, or `name` for pods
/// without a namespace
pub fn instance_id(pod: &Pod) -> String {
    match pod.namespace() {
        Some(ns) => format!("{}/{}", ns, pod.name_any()),
        None => pod.name_any(),
    }
}

/// Tracks whether every required role has a running, ready pod
pub struct ReadinessTracker {
    required: RequiredPods,
    source: Option<Arc<dyn InstanceSource>>,
    last: Option<ReadinessSnapshot>,
}

impl ReadinessTracker {
    /// Create a tracker for the given roles. Call [`run`](Self::run) to start
    /// observing the cluster.
    pub fn new(required: RequiredPods) -> Self {
        Self {
            required,
            source: None,
            last: None,
        }
    }

    /// Create a tracker reading from an existing index
    pub fn with_source(required: RequiredPods, source: Arc<dyn InstanceSource>) -> Self {
        Self {
            required,
            source: Some(source),
            last: None,
        }
    }

    /// Start the pod subscription backing this tracker
    pub fn run(&mut self, client: Client) {
        info!(roles = self.required.len(), "Watching pods for required roles");
        self.source = Some(Arc::new(PodWatch::spawn(client)));
    }

    /// Whether every required role is bound to a running, ready pod.
    ///
    /// Prints one status line per role whenever the snapshot differs from the
    /// previous call's. Failures reading the index are logged and reported as
    /// "not ready"; this never returns an error.
    pub fn all_running_and_ready(&mut self) -> Result<bool> {
        let (ready, status_lines) = self.observe();
        for line in status_lines.into_iter().flatten() {
            println!("{}", line);
        }
        Ok(ready)
    }

    /// Evaluate the predicate once, returning the status lines to print.
    ///
    /// Lines are only returned when the snapshot differs from the one seen by
    /// the previous evaluation; the first evaluation returns none.
    fn observe(&mut self) -> (bool, Option<Vec<String>>) {
        let snapshot = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!(error = %e, "Error retrieving pod statuses");
                return (false, None);
            }
        };

        let all_ready = snapshot
            .values()
            .all(|o| o.as_ref().is_some_and(WorkloadObservation::is_running_and_ready));
        let status_lines = self.status_lines(snapshot);
        (all_ready, status_lines)
    }

    /// Record `snapshot` and render one line per role if it changed
    fn status_lines(&mut self, snapshot: ReadinessSnapshot) -> Option<Vec<String>> {
        let changed = self.last.as_ref().is_some_and(|last| *last != snapshot);
        let lines = changed.then(|| {
            snapshot
                .iter()
                .map(|(role, observation)| {
                    format!(
                        "\tPod Status:{:>24}\t{}",
                        role,
                        RoleStatus::of(observation.as_ref())
                    )
                })
                .collect()
        });
        self.last = Some(snapshot);
        lines
    }

    /// Bind each role to its first matching pod and observe it
    pub fn snapshot(&self) -> Result<ReadinessSnapshot> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::readiness("pod subscription not started"))?;
        let pods = source.instances()?;

        Ok(self
            .required
            .iter()
            .map(|(role, prefixes)| {
                let bound = pods.iter().find(|pod| {
                    let id = instance_id(pod);
                    prefixes.iter().any(|prefix| id.starts_with(prefix.as_str()))
                });
                (role.clone(), bound.map(|pod| WorkloadObservation::from_pod(pod)))
            })
            .collect())
    }
}
