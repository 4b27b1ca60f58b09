//! Bootstrap configuration
//!
//! [`BootstrapConfig`] is the validated input of one bootstrap run. The CLI
//! builds it from flags and environment variables; tests build it directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bootstrap_common::events::EventRef;

use crate::assets::{
    ASSET_PATH_ADMIN_KUBECONFIG, ASSET_PATH_MANIFESTS, DEFAULT_BOOTSTRAP_SECRETS_DIR,
    DEFAULT_POD_MANIFEST_PATH,
};
use crate::readiness::RequiredPods;
use crate::{Error, Result};

/// Time allowed for the required pods to become ready
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Time allowed for the remaining assets to be created
pub const DEFAULT_ASSETS_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Interval between readiness checks
pub const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Interval between lookups of the tear down event
pub const DEFAULT_EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Control plane roles waited for when none are configured
pub const DEFAULT_REQUIRED_ROLES: &[&str] = &[
    "kube-apiserver",
    "kube-scheduler",
    "kube-controller-manager",
];

/// Deadlines and poll intervals of a bootstrap run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Window shared by the first asset phase and the readiness poll
    pub readiness: Duration,
    /// Window of the second asset phase and the tear down event poll
    pub assets: Duration,
    /// Interval between readiness checks
    pub readiness_poll: Duration,
    /// Interval between tear down event lookups
    pub event_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness: DEFAULT_READINESS_TIMEOUT,
            assets: DEFAULT_ASSETS_TIMEOUT,
            readiness_poll: DEFAULT_READINESS_POLL_INTERVAL,
            event_poll: DEFAULT_EVENT_POLL_INTERVAL,
        }
    }
}

/// Input of one bootstrap run
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Root of the rendered bootstrap assets
    pub asset_dir: PathBuf,
    /// Directory the kubelet loads static pods from
    pub pod_manifest_path: PathBuf,
    /// Where the temporary control plane's secrets are staged
    pub bootstrap_secrets_dir: PathBuf,
    /// Fail on manifests that cannot be parsed instead of skipping them
    pub strict: bool,
    /// Roles that must be running and ready before bootstrap succeeds
    pub required_pods: RequiredPods,
    /// Event to wait for before tearing down
    pub tear_down_event: Option<EventRef>,
    /// Tear down the temporary control plane before the remaining assets
    /// are created, and create them through the permanent control plane
    pub early_tear_down: bool,
}

impl BootstrapConfig {
    /// Configuration with defaults for everything but the asset directory
    pub fn new(asset_dir: impl Into<PathBuf>) -> Self {
        Self {
            asset_dir: asset_dir.into(),
            pod_manifest_path: PathBuf::from(DEFAULT_POD_MANIFEST_PATH),
            bootstrap_secrets_dir: PathBuf::from(DEFAULT_BOOTSTRAP_SECRETS_DIR),
            strict: false,
            required_pods: default_required_pods(),
            tear_down_event: None,
            early_tear_down: false,
        }
    }

    /// Manifests created through the API
    pub fn manifests_dir(&self) -> PathBuf {
        self.asset_dir.join(ASSET_PATH_MANIFESTS)
    }

    /// Admin kubeconfig used to reach the cluster
    pub fn admin_kubeconfig(&self) -> PathBuf {
        self.asset_dir.join(ASSET_PATH_ADMIN_KUBECONFIG)
    }

    /// Check the configuration before anything is staged
    pub fn validate(&self) -> Result<()> {
        if self.asset_dir.as_os_str().is_empty() {
            return Err(Error::config("asset directory must be set"));
        }
        if !is_dir(&self.asset_dir) {
            return Err(Error::config(format!(
                "asset directory {} does not exist",
                self.asset_dir.display()
            )));
        }
        for (role, prefixes) in &self.required_pods {
            if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
                return Err(Error::config(format!(
                    "required pod role {:?} needs at least one non-empty prefix",
                    role
                )));
            }
        }
        Ok(())
    }
}

fn is_dir(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_dir())
}

/// The roles waited for by default, each matched in `kube-system`
pub fn default_required_pods() -> RequiredPods {
    DEFAULT_REQUIRED_ROLES
        .iter()
        .map(|role| (role.to_string(), vec![format!("kube-system/{}", role)]))
        .collect()
}

/// Parse `ROLE=PREFIX[,PREFIX...]` entries into required roles.
///
/// A role given more than once accumulates its prefixes.
///
/// ```
/// use cluster_bootstrap::config::parse_required_pods;
///
/// let roles = parse_required_pods(["etcd=kube-system/etcd-,openshift-etcd/etcd-"]).unwrap();
/// assert_eq!(roles["etcd"], vec!["kube-system/etcd-", "openshift-etcd/etcd-"]);
/// ```
pub fn parse_required_pods<I, S>(entries: I) -> Result<RequiredPods>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut roles: RequiredPods = BTreeMap::new();
    for entry in entries {
        let entry = entry.as_ref();
        let (role, prefixes) = entry.split_once('=').ok_or_else(|| {
            Error::config(format!(
                "required pod of format <role>=<prefix>[,<prefix>...] expected, got: {:?}",
                entry
            ))
        })?;
        let role = role.trim();
        if role.is_empty() {
            return Err(Error::config(format!("empty role in {:?}", entry)));
        }
        let prefixes: Vec<String> = prefixes
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        if prefixes.is_empty() {
            return Err(Error::config(format!("no prefixes for role {:?}", role)));
        }
        roles.entry(role.to_string()).or_default().extend(prefixes);
    }
    Ok(roles)
}
