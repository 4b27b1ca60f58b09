//! Production wiring for `cluster-bootstrap start`

use std::sync::Arc;

use bootstrap_common::events::KubeClusterEvents;
use bootstrap_common::kube_utils::{create_client, load_kubeconfig};
use tracing::info;

use crate::applier::KubeManifestApplier;
use crate::config::BootstrapConfig;
use crate::orchestrator::{ApiTargets, BootstrapOrchestrator};
use crate::readiness::ReadinessTracker;
use crate::Result;

/// Bootstrap the cluster described by `config` against the real API server
/// and filesystem
pub async fn run(config: BootstrapConfig) -> Result<()> {
    config.validate()?;

    let kubeconfig = config.admin_kubeconfig();
    info!(kubeconfig = %kubeconfig.display(), "Loading admin kubeconfig");
    let permanent = load_kubeconfig(&kubeconfig).await?;
    let targets = ApiTargets::from_permanent(permanent.clone())?;

    // the permanent endpoint serves once the temporary API server is up
    let client = create_client(permanent)?;

    let mut tracker = ReadinessTracker::new(config.required_pods.clone());
    tracker.run(client.clone());

    let applier = Arc::new(KubeManifestApplier::new(config.strict));
    let events = KubeClusterEvents::new(client);

    BootstrapOrchestrator::new(config, targets, tracker, applier, events)
        .run()
        .await
}
