//! Bootstrap orchestration
//!
//! The [`BootstrapOrchestrator`] drives one bootstrap run:
//!
//! 1. stage the temporary control plane (static pods plus secrets)
//! 2. create the asset manifests through the temporary API server while
//!    polling until the required self-hosted pods are running and ready
//! 3. announce success with the `kube-system/bootstrap-success` Event
//! 4. create the remaining assets in a second phase, optionally waiting for a
//!    tear down Event and optionally tearing down early
//! 5. tear down the temporary control plane
//!
//! The temporary control plane is always torn down before [`run`] returns,
//! whatever the outcome.
//!
//! [`run`]: BootstrapOrchestrator::run

use std::fmt;
use std::sync::Arc;

use bootstrap_common::cancel::{poll_until_done, CancelScope};
use bootstrap_common::events::{
    ClusterEvents, EventCreation, EventRef, BOOTSTRAP_SUCCESS_MESSAGE,
};
use bootstrap_common::kube_utils::local_endpoint_config;
use tracing::{info, warn};

use crate::applier::{AssetTask, ManifestApplier};
use crate::config::{BootstrapConfig, Timeouts};
use crate::readiness::ReadinessTracker;
use crate::stager::TemporaryControlPlane;
use crate::{Error, Result};

/// Where a bootstrap run is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing done yet
    Init,
    /// Temporary control plane staged
    Staged,
    /// First asset phase running, waiting for the required pods
    AwaitingReadiness,
    /// Required pods are running and ready
    ReadinessAchieved,
    /// Success marker created
    SuccessSignaled,
    /// Waiting for the tear down Event
    AwaitingTeardownSignal,
    /// Temporary control plane torn down early
    TornDown,
    /// All assets created
    Done,
    /// The run failed
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "Init",
            Self::Staged => "Staged",
            Self::AwaitingReadiness => "AwaitingReadiness",
            Self::ReadinessAchieved => "ReadinessAchieved",
            Self::SuccessSignaled => "SuccessSignaled",
            Self::AwaitingTeardownSignal => "AwaitingTeardownSignal",
            Self::TornDown => "TornDown",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Connection settings for the two API endpoints assets are created through
#[derive(Clone)]
pub struct ApiTargets {
    /// The cluster's permanent API endpoint, from the admin kubeconfig
    pub permanent: kube::Config,
    /// The temporary API server on this host
    pub local: kube::Config,
}

impl ApiTargets {
    /// Derive the local target from the permanent one
    pub fn from_permanent(permanent: kube::Config) -> Result<Self> {
        let local = local_endpoint_config(&permanent)?;
        Ok(Self { permanent, local })
    }
}

/// Drives a bootstrap run from staging to tear down
pub struct BootstrapOrchestrator<E: ClusterEvents> {
    config: BootstrapConfig,
    timeouts: Timeouts,
    targets: ApiTargets,
    tracker: ReadinessTracker,
    applier: Arc<dyn ManifestApplier>,
    events: E,
    state: BootstrapState,
}

impl<E: ClusterEvents> BootstrapOrchestrator<E> {
    /// Create an orchestrator with default timeouts
    pub fn new(
        config: BootstrapConfig,
        targets: ApiTargets,
        tracker: ReadinessTracker,
        applier: Arc<dyn ManifestApplier>,
        events: E,
    ) -> Self {
        Self {
            config,
            timeouts: Timeouts::default(),
            targets,
            tracker,
            applier,
            events,
            state: BootstrapState::Init,
        }
    }

    /// Override deadlines and poll intervals
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Current state
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the bootstrap to completion.
    ///
    /// The temporary control plane is torn down before returning unless it
    /// was already torn down early. A failing tear down is reported but does
    /// not change the result, except when staging itself failed.
    pub async fn run(&mut self) -> Result<()> {
        let mut control_plane = Some(TemporaryControlPlane::new(
            &self.config.asset_dir,
            &self.config.pod_manifest_path,
            &self.config.bootstrap_secrets_dir,
        ));

        let result = self.run_phases(&mut control_plane).await;
        if let Err(e) = &result {
            self.transition(BootstrapState::Failed);
            println!("Error: {}", e);
        }

        if let Some(mut control_plane) = control_plane.take() {
            if let Err(e) = control_plane.teardown() {
                println!("Error tearing down temporary bootstrap control plane: {}", e);
            }
        }
        result
    }

    async fn run_phases(
        &mut self,
        control_plane: &mut Option<TemporaryControlPlane>,
    ) -> Result<()> {
        if let Some(cp) = control_plane.as_mut() {
            if let Err(e) = cp.start() {
                let err = match cp.teardown() {
                    Ok(()) => e,
                    Err(teardown) => Error::stage_aborted(e, teardown),
                };
                *control_plane = None;
                return Err(err);
            }
        }
        self.transition(BootstrapState::Staged);

        self.await_readiness().await?;
        self.signal_success().await?;

        let scope = CancelScope::with_timeout("creating assets", self.timeouts.assets);
        let target = if self.config.early_tear_down {
            self.targets.permanent.clone()
        } else {
            self.targets.local.clone()
        };
        let assets = AssetTask::spawn(
            self.applier.clone(),
            self.config.manifests_dir(),
            target,
            scope.clone(),
        );

        if let Some(event) = self.config.tear_down_event.clone() {
            self.transition(BootstrapState::AwaitingTeardownSignal);
            if let Err(e) = self.wait_for_event(&event, &scope).await {
                return Err(prefer_task_error(assets, e).await);
            }
            println!("Got {} event.", event);
        }

        if self.config.early_tear_down {
            if let Some(mut cp) = control_plane.take() {
                if let Err(e) = cp.teardown() {
                    println!("Error tearing down temporary bootstrap control plane: {}", e);
                }
            }
            self.transition(BootstrapState::TornDown);
        }

        println!("Waiting for remaining assets to be created.");
        assets.wait().await?;
        self.transition(BootstrapState::Done);
        Ok(())
    }

    /// Create assets through the local API server until the required pods
    /// are ready or the readiness window closes
    async fn await_readiness(&mut self) -> Result<()> {
        let scope = CancelScope::with_timeout("waiting for required pods", self.timeouts.readiness);
        let assets = AssetTask::spawn(
            self.applier.clone(),
            self.config.manifests_dir(),
            self.targets.local.clone(),
            scope.clone(),
        );
        self.transition(BootstrapState::AwaitingReadiness);

        let tracker = &mut self.tracker;
        let polled = poll_until_done(&scope, self.timeouts.readiness_poll, || {
            let ready = tracker.all_running_and_ready();
            async move { ready }
        })
        .await;

        scope.cancel();
        if let Err(e) = polled {
            return Err(prefer_task_error(assets, e).await);
        }

        println!("All self-hosted control plane components successfully started");
        self.transition(BootstrapState::ReadinessAchieved);

        // the second phase applies the same manifests again
        if let Err(e) = assets.wait().await {
            warn!(error = %e, "First asset phase failed after the control plane became ready");
        }
        Ok(())
    }

    async fn signal_success(&mut self) -> Result<()> {
        println!("Sending bootstrap-success event.");
        let marker = EventRef::bootstrap_success();
        match self
            .events
            .create_event(&marker, BOOTSTRAP_SUCCESS_MESSAGE)
            .await?
        {
            EventCreation::Created => info!(event = %marker, "Created bootstrap success event"),
            EventCreation::AlreadyExists => {
                info!(event = %marker, "Bootstrap success event already exists")
            }
        }
        self.transition(BootstrapState::SuccessSignaled);
        Ok(())
    }

    async fn wait_for_event(&self, event: &EventRef, scope: &CancelScope) -> Result<()> {
        let events = &self.events;
        poll_until_done(scope, self.timeouts.event_poll, || async move {
            match events.event_exists(event).await {
                Ok(found) => Ok(found),
                Err(e) => {
                    println!("Error waiting for {} event: {}", event, e);
                    Ok(false)
                }
            }
        })
        .await
    }

    fn transition(&mut self, next: BootstrapState) {
        info!(from = %self.state, to = %next, "Bootstrap state transition");
        self.state = next;
    }
}

/// The phase's own failure explains a scope ending better than the scope
/// error does
async fn prefer_task_error(assets: AssetTask, scope_err: Error) -> Error {
    assets.scope().cancel();
    match assets.wait().await {
        Err(task_err) => task_err,
        Ok(()) => scope_err,
    }
}
