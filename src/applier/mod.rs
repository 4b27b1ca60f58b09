//! Background manifest application
//!
//! Each bootstrap phase runs one [`AssetTask`]: a spawned task that applies
//! the asset manifests to a target API server under the phase's
//! [`CancelScope`]. A failure that is not caused by the scope ending cancels
//! the scope, so whoever waits on the same scope (the readiness poll, the
//! teardown-event poll) wakes up instead of waiting out the deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bootstrap_common::cancel::{CancelScope, DoneCause};
use bootstrap_common::kube_utils::{self, CreateOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{Error, Result};

/// Applies every manifest in a directory to a target cluster
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Ensure every manifest under `dir` exists on the cluster behind
    /// `target`, giving up when `scope` ends
    async fn ensure_manifests_created(
        &self,
        dir: &Path,
        target: &kube::Config,
        scope: &CancelScope,
    ) -> Result<()>;
}

/// Applies manifests with server-side apply through a client built for the
/// target
#[derive(Clone, Debug, Default)]
pub struct KubeManifestApplier {
    strict: bool,
}

impl KubeManifestApplier {
    /// Create an applier; `strict` makes unparseable manifests fatal
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

#[async_trait]
impl ManifestApplier for KubeManifestApplier {
    async fn ensure_manifests_created(
        &self,
        dir: &Path,
        target: &kube::Config,
        scope: &CancelScope,
    ) -> Result<()> {
        let client = kube_utils::create_client(target.clone())?;
        let options = CreateOptions {
            verbose: true,
            strict: self.strict,
            ..Default::default()
        };
        kube_utils::ensure_manifests_created(&client, dir, &options, scope).await
    }
}

/// Handle to one phase's background manifest application
pub struct AssetTask {
    scope: CancelScope,
    handle: JoinHandle<Result<()>>,
}

impl AssetTask {
    /// Start applying `dir` to `target` in the background.
    ///
    /// The task's outcome, as seen by [`wait`](Self::wait):
    /// - success: `Ok`
    /// - the scope was cancelled from outside: `Ok`, the failure is expected
    /// - the scope's deadline passed: [`Error::DeadlineExceeded`]
    /// - any other failure: the failure, after cancelling the scope
    pub fn spawn(
        applier: Arc<dyn ManifestApplier>,
        dir: PathBuf,
        target: kube::Config,
        scope: CancelScope,
    ) -> Self {
        let task_scope = scope.clone();
        let handle = tokio::spawn(async move {
            let result = applier
                .ensure_manifests_created(&dir, &target, &task_scope)
                .await;
            let Err(e) = result else {
                info!(dir = %dir.display(), "All assets created");
                return Ok(());
            };

            match task_scope.cause() {
                Some(DoneCause::Cancelled) => {
                    debug!(error = %e, "asset creation stopped by cancellation");
                    Ok(())
                }
                Some(DoneCause::DeadlineExceeded) => Err(Error::deadline_exceeded(
                    task_scope.name(),
                    task_scope.timeout(),
                )),
                None => {
                    println!("Asset creation failed: {}", e);
                    task_scope.cancel();
                    Err(e)
                }
            }
        });

        Self { scope, handle }
    }

    /// The scope this task runs under
    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to finish and return its outcome
    pub async fn wait(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::internal_with_context(
                "asset_task",
                format!("asset creation task did not complete: {}", e),
            )),
        }
    }
}
