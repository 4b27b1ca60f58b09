//! Kubernetes client construction and manifest application using kube-rs
//!
//! Provides the kubectl-equivalent operations the bootstrap needs without
//! shelling out: loading a kubeconfig, pointing a client at the local API
//! server, and creating every manifest in a directory with server-side apply.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Client, Config};
use tracing::{debug, info, warn};

use crate::cancel::{run_until_done, CancelScope};
use crate::manifests::{load_manifests, parse_api_version, ManifestObject};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Address of the API server started from the temporary manifests
pub const LOCAL_API_ENDPOINT: &str = "https://localhost:6443";

/// Field manager recorded on applied objects
pub const FIELD_MANAGER: &str = "cluster-bootstrap";

/// Load a client configuration from a kubeconfig file with default timeouts
pub async fn load_kubeconfig(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::internal_with_context(
            "load_kubeconfig",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "load_kubeconfig",
                format!("failed to load kubeconfig {}: {}", path.display(), e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Create a client from a configuration
pub fn create_client(config: Config) -> Result<Client, Error> {
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Derive a configuration that talks to the local API server.
///
/// The cluster URL becomes [`LOCAL_API_ENDPOINT`] while TLS verification
/// still expects the certificate issued for the original host name.
pub fn local_endpoint_config(config: &Config) -> Result<Config, Error> {
    let host = config
        .cluster_url
        .host()
        .ok_or_else(|| {
            Error::config(format!(
                "cluster URL {} has no host to use as TLS server name",
                config.cluster_url
            ))
        })?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let mut local = config.clone();
    local.cluster_url = LOCAL_API_ENDPOINT.parse().map_err(|e| {
        Error::internal_with_context("local_endpoint_config", format!("invalid URL: {}", e))
    })?;
    local.tls_server_name = Some(host);
    Ok(local)
}

/// Options for [`ensure_manifests_created`]
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Print every created object and every failed round to stdout
    pub verbose: bool,
    /// Treat unparseable manifest files as fatal instead of skipping them
    pub strict: bool,
    /// Backoff between rounds
    pub retry: RetryConfig,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            strict: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Ensure every object in the manifest directory exists on the target cluster.
///
/// Objects are applied in kind-priority order. Objects that fail are retried
/// in later rounds, with API discovery refreshed each round so that CRDs
/// created earlier become resolvable, until all of them are applied or the
/// scope ends. Every request is abandoned as soon as the scope ends.
pub async fn ensure_manifests_created(
    client: &Client,
    dir: &Path,
    options: &CreateOptions,
    scope: &CancelScope,
) -> Result<(), Error> {
    let pending = load_manifests(dir, options.strict)?;
    info!(dir = %dir.display(), objects = pending.len(), "Creating manifests");

    apply_in_rounds(
        pending,
        options,
        scope,
        move || {
            retry_with_backoff(&options.retry, "api-discovery", scope, move || {
                let client = client.clone();
                async move { Discovery::new(client).run().await.map_err(Error::from) }
            })
        },
        |discovery: &Discovery, obj: ManifestObject| {
            let api = object_api(client, discovery, &obj);
            async move { patch_object(api?, &obj).await }
        },
    )
    .await
}

/// Apply `pending` in rounds until every object succeeded or the scope ends.
///
/// `discover` runs once per round; `apply` runs once per pending object with
/// that round's discovery result. Failed objects are carried into the next
/// round after a backoff delay.
async fn apply_in_rounds<C, D, DFut, A, AFut>(
    mut pending: Vec<ManifestObject>,
    options: &CreateOptions,
    scope: &CancelScope,
    mut discover: D,
    mut apply: A,
) -> Result<(), Error>
where
    D: FnMut() -> DFut,
    DFut: Future<Output = Result<C, Error>>,
    A: FnMut(&C, ManifestObject) -> AFut,
    AFut: Future<Output = Result<(), Error>>,
{
    let mut backoff = options.retry.backoff();
    let mut round = 0u32;

    while !pending.is_empty() {
        round += 1;
        if let Some(err) = scope.err() {
            return Err(err);
        }

        let discovered = run_until_done(scope, discover()).await?;

        let mut failed = Vec::new();
        for obj in pending {
            match run_until_done(scope, apply(&discovered, obj.clone())).await {
                Ok(()) => {
                    if options.verbose {
                        println!(
                            "Created {:?} {} {}",
                            obj.file.display().to_string(),
                            obj.kind,
                            obj.display_name()
                        );
                    }
                }
                Err(e) => {
                    if let Some(err) = scope.err() {
                        return Err(err);
                    }
                    debug!(kind = %obj.kind, name = %obj.display_name(), error = %e, "apply failed");
                    failed.push((obj, e));
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        if options.verbose {
            println!("Failed to create {} manifests in round {}:", failed.len(), round);
            for (obj, e) in &failed {
                println!("\t{} {}: {}", obj.kind, obj.display_name(), e);
            }
        }

        // a fresh API server rejects objects until namespaces, CRDs and
        // admission settle, so every failure is retried until the scope ends
        warn!(failed = failed.len(), round, "Some manifests failed to apply, retrying");
        pending = failed.into_iter().map(|(obj, _)| obj).collect();

        tokio::select! {
            _ = scope.done() => {}
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    Ok(())
}

/// Apply a single object with server-side apply, resolving its resource
/// through discovery.
pub async fn apply_object(
    client: &Client,
    discovery: &Discovery,
    obj: &ManifestObject,
) -> Result<(), Error> {
    patch_object(object_api(client, discovery, obj)?, obj).await
}

/// Dynamic API handle for the object's resource type
fn object_api(
    client: &Client,
    discovery: &Discovery,
    obj: &ManifestObject,
) -> Result<Api<DynamicObject>, Error> {
    let (group, version) = parse_api_version(&obj.api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind: obj.kind.clone(),
    };

    let Some((api_resource, _)) = discovery.resolve_gvk(&gvk) else {
        return Err(Error::apply_for_file(
            obj.file.clone(),
            format!("unknown resource type {}/{}", obj.api_version, obj.kind),
        ));
    };

    Ok(match &obj.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &api_resource),
        None => Api::all_with(client.clone(), &api_resource),
    })
}

async fn patch_object(api: Api<DynamicObject>, obj: &ManifestObject) -> Result<(), Error> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&obj.name, &params, &Patch::Apply(&obj.value))
        .await?;

    debug!(kind = %obj.kind, name = %obj.display_name(), "applied manifest");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_config() -> Config {
        Config::new("https://api.cluster.example.com:6443".parse().unwrap())
    }

    #[test]
    fn local_endpoint_keeps_original_host_for_tls() {
        let local = local_endpoint_config(&remote_config()).unwrap();
        assert_eq!(local.cluster_url.host(), Some("localhost"));
        assert_eq!(local.cluster_url.port_u16(), Some(6443));
        assert_eq!(
            local.tls_server_name.as_deref(),
            Some("api.cluster.example.com")
        );
    }

    #[test]
    fn local_endpoint_does_not_touch_the_original() {
        let remote = remote_config();
        let _ = local_endpoint_config(&remote).unwrap();
        assert_eq!(remote.cluster_url.host(), Some("api.cluster.example.com"));
        assert!(remote.tls_server_name.is_none());
    }

    #[test]
    fn local_endpoint_strips_ipv6_brackets() {
        let remote = Config::new("https://[fd00::1]:6443".parse().unwrap());
        let local = local_endpoint_config(&remote).unwrap();
        assert_eq!(local.tls_server_name.as_deref(), Some("fd00::1"));
    }

    #[test]
    fn default_create_options_are_verbose_and_lenient() {
        let options = CreateOptions::default();
        assert!(options.verbose);
        assert!(!options.strict);
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_kubeconfig(&dir.path().join("auth/kubeconfig"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kubeconfig"));
    }

    fn object(kind: &str, name: &str) -> ManifestObject {
        ManifestObject {
            file: format!("/assets/manifests/{}.yaml", name).into(),
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: Some("openshift-config".to_string()),
            value: serde_json::json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": { "name": name, "namespace": "openshift-config" },
            }),
        }
    }

    fn quiet() -> CreateOptions {
        CreateOptions {
            verbose: false,
            ..Default::default()
        }
    }

    fn forbidden() -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "namespace openshift-config is terminating".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_abandons_a_stalled_apply_round() {
        let scope = CancelScope::with_timeout("assets", Duration::from_secs(3600));
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = apply_in_rounds(
            vec![object("ConfigMap", "first"), object("ConfigMap", "stalled")],
            &quiet(),
            &scope,
            || async { Ok(()) },
            |_: &(), obj: ManifestObject| async move {
                if obj.name == "stalled" {
                    // a server that accepted the request and never answers
                    std::future::pending::<()>().await;
                }
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })), "got {result:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_a_stalled_discovery() {
        let scope = CancelScope::with_timeout("assets", Duration::from_secs(30));

        let result = apply_in_rounds(
            vec![object("ConfigMap", "first")],
            &quiet(),
            &scope,
            || std::future::pending::<Result<(), Error>>(),
            |_: &(), _obj: ManifestObject| async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(Error::DeadlineExceeded { .. })), "got {result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn api_rejections_are_retried_in_later_rounds() {
        let scope = CancelScope::with_timeout("assets", Duration::from_secs(3600));
        let mut rounds = 0u32;
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = apply_in_rounds(
            vec![object("Namespace", "openshift-config"), object("ConfigMap", "cluster-config")],
            &quiet(),
            &scope,
            || {
                rounds += 1;
                async { Ok(()) }
            },
            |_: &(), obj: ManifestObject| {
                let n = if obj.kind == "ConfigMap" {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                } else {
                    u32::MAX
                };
                async move {
                    if n < 2 {
                        Err(forbidden())
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok(), "got {result:?}");
        assert_eq!(rounds, 3);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
