//! Fixed layout of the bootstrap asset directory

/// Secrets tree copied into the temporary secrets directory
pub const ASSET_PATH_SECRETS: &str = "tls";
/// Admin kubeconfig used to reach the cluster
pub const ASSET_PATH_ADMIN_KUBECONFIG: &str = "auth/kubeconfig";
/// Manifests for the permanent control plane, created through the API
pub const ASSET_PATH_MANIFESTS: &str = "manifests";
/// Static pod manifests for the temporary control plane
pub const ASSET_PATH_BOOTSTRAP_MANIFESTS: &str = "bootstrap-manifests";

/// File name of the admin kubeconfig inside the temporary secrets directory
pub const STAGED_KUBECONFIG_NAME: &str = "kubeconfig";

/// Default location of the temporary control plane's secrets
pub const DEFAULT_BOOTSTRAP_SECRETS_DIR: &str = "/etc/kubernetes/bootstrap-secrets";
/// Default directory watched by the kubelet for static pods
pub const DEFAULT_POD_MANIFEST_PATH: &str = "/etc/kubernetes/manifests";
