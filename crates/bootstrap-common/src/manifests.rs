//! Loading manifest directories from disk
//!
//! A manifest directory is walked recursively in lexical order. Every
//! `.yaml`, `.yml` or `.json` file contributes one object per non-empty
//! document. Objects come back sorted by [`kind_priority`] so that namespaces
//! and CRDs exist before anything that lives in them.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{yaml, Error};

/// File extensions treated as manifests
pub const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// A single Kubernetes object read from a manifest file
#[derive(Clone, Debug)]
pub struct ManifestObject {
    /// File the object came from
    pub file: PathBuf,
    /// `apiVersion` of the object
    pub api_version: String,
    /// `kind` of the object
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
    /// The full object
    pub value: Value,
}

impl ManifestObject {
    /// Human-readable `namespace/name` (or just `name` when cluster scoped)
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    fn from_value(file: &Path, value: Value) -> Result<Self, Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Header {
            api_version: String,
            kind: String,
            metadata: Meta,
        }

        #[derive(Deserialize)]
        struct Meta {
            name: String,
            namespace: Option<String>,
        }

        let header: Header = serde_json::from_value(value.clone())
            .map_err(|e| Error::manifest(file, format!("missing object header: {}", e)))?;

        Ok(Self {
            file: file.to_path_buf(),
            api_version: header.api_version,
            kind: header.kind,
            name: header.metadata.name,
            namespace: header.metadata.namespace,
            value,
        })
    }
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 8,
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use bootstrap_common::manifests::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// List manifest files under `dir`, recursively, in lexical order
pub fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), Error> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| Error::manifest(dir, format!("failed to read directory: {}", e)))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::manifest(dir, format!("failed to read directory: {}", e)))?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
    Ok(())
}

/// Load every object from the manifest files under `dir`.
///
/// In strict mode a file that cannot be read or parsed is an error. Otherwise
/// it is logged and skipped.
pub fn load_manifests(dir: &Path, strict: bool) -> Result<Vec<ManifestObject>, Error> {
    let mut objects = Vec::new();

    for file in manifest_files(dir)? {
        match load_file(&file) {
            Ok(mut loaded) => objects.append(&mut loaded),
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping unparseable manifest");
            }
        }
    }

    // Stable sort keeps file order within a priority class.
    objects.sort_by_key(|obj| kind_priority(&obj.kind));
    Ok(objects)
}

fn load_file(file: &Path) -> Result<Vec<ManifestObject>, Error> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| Error::manifest(file, format!("failed to read: {}", e)))?;
    let docs = yaml::parse_documents(&content).map_err(|e| Error::manifest(file, e.to_string()))?;
    docs.into_iter()
        .map(|doc| ManifestObject::from_value(file, doc))
        .collect()
}
