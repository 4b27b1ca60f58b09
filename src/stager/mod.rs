//! Temporary control plane staging
//!
//! The temporary control plane is a set of static pod manifests plus the
//! secrets they mount. Staging copies the secrets tree and the admin
//! kubeconfig into a private secrets directory, then drops the bootstrap
//! manifests into the kubelet's static pod directory. Teardown removes exactly
//! what staging created.
//!
//! Manifests are never written over existing files: a static pod directory
//! that already holds a file with the same name is a conflict, and whatever
//! was copied before the conflict stays in place (and stays owned, so a later
//! teardown still removes it).

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::assets::{
    ASSET_PATH_ADMIN_KUBECONFIG, ASSET_PATH_BOOTSTRAP_MANIFESTS, ASSET_PATH_SECRETS,
    STAGED_KUBECONFIG_NAME,
};
use crate::{Error, Result};

/// Permissions for staged directories
const DIR_MODE: u32 = 0o700;
/// Permissions for staged files
const FILE_MODE: u32 = 0o600;

/// The staged temporary control plane
///
/// Every path in [`owned_manifests`](Self::owned_manifests) was created by this
/// instance; teardown removes those paths and nothing else from the manifest
/// directory.
#[derive(Debug)]
pub struct TemporaryControlPlane {
    asset_dir: PathBuf,
    pod_manifest_path: PathBuf,
    secrets_dir: PathBuf,
    owned_manifests: Vec<PathBuf>,
    staged: bool,
}

impl TemporaryControlPlane {
    /// Create an unstaged control plane.
    ///
    /// * `asset_dir` - root of the rendered bootstrap assets
    /// * `pod_manifest_path` - static pod directory the manifests are copied into
    /// * `secrets_dir` - private directory the secrets are staged in
    pub fn new(
        asset_dir: impl Into<PathBuf>,
        pod_manifest_path: impl Into<PathBuf>,
        secrets_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            asset_dir: asset_dir.into(),
            pod_manifest_path: pod_manifest_path.into(),
            secrets_dir: secrets_dir.into(),
            owned_manifests: Vec::new(),
            staged: false,
        }
    }

    /// Directory holding the staged secrets
    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    /// Manifest paths created by [`start`](Self::start)
    pub fn owned_manifests(&self) -> &[PathBuf] {
        &self.owned_manifests
    }

    /// Stage secrets, kubeconfig and static pod manifests.
    ///
    /// A secrets directory left behind by a previous run is removed first.
    /// Fails with [`Error::ManifestConflict`] if a manifest destination
    /// already exists; manifests copied before that point are kept and owned.
    pub fn start(&mut self) -> Result<()> {
        println!("Starting temporary bootstrap control plane...");
        self.staged = true;

        remove_dir_all_if_present(&self.secrets_dir)?;

        let secrets_src = self.asset_dir.join(ASSET_PATH_SECRETS);
        copy_directory(&secrets_src, &self.secrets_dir, true, &mut Vec::new())?;

        copy_file(
            &self.asset_dir.join(ASSET_PATH_ADMIN_KUBECONFIG),
            &self.secrets_dir.join(STAGED_KUBECONFIG_NAME),
            true,
        )?;

        let manifests_src = self.asset_dir.join(ASSET_PATH_BOOTSTRAP_MANIFESTS);
        copy_directory(
            &manifests_src,
            &self.pod_manifest_path,
            false,
            &mut self.owned_manifests,
        )?;

        info!(
            secrets_dir = %self.secrets_dir.display(),
            manifests = self.owned_manifests.len(),
            "Temporary control plane staged"
        );
        Ok(())
    }

    /// Remove the staged secrets directory and every owned manifest.
    ///
    /// Does nothing on a control plane that was never started or has already
    /// been torn down. Manifests that are already gone are skipped.
    pub fn teardown(&mut self) -> Result<()> {
        if !self.staged {
            return Ok(());
        }
        println!("Tearing down temporary bootstrap control plane...");

        remove_dir_all_if_present(&self.secrets_dir)?;

        for manifest in &self.owned_manifests {
            match std::fs::remove_file(manifest) {
                Ok(()) => debug!(path = %manifest.display(), "removed manifest"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::stage_io(manifest, e)),
            }
        }

        self.owned_manifests.clear();
        self.staged = false;
        Ok(())
    }
}

fn remove_dir_all_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::stage_io(path, e)),
    }
}

/// Copy `src` to `dst` with owner-only permissions.
///
/// Without `overwrite` an existing `dst` is a [`Error::ManifestConflict`] and
/// is left untouched.
fn copy_file(src: &Path, dst: &Path, overwrite: bool) -> Result<()> {
    let mut src_file = File::open(src).map_err(|e| Error::stage_io(src, e))?;

    let mut options = OpenOptions::new();
    options.write(true).mode(FILE_MODE);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let mut dst_file = match options.open(dst) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(Error::manifest_conflict(dst));
        }
        Err(e) => return Err(Error::stage_io(dst, e)),
    };

    std::io::copy(&mut src_file, &mut dst_file).map_err(|e| Error::stage_io(dst, e))?;
    debug!(src = %src.display(), dst = %dst.display(), "copied file");
    Ok(())
}

/// Copy the tree under `src_dir` into `dst_dir`, keeping relative paths.
///
/// Entries are visited in lexical order and the first failure stops the walk.
/// Every file created is appended to `copied` as it is created.
fn copy_directory(
    src_dir: &Path,
    dst_dir: &Path,
    overwrite: bool,
    copied: &mut Vec<PathBuf>,
) -> Result<()> {
    match DirBuilder::new().mode(DIR_MODE).create(dst_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::stage_io(dst_dir, e)),
    }

    let mut entries = std::fs::read_dir(src_dir)
        .map_err(|e| Error::stage_io(src_dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::stage_io(src_dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let src = entry.path();
        let dst = dst_dir.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::stage_io(&src, e))?;

        if file_type.is_dir() {
            copy_directory(&src, &dst, overwrite, copied)?;
        } else {
            copy_file(&src, &dst, overwrite)?;
            copied.push(dst);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const SECRETS: &[&str] = &["secret-1.yaml", "secret-2.yaml", "secret-3.yaml"];
    const MANIFESTS: &[&str] = &["pod-1.yaml", "pod-2.yaml"];

    struct Fixture {
        assets: TempDir,
        pod_manifests: TempDir,
        scratch: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                assets: tempfile::tempdir().unwrap(),
                pod_manifests: tempfile::tempdir().unwrap(),
                scratch: tempfile::tempdir().unwrap(),
            };
            let assets = fixture.assets.path();
            std::fs::create_dir_all(assets.join("auth")).unwrap();
            std::fs::write(assets.join(ASSET_PATH_ADMIN_KUBECONFIG), "kubeconfig data").unwrap();
            std::fs::create_dir_all(assets.join(ASSET_PATH_SECRETS)).unwrap();
            for secret in SECRETS {
                std::fs::write(assets.join(ASSET_PATH_SECRETS).join(secret), "secret data")
                    .unwrap();
            }
            std::fs::create_dir_all(assets.join(ASSET_PATH_BOOTSTRAP_MANIFESTS)).unwrap();
            for manifest in MANIFESTS {
                std::fs::write(
                    assets.join(ASSET_PATH_BOOTSTRAP_MANIFESTS).join(manifest),
                    "manifest data",
                )
                .unwrap();
            }
            fixture
        }

        fn secrets_dir(&self) -> PathBuf {
            self.scratch.path().join("bootstrap-secrets")
        }

        fn control_plane(&self) -> TemporaryControlPlane {
            TemporaryControlPlane::new(
                self.assets.path(),
                self.pod_manifests.path(),
                self.secrets_dir(),
            )
        }

        fn manifest(&self, name: &str) -> PathBuf {
            self.pod_manifests.path().join(name)
        }
    }

    fn names_in(dir: &Path) -> BTreeSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    // ==========================================================================
    // Story: staging and tearing down a clean control plane
    // ==========================================================================

    #[test]
    fn start_stages_secrets_kubeconfig_and_manifests() {
        let fx = Fixture::new();
        let mut cp = fx.control_plane();

        cp.start().unwrap();

        let mut expected: BTreeSet<String> = SECRETS.iter().map(|s| s.to_string()).collect();
        expected.insert(STAGED_KUBECONFIG_NAME.to_string());
        assert_eq!(names_in(&fx.secrets_dir()), expected);
        assert_eq!(
            std::fs::read_to_string(fx.secrets_dir().join(STAGED_KUBECONFIG_NAME)).unwrap(),
            "kubeconfig data"
        );
        for manifest in MANIFESTS {
            assert!(fx.manifest(manifest).exists(), "{manifest} not staged");
        }
    }

    #[test]
    fn teardown_removes_exactly_what_start_created() {
        let fx = Fixture::new();
        std::fs::write(fx.manifest("unrelated.yaml"), "someone else's pod").unwrap();
        let mut cp = fx.control_plane();

        cp.start().unwrap();
        let owned: BTreeSet<PathBuf> = cp.owned_manifests().iter().cloned().collect();
        let expected: BTreeSet<PathBuf> = MANIFESTS.iter().map(|m| fx.manifest(m)).collect();
        assert_eq!(owned, expected);

        cp.teardown().unwrap();

        assert!(!fx.secrets_dir().exists());
        for path in &owned {
            assert!(!path.exists(), "{} survived teardown", path.display());
        }
        assert!(fx.manifest("unrelated.yaml").exists());
        assert!(cp.owned_manifests().is_empty());
    }

    #[test]
    fn staged_files_and_directories_are_owner_only() {
        let fx = Fixture::new();
        let mut cp = fx.control_plane();
        cp.start().unwrap();

        let dir_mode = std::fs::metadata(fx.secrets_dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
        let file_mode = std::fs::metadata(fx.manifest("pod-1.yaml"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, FILE_MODE);
    }

    #[test]
    fn nested_manifest_directories_keep_their_structure() {
        let fx = Fixture::new();
        let nested = fx
            .assets
            .path()
            .join(ASSET_PATH_BOOTSTRAP_MANIFESTS)
            .join("etcd");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("etcd-member.yaml"), "etcd").unwrap();

        let mut cp = fx.control_plane();
        cp.start().unwrap();

        let staged = fx.manifest("etcd").join("etcd-member.yaml");
        assert!(staged.exists());
        assert!(cp.owned_manifests().contains(&staged));
    }

    #[test]
    fn start_replaces_secrets_left_by_a_crashed_run() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.secrets_dir()).unwrap();
        std::fs::write(fx.secrets_dir().join("stale.pem"), "old").unwrap();

        let mut cp = fx.control_plane();
        cp.start().unwrap();

        assert!(!fx.secrets_dir().join("stale.pem").exists());
    }

    // ==========================================================================
    // Story: a manifest is already in the static pod directory
    // ==========================================================================

    #[test]
    fn start_refuses_to_overwrite_existing_manifest() {
        let fx = Fixture::new();
        std::fs::write(fx.manifest("pod-2.yaml"), "existing data").unwrap();
        let mut cp = fx.control_plane();

        let err = cp.start().unwrap_err();

        assert!(matches!(err, Error::ManifestConflict { ref path } if path == &fx.manifest("pod-2.yaml")));
        for secret in SECRETS {
            assert!(fx.secrets_dir().join(secret).exists());
        }
        assert!(fx.manifest("pod-1.yaml").exists());
        assert_eq!(
            std::fs::read_to_string(fx.manifest("pod-2.yaml")).unwrap(),
            "existing data"
        );
        assert_eq!(cp.owned_manifests(), &[fx.manifest("pod-1.yaml")]);
    }

    #[test]
    fn teardown_after_conflict_keeps_the_foreign_manifest() {
        let fx = Fixture::new();
        std::fs::write(fx.manifest("pod-2.yaml"), "existing data").unwrap();
        let mut cp = fx.control_plane();
        assert!(cp.start().is_err());

        cp.teardown().unwrap();

        assert!(!fx.secrets_dir().exists());
        assert!(!fx.manifest("pod-1.yaml").exists());
        assert_eq!(
            std::fs::read_to_string(fx.manifest("pod-2.yaml")).unwrap(),
            "existing data"
        );
    }

    // ==========================================================================
    // Story: teardown is idempotent
    // ==========================================================================

    #[test]
    fn teardown_twice_is_harmless() {
        let fx = Fixture::new();
        let mut cp = fx.control_plane();
        cp.start().unwrap();

        cp.teardown().unwrap();
        cp.teardown().unwrap();
    }

    #[test]
    fn teardown_of_unstarted_control_plane_is_a_no_op() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.secrets_dir()).unwrap();
        let mut cp = fx.control_plane();

        cp.teardown().unwrap();

        assert!(fx.secrets_dir().exists());
    }

    #[test]
    fn teardown_skips_manifests_removed_by_someone_else() {
        let fx = Fixture::new();
        let mut cp = fx.control_plane();
        cp.start().unwrap();
        std::fs::remove_file(fx.manifest("pod-1.yaml")).unwrap();

        cp.teardown().unwrap();

        assert!(!fx.manifest("pod-2.yaml").exists());
    }

    #[test]
    fn missing_secrets_tree_fails_start() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.assets.path().join(ASSET_PATH_SECRETS)).unwrap();
        let mut cp = fx.control_plane();

        let err = cp.start().unwrap_err();

        assert!(matches!(err, Error::StageIo { .. }));
        assert!(cp.owned_manifests().is_empty());
    }
}
