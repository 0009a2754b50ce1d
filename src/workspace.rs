//! Staging directory tree for one run.
//!
//! ```text
//! <work_dir>/
//! ├── iso-mount/   loop mount of the input image
//! ├── iso-root/    writable copy of the image contents
//! └── chroot/      unpacked root filesystem to customize
//! ```

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use walkdir::WalkDir;

use crate::cleanup::CleanupLedger;
use crate::config::RunConfig;
use crate::error::{RemasterError, Result};
use crate::mount::Mounter;

pub const MOUNT_DIR: &str = "iso-mount";
pub const EXTRACT_DIR: &str = "iso-root";
pub const CHROOT_DIR: &str = "chroot";

/// Absolute paths of the staging tree. All live under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub mount_point: PathBuf,
    pub extraction_root: PathBuf,
    pub chroot_root: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mount_point: root.join(MOUNT_DIR),
            extraction_root: root.join(EXTRACT_DIR),
            chroot_root: root.join(CHROOT_DIR),
        }
    }

    pub fn dirs(&self) -> [&Path; 3] {
        [&self.mount_point, &self.extraction_root, &self.chroot_root]
    }
}

/// Create the staging tree and register its teardown.
///
/// Removal of an ephemeral tree is registered before anything is created so
/// a half-built tree is still removed; the unmount is registered after it so
/// it drains first. The unmount is registered unconditionally.
pub fn provision(
    config: &RunConfig,
    ledger: &mut CleanupLedger,
    mounter: Arc<dyn Mounter>,
) -> Result<Workspace> {
    let workspace = Workspace::new(&config.work_dir);

    if config.is_ephemeral() {
        let root = workspace.root.clone();
        ledger.register(format!("remove {}", root.display()), move || {
            remove_tree(&root)
        });
    }

    for dir in workspace.dirs() {
        ensure_dir(dir)?;
    }

    let mount_point = workspace.mount_point.clone();
    ledger.register(format!("unmount {}", mount_point.display()), move || {
        mounter.unmount(&mount_point).map_err(anyhow::Error::from)
    });

    Ok(workspace)
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|source| RemasterError::ProvisioningFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove the ephemeral tree, unless something is still mounted inside it.
fn remove_tree(root: &Path) -> anyhow::Result<()> {
    if !root.exists() {
        return Ok(());
    }

    let mounted = mount_boundaries(root)?;
    if !mounted.is_empty() {
        let list: Vec<String> = mounted.iter().map(|p| p.display().to_string()).collect();
        bail!(
            "refusing to remove {}: still mounted: {}",
            root.display(),
            list.join(", ")
        );
    }

    info!("Removing temporary workdir {}", root.display());
    fs::remove_dir_all(root).with_context(|| format!("removing {}", root.display()))
}

/// Directories under `root` that live on a different filesystem than `root`.
/// The walk does not descend into them or follow symlinks.
fn mount_boundaries(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let root_dev = fs::symlink_metadata(root)
        .with_context(|| format!("reading {}", root.display()))?
        .dev();

    let mut foreign = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|ent| {
        let crosses = ent.file_type().is_dir()
            && ent.metadata().map(|m| m.dev() != root_dev).unwrap_or(false);
        if crosses {
            foreign.push(ent.path().to_path_buf());
        }
        !crosses
    });
    for entry in walker {
        entry.with_context(|| format!("scanning {}", root.display()))?;
    }
    Ok(foreign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::CancelToken;
    use crate::testing::{recorded, Events, FakeMounter, Outcome};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingMounter {
        unmounted: Mutex<Vec<PathBuf>>,
    }

    impl Mounter for RecordingMounter {
        fn mount_loop(&self, _: &Path, _: &Path, _: &CancelToken) -> Result<()> {
            Ok(())
        }

        fn bind(&self, _: &Path, _: &Path, _: &CancelToken) -> Result<()> {
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.unmounted.lock().unwrap().push(target.to_path_buf());
            Ok(())
        }
    }

    fn config(work_dir: PathBuf, user_supplied: bool) -> RunConfig {
        RunConfig {
            input_image: PathBuf::from("/tmp/in.iso"),
            output_image: PathBuf::from("/tmp/out.img"),
            work_dir,
            work_dir_user_supplied: user_supplied,
        }
    }

    #[test]
    fn test_creates_all_directories() {
        let temp = TempDir::new().unwrap();
        let mut ledger = CleanupLedger::new();
        let mounter = Arc::new(RecordingMounter::default());

        let ws = provision(&config(temp.path().join("work"), true), &mut ledger, mounter).unwrap();

        assert!(ws.mount_point.is_dir());
        assert!(ws.extraction_root.is_dir());
        assert!(ws.chroot_root.is_dir());
        assert!(ws.mount_point.starts_with(&ws.root));
    }

    #[test]
    fn test_existing_directories_are_fine() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join(MOUNT_DIR)).unwrap();
        let mut ledger = CleanupLedger::new();

        provision(&config(work, true), &mut ledger, Arc::new(RecordingMounter::default()))
            .unwrap();
    }

    #[test]
    fn test_ephemeral_workdir_is_removed_after_unmount() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        let mounter = Arc::new(RecordingMounter::default());
        let mut ledger = CleanupLedger::new();

        let ws = provision(&config(work.clone(), false), &mut ledger, mounter.clone()).unwrap();
        assert_eq!(ledger.len(), 2);

        ledger.drain_all();

        assert!(!work.exists());
        assert_eq!(*mounter.unmounted.lock().unwrap(), vec![ws.mount_point]);
    }

    #[test]
    fn test_user_workdir_is_kept_but_unmounted() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        let mounter = Arc::new(RecordingMounter::default());
        let mut ledger = CleanupLedger::new();

        let ws = provision(&config(work.clone(), true), &mut ledger, mounter.clone()).unwrap();
        assert_eq!(ledger.len(), 1);

        ledger.drain_all();

        assert!(ws.extraction_root.is_dir());
        assert_eq!(*mounter.unmounted.lock().unwrap(), vec![ws.mount_point]);
    }

    #[test]
    fn test_plain_tree_has_no_mount_boundaries() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join("chroot/proc")).unwrap();
        fs::write(work.join("chroot/etc-hostname"), b"live").unwrap();

        assert!(mount_boundaries(&work).unwrap().is_empty());
    }

    #[test]
    fn test_removal_does_not_follow_symlinks_out_of_the_tree() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("host");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep"), b"x").unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join(CHROOT_DIR)).unwrap();
        std::os::unix::fs::symlink(&outside, work.join(CHROOT_DIR).join("dev")).unwrap();

        remove_tree(&work).unwrap();

        assert!(!work.exists());
        assert!(outside.join("keep").is_file());
    }

    #[test]
    fn test_failed_unmount_is_counted_by_the_ledger() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        let events: Events = Arc::default();
        let mounter = Arc::new(FakeMounter {
            events: Arc::clone(&events),
            unmount: Outcome::Fail,
            ..FakeMounter::default()
        });
        let mut ledger = CleanupLedger::new();

        provision(&config(work.clone(), false), &mut ledger, mounter).unwrap();

        // The unmount fails; removal still runs and finds no foreign mount.
        assert_eq!(ledger.drain_all(), 1);
        assert_eq!(recorded(&events), vec!["unmount iso-mount"]);
        assert!(!work.exists());
    }

    #[test]
    fn test_creation_failure_is_provisioning_error() {
        let temp = TempDir::new().unwrap();
        // A regular file where the workdir should be.
        let blocker = temp.path().join("work");
        fs::write(&blocker, b"not a dir").unwrap();
        let mut ledger = CleanupLedger::new();

        let err = provision(
            &config(blocker, true),
            &mut ledger,
            Arc::new(RecordingMounter::default()),
        )
        .unwrap_err();

        assert!(matches!(err, RemasterError::ProvisioningFailed { .. }));
    }
}
