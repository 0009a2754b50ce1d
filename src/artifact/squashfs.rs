//! Root filesystem patching through squashfs.
//!
//! Live ISOs carry their root filesystem as a squashfs image. Patching
//! unpacks it into the chroot directory, optionally runs a customization
//! script inside that chroot, and packs it back over the original image.
//!
//! # Flow
//!
//! ```text
//! iso-root/casper/filesystem.squashfs ──unsquashfs──▶ chroot/
//!                                                      │ chroot /bin/sh patch.sh
//! iso-root/casper/filesystem.squashfs ◀──mksquashfs─── chroot/
//! ```
//!
//! The repack goes through a `.work` file that is renamed into place only
//! after mksquashfs succeeds, so an interrupted run never leaves a truncated
//! image in the staged tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::artifact::Patcher;
use crate::cleanup::CleanupLedger;
use crate::error::{RemasterError, Result};
use crate::mount::Mounter;
use crate::process::Cmd;
use crate::signal::CancelToken;

/// Well-known root filesystem locations, checked before a full scan.
const KNOWN_ROOTFS: &[&str] = &[
    "casper/filesystem.squashfs",
    "live/filesystem.squashfs",
    "install/filesystem.squashfs",
    "arch/x86_64/airootfs.sfs",
];

/// Host directories bind-mounted into the chroot while the script runs.
const CHROOT_BINDS: &[(&str, &str)] = &[("/proc", "proc"), ("/sys", "sys"), ("/dev", "dev")];

/// Where the patch script lands inside the chroot.
const SCRIPT_IN_CHROOT: &str = "tmp/iso-remaster-patch.sh";

/// Options for rebuilding a squashfs image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    ///
    /// Default: "xz" (what most live media ship with)
    pub compression: String,

    /// Block size (e.g., "128K", "256K", "512K", "1M").
    ///
    /// Default: "1M"
    pub block_size: String,

    /// Whether to include extended attributes.
    ///
    /// Default: true (live roots carry file capabilities)
    pub xattrs: bool,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            compression: "xz".to_string(),
            block_size: "1M".to_string(),
            xattrs: true,
        }
    }
}

/// Unpack, customize and repack the live root filesystem.
pub struct SquashfsPatcher {
    options: SquashfsOptions,
    patch_script: Option<PathBuf>,
    mounter: Arc<dyn Mounter>,
}

impl SquashfsPatcher {
    pub fn new(
        options: SquashfsOptions,
        patch_script: Option<PathBuf>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            options,
            patch_script,
            mounter,
        }
    }
}

impl Patcher for SquashfsPatcher {
    fn patch(&self, extraction_root: &Path, chroot_root: &Path, cancel: &CancelToken) -> Result<()> {
        let Some(image) = find_root_squashfs(extraction_root) else {
            warn!(
                "No squashfs root filesystem under {}; leaving tree unpatched",
                extraction_root.display()
            );
            return Ok(());
        };
        info!("Root filesystem image: {}", image.display());

        unsquash(&image, chroot_root, cancel)?;

        if let Some(script) = &self.patch_script {
            run_in_chroot(chroot_root, script, &self.mounter, cancel)?;
        }

        resquash(chroot_root, &image, &self.options, cancel)?;
        update_size_file(&image, chroot_root)?;
        Ok(())
    }
}

/// Locate the root filesystem squashfs in a staged image tree.
///
/// Falls back to the largest `*.squashfs` / `*.sfs` file when none of the
/// well-known locations exist.
pub fn find_root_squashfs(root: &Path) -> Option<PathBuf> {
    for rel in KNOWN_ROOTFS {
        let candidate = root.join(rel);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    WalkDir::new(root)
        .into_iter()
        .filter_map(|ent| ent.ok())
        .filter(|ent| ent.file_type().is_file())
        .filter(|ent| {
            matches!(
                ent.path().extension().and_then(|s| s.to_str()),
                Some("squashfs") | Some("sfs")
            )
        })
        .max_by_key(|ent| ent.metadata().map(|m| m.len()).unwrap_or(0))
        .map(|ent| ent.into_path())
}

fn unsquash(image: &Path, chroot_root: &Path, cancel: &CancelToken) -> Result<()> {
    info!("Unpacking root filesystem into {}", chroot_root.display());
    // -f: the chroot directory already exists.
    Cmd::new("unsquashfs")
        .args(["-f", "-d"])
        .arg_path(chroot_root)
        .arg_path(image)
        .error_msg(format!("unpacking {}", image.display()))
        .cancel_on(cancel)
        .run()?;
    Ok(())
}

/// Run the patch script under `chroot` with the host's /proc, /sys and /dev
/// bound in.
fn run_in_chroot(
    chroot_root: &Path,
    script: &Path,
    mounter: &Arc<dyn Mounter>,
    cancel: &CancelToken,
) -> Result<()> {
    info!(
        "Running patch script {} inside {}",
        script.display(),
        chroot_root.display()
    );

    with_chroot_session(chroot_root, script, mounter, cancel, || {
        Cmd::new("chroot")
            .arg_path(chroot_root)
            .arg("/bin/sh")
            .arg(format!("/{SCRIPT_IN_CHROOT}"))
            .error_msg(format!("running patch script {}", script.display()))
            .cancel_on(cancel)
            .run()?;
        Ok(())
    })
}

/// Copy the script in, bind the host directories, run `body`, then release
/// everything through a ledger scoped to this session.
///
/// A bind that cannot be released is an error even when `body` succeeded:
/// the tree still holds host filesystems and must not be repacked or removed.
fn with_chroot_session<F>(
    chroot_root: &Path,
    script: &Path,
    mounter: &Arc<dyn Mounter>,
    cancel: &CancelToken,
    body: F,
) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let mut session = CleanupLedger::new();
    let result =
        prepare_session(&mut session, chroot_root, script, mounter, cancel).and_then(|()| body());

    let failures = session.drain_all();
    result?;
    if failures > 0 {
        return Err(RemasterError::TeardownFailed {
            context: format!("releasing chroot session under {}", chroot_root.display()),
            failures,
        });
    }
    Ok(())
}

fn prepare_session(
    session: &mut CleanupLedger,
    chroot_root: &Path,
    script: &Path,
    mounter: &Arc<dyn Mounter>,
    cancel: &CancelToken,
) -> Result<()> {
    let script_target = chroot_root.join(SCRIPT_IN_CHROOT);
    if let Some(parent) = script_target.parent() {
        fs::create_dir_all(parent).map_err(|source| RemasterError::Filesystem {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }
    fs::copy(script, &script_target).map_err(|source| RemasterError::Filesystem {
        context: format!("copying patch script {}", script.display()),
        source,
    })?;
    session.register(format!("remove {}", script_target.display()), move || {
        fs::remove_file(&script_target)?;
        Ok(())
    });

    for (host, rel) in CHROOT_BINDS {
        let target = chroot_root.join(rel);
        fs::create_dir_all(&target).map_err(|source| RemasterError::Filesystem {
            context: format!("creating {}", target.display()),
            source,
        })?;
        mounter.bind(Path::new(host), &target, cancel)?;
        let mounter = Arc::clone(mounter);
        session.register(format!("unmount {}", target.display()), move || {
            mounter.unmount(&target)?;
            Ok(())
        });
    }
    Ok(())
}

fn resquash(
    chroot_root: &Path,
    image: &Path,
    options: &SquashfsOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let work = work_path(image);
    let _ = fs::remove_file(&work);

    info!(
        "Repacking root filesystem with {} compression ({} blocks)...",
        options.compression, options.block_size
    );

    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(chroot_root)
        .arg_path(&work)
        .arg("-noappend")
        .args(["-comp", options.compression.as_str()])
        .args(["-b", options.block_size.as_str()]);
    if !options.xattrs {
        cmd = cmd.arg("-no-xattrs");
    }

    if let Err(e) = cmd
        .error_msg(format!("repacking {}", image.display()))
        .cancel_on(cancel)
        .run()
    {
        let _ = fs::remove_file(&work);
        return Err(e);
    }

    fs::rename(&work, image).map_err(|source| RemasterError::Filesystem {
        context: format!("replacing {} with {}", image.display(), work.display()),
        source,
    })
}

fn work_path(image: &Path) -> PathBuf {
    let mut name = image
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".work");
    image.with_file_name(name)
}

/// Casper-based media keep the unpacked size next to the squashfs; the live
/// boot checks it, so it must follow the patched tree.
fn update_size_file(image: &Path, chroot_root: &Path) -> Result<()> {
    let size_file = image.with_file_name("filesystem.size");
    if !size_file.is_file() {
        return Ok(());
    }

    let total: u64 = WalkDir::new(chroot_root)
        .into_iter()
        .filter_map(|ent| ent.ok())
        .filter(|ent| ent.file_type().is_file())
        .filter_map(|ent| ent.metadata().ok())
        .map(|m| m.len())
        .sum();

    fs::write(&size_file, format!("{total}\n")).map_err(|source| RemasterError::Filesystem {
        context: format!("updating {}", size_file.display()),
        source,
    })
}
