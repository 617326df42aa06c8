//! Mounting the data volume and opening it up to its owner.
//!
//! The volume is found by filesystem UUID on every run, never by device
//! name, since the NBD slot it lands on can differ between boots.

mod mountinfo;
mod native;
mod permissions;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};
use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};

pub use mountinfo::{MountEntry, MountTable};
pub use native::NativeMounter;
pub(crate) use native::has_cap_sys_admin;
pub use permissions::{acl_spec, apply_acls, chown_recursive, root_matches, set_mode};

use crate::util::{CommandRunner, HostPaths, is_within_roots};
use crate::volume::{Probe, VolumeUuid, probe, resolve_uuid};

/// Performs the actual mount(2)/umount(2) calls.
pub trait Mounter: Send + Sync {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> DiskResult<()>;
    fn unmount(&self, target: &Path) -> DiskResult<()>;
}

/// Account that owns the mounted storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user: String,
    pub group: String,
}

impl Owner {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
        }
    }

    /// Look up numeric ids. Unknown names are a permission failure.
    pub fn resolve(&self) -> DiskResult<(Uid, Gid)> {
        let user = User::from_name(&self.user)
            .map_err(|e| {
                DiskError::PermissionApplyFailed(format!("User lookup for '{}' failed: {}", self.user, e))
            })?
            .ok_or_else(|| {
                DiskError::PermissionApplyFailed(format!("User '{}' does not exist", self.user))
            })?;
        let group = Group::from_name(&self.group)
            .map_err(|e| {
                DiskError::PermissionApplyFailed(format!("Group lookup for '{}' failed: {}", self.group, e))
            })?
            .ok_or_else(|| {
                DiskError::PermissionApplyFailed(format!("Group '{}' does not exist", self.group))
            })?;
        Ok((user.uid, group.gid))
    }
}

/// Where and for whom the volume is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTarget {
    pub path: PathBuf,
    pub owner: Owner,
    /// Mode of the mount root, e.g. `0o2775`.
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    AlreadyMounted,
}

pub struct MountManager {
    runner: Arc<dyn CommandRunner>,
    mounter: Arc<dyn Mounter>,
    paths: HostPaths,
    allowed_roots: Vec<PathBuf>,
}

impl MountManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        mounter: Arc<dyn Mounter>,
        paths: HostPaths,
        allowed_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            runner,
            mounter,
            paths,
            allowed_roots,
        }
    }

    pub fn table(&self) -> DiskResult<MountTable> {
        MountTable::load(&self.paths.mountinfo)
    }

    /// Mount the volume at `target` and apply ownership and ACLs.
    ///
    /// Returns at once when `target` is already an active mount of the
    /// volume.
    pub fn ensure_mounted(&self, uuid: &VolumeUuid, target: &MountTarget) -> DiskResult<MountOutcome> {
        let outcome = self.mount_volume(uuid, target)?;
        if outcome == MountOutcome::Mounted {
            self.apply_permissions(target)?;
        }
        Ok(outcome)
    }

    /// The mount half of [`ensure_mounted`](Self::ensure_mounted).
    pub fn mount_volume(&self, uuid: &VolumeUuid, target: &MountTarget) -> DiskResult<MountOutcome> {
        self.check_target(&target.path)?;
        // Fail on an unknown owner before anything is mounted
        target.owner.resolve()?;

        let device = resolve_uuid(self.runner.as_ref(), uuid.as_str())
            .map_err(DiskError::MountFailed)?
            .ok_or_else(|| DiskError::MountFailed(format!("No volume with UUID {}", uuid)))?;

        if let Some(current) = self.table()?.find_target(&target.path) {
            if same_device(Path::new(&current.source), &device) {
                tracing::debug!(
                    target = %target.path.display(),
                    device = %device.display(),
                    "Volume already mounted"
                );
                return Ok(MountOutcome::AlreadyMounted);
            }
            return Err(DiskError::MountFailed(format!(
                "{} is already occupied by {}",
                target.path.display(),
                current.source
            )));
        }

        let fs_type = match probe(self.runner.as_ref(), &device).map_err(DiskError::MountFailed)? {
            Probe::Signature { fs_type, .. } => fs_type,
            other => {
                return Err(DiskError::MountFailed(format!(
                    "{} has no mountable filesystem ({:?})",
                    device.display(),
                    other
                )));
            }
        };

        std::fs::create_dir_all(&target.path).map_err(|e| {
            DiskError::MountFailed(format!(
                "Failed to create mount point {}: {}",
                target.path.display(),
                e
            ))
        })?;
        // A link swapped in while the directory was created
        self.check_target(&target.path)?;

        self.mounter.mount(&device, &target.path, &fs_type)?;
        tracing::info!(
            device = %device.display(),
            target = %target.path.display(),
            uuid = %uuid,
            fs_type = %fs_type,
            "Volume mounted"
        );
        Ok(MountOutcome::Mounted)
    }

    /// Recursive ownership, root mode, then access and default ACLs.
    pub fn apply_permissions(&self, target: &MountTarget) -> DiskResult<()> {
        self.check_target(&target.path)?;
        let (uid, gid) = target.owner.resolve()?;

        let changed = chown_recursive(&target.path, uid, gid)?;
        set_mode(&target.path, target.mode)?;
        apply_acls(self.runner.as_ref(), &target.path, &target.owner)?;

        tracing::info!(
            target = %target.path.display(),
            user = %target.owner.user,
            group = %target.owner.group,
            chowned = changed,
            "Permissions applied"
        );
        Ok(())
    }

    /// Whether the mount root already carries the target's owner and mode.
    pub fn permissions_current(&self, target: &MountTarget) -> DiskResult<bool> {
        let (uid, gid) = target.owner.resolve()?;
        root_matches(&target.path, uid, gid, target.mode)
    }

    /// Unmount `target` if something is mounted there.
    pub fn ensure_unmounted(&self, target: &Path) -> DiskResult<bool> {
        if self.table()?.find_target(target).is_none() {
            return Ok(false);
        }
        self.mounter.unmount(target)?;
        tracing::info!(target = %target.display(), "Volume unmounted");
        Ok(true)
    }

    fn check_target(&self, path: &Path) -> DiskResult<()> {
        if is_within_roots(path, &self.allowed_roots) {
            Ok(())
        } else {
            Err(DiskError::PermissionApplyFailed(format!(
                "Mount point {} is outside the allowed roots ({})",
                path.display(),
                self.allowed_roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }
}

fn same_device(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
