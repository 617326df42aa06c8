//! Native mount(2) using nix.
//!
//! Requires CAP_SYS_ADMIN capability.

use std::path::Path;

use diskattach_shared::errors::{DiskError, DiskResult};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::debug;

use super::Mounter;

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMounter;

impl Mounter for NativeMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> DiskResult<()> {
        if !has_cap_sys_admin() {
            return Err(DiskError::MountFailed(format!(
                "Mounting {} requires CAP_SYS_ADMIN",
                target.display()
            )));
        }

        mount(
            Some(source),
            target,
            Some(fs_type),
            MsFlags::MS_NOATIME,
            None::<&str>,
        )
        .map_err(|e| {
            DiskError::MountFailed(format!(
                "Failed to mount {} ({}) at {}: {}",
                source.display(),
                fs_type,
                target.display(),
                e
            ))
        })?;

        debug!(
            source = %source.display(),
            target = %target.display(),
            fs_type,
            "Mounted"
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> DiskResult<()> {
        // No MNT_DETACH: a busy mount must surface, not linger lazily
        umount2(target, MntFlags::empty()).map_err(|e| {
            DiskError::MountFailed(format!("Failed to unmount {}: {}", target.display(), e))
        })?;
        debug!(target = %target.display(), "Unmounted");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn has_cap_sys_admin() -> bool {
    caps::has_cap(
        None,
        caps::CapSet::Effective,
        caps::Capability::CAP_SYS_ADMIN,
    )
    .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn has_cap_sys_admin() -> bool {
    false
}
