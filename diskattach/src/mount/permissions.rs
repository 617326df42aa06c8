//! Ownership, mode and ACLs on a mounted volume.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use diskattach_shared::errors::{DiskError, DiskResult};
use nix::unistd::{Gid, Uid};
use walkdir::WalkDir;

use super::Owner;
use crate::util::{CommandRunner, CommandSpec};

/// Hand every entry under `root` to `uid:gid`.
///
/// Symlinks are re-owned themselves, never followed, and the walk does not
/// leave the mounted filesystem.
pub fn chown_recursive(root: &Path, uid: Uid, gid: Gid) -> DiskResult<u64> {
    let mut changed = 0;
    for entry in WalkDir::new(root).follow_links(false).same_file_system(true) {
        let entry = entry.map_err(|e| {
            DiskError::PermissionApplyFailed(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        let metadata = entry.path().symlink_metadata().map_err(|e| {
            DiskError::PermissionApplyFailed(format!("Failed to stat {}: {}", entry.path().display(), e))
        })?;
        if metadata.uid() == uid.as_raw() && metadata.gid() == gid.as_raw() {
            continue;
        }
        std::os::unix::fs::lchown(entry.path(), Some(uid.as_raw()), Some(gid.as_raw())).map_err(
            |e| {
                DiskError::PermissionApplyFailed(format!(
                    "Failed to chown {}: {}",
                    entry.path().display(),
                    e
                ))
            },
        )?;
        changed += 1;
    }
    Ok(changed)
}

pub fn set_mode(path: &Path, mode: u32) -> DiskResult<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        DiskError::PermissionApplyFailed(format!(
            "Failed to set mode {:o} on {}: {}",
            mode,
            path.display(),
            e
        ))
    })
}

/// Whether `path` already has the owner and mode.
pub fn root_matches(path: &Path, uid: Uid, gid: Gid, mode: u32) -> DiskResult<bool> {
    let metadata = std::fs::metadata(path)?;
    Ok(metadata.uid() == uid.as_raw()
        && metadata.gid() == gid.as_raw()
        && metadata.mode() & 0o7777 == mode)
}

/// `u:USER:rwX,g:GROUP:rwX`, with the mask entry for default ACLs.
pub fn acl_spec(owner: &Owner, default: bool) -> String {
    let mut spec = format!("u:{}:rwX,g:{}:rwX", owner.user, owner.group);
    if default {
        spec.push_str(",m::rwx");
    }
    spec
}

/// Grant `owner` rwX on everything under `root` now, and on everything
/// created there later through default ACLs.
pub fn apply_acls(runner: &dyn CommandRunner, root: &Path, owner: &Owner) -> DiskResult<()> {
    let root_arg = root.display().to_string();
    let commands = [
        CommandSpec::new("setfacl")
            .args(["-R", "-m"])
            .arg(acl_spec(owner, false))
            .arg(root_arg.clone()),
        CommandSpec::new("setfacl")
            .args(["-R", "-d", "-m"])
            .arg(acl_spec(owner, true))
            .arg(root_arg),
    ];

    for cmd in &commands {
        let output = runner.run(cmd).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DiskError::PermissionApplyFailed(
                    "setfacl is not installed (package 'acl')".to_string(),
                )
            } else {
                DiskError::PermissionApplyFailed(format!("Failed to launch setfacl: {}", e))
            }
        })?;
        if !output.success() {
            return Err(DiskError::PermissionApplyFailed(format!(
                "{} failed: {}",
                cmd,
                output.diagnostic()
            )));
        }
    }
    Ok(())
}
