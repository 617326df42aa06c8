//! Volume group aggregation. Strictly additive: a device is only ever
//! turned into a physical volume when it carries nothing at all.

use std::path::Path;

use diskattach_shared::errors::{DiskError, DiskResult};

use super::{Probe, VolumeManager, probe};
use crate::constants::LVM_NOT_FOUND;
use crate::mount::MountTable;
use crate::util::{CommandOutput, CommandSpec};

impl VolumeManager {
    /// Add `device` to volume group `vg`, creating the group if needed.
    ///
    /// A device that already belongs to `vg` is a no-op. Every probe runs
    /// before the first mutation; a failed `vgextend`/`vgcreate` removes the
    /// physical volume label it just wrote.
    pub fn extend_volume_group(&self, device: &Path, vg: &str) -> DiskResult<()> {
        let dev = device.display().to_string();
        let extend_failed = |reason: String| {
            DiskError::ExtendFailed(format!("Cannot add {} to {}: {}", dev, vg, reason))
        };

        let table = MountTable::load(&self.paths.mountinfo).map_err(|e| extend_failed(e.to_string()))?;
        if let Some(mount) = table.find_device_or_partition(device) {
            return Err(extend_failed(format!(
                "{} is mounted at {}",
                mount.source,
                mount.target.display()
            )));
        }

        match probe(self.runner.as_ref(), device).map_err(&extend_failed)? {
            Probe::Blank => {}
            Probe::Signature { fs_type, .. } if fs_type == "LVM2_member" => {
                return match self.pv_owner(device).map_err(&extend_failed)? {
                    Some(owner) if owner == vg => {
                        tracing::debug!(device = %dev, vg, "Already a member of the volume group");
                        Ok(())
                    }
                    Some(owner) if !owner.is_empty() => {
                        Err(extend_failed(format!("already belongs to volume group {}", owner)))
                    }
                    _ => Err(extend_failed("already an unassigned physical volume".to_string())),
                };
            }
            Probe::Signature { fs_type, .. } => {
                return Err(extend_failed(format!("carries a {} signature", fs_type)));
            }
            Probe::PartitionTable { pttype } => {
                return Err(extend_failed(format!("carries a {} partition table", pttype)));
            }
            Probe::Ambivalent => {
                return Err(extend_failed("conflicting signatures".to_string()));
            }
        }

        let vg_exists = self.volume_group_exists(vg).map_err(&extend_failed)?;

        self.lvm(CommandSpec::new("pvcreate").arg(&dev))
            .map_err(&extend_failed)?;

        let grow = if vg_exists {
            CommandSpec::new("vgextend").arg(vg).arg(&dev)
        } else {
            CommandSpec::new("vgcreate").arg(vg).arg(&dev)
        };
        if let Err(reason) = self.lvm(grow) {
            if let Err(rollback) = self.lvm(CommandSpec::new("pvremove").arg(&dev)) {
                tracing::warn!(device = %dev, error = %rollback, "Failed to remove physical volume label");
            }
            return Err(extend_failed(reason));
        }

        tracing::info!(device = %dev, vg, created = !vg_exists, "Extended volume group");
        Ok(())
    }

    /// Activate every logical volume in `vg`.
    pub fn activate_volume_group(&self, vg: &str) -> DiskResult<()> {
        self.lvm(CommandSpec::new("vgchange").arg("-ay").arg(vg))
            .map_err(|reason| {
                DiskError::ExtendFailed(format!("Cannot activate volume group {}: {}", vg, reason))
            })?;
        tracing::info!(vg, "Volume group active");
        Ok(())
    }

    fn volume_group_exists(&self, vg: &str) -> Result<bool, String> {
        let output = self.lvm_output(
            CommandSpec::new("vgs")
                .args(["--noheadings", "-o", "vg_name"])
                .arg(vg),
        )?;
        match output.code {
            Some(0) => Ok(true),
            Some(LVM_NOT_FOUND) => Ok(false),
            _ => Err(format!("vgs failed: {}", output.diagnostic())),
        }
    }

    /// Volume group a physical volume belongs to; empty when unassigned.
    fn pv_owner(&self, device: &Path) -> Result<Option<String>, String> {
        let output = self.lvm_output(
            CommandSpec::new("pvs")
                .args(["--noheadings", "-o", "vg_name"])
                .arg(device.display().to_string()),
        )?;
        match output.code {
            Some(0) => Ok(Some(output.stdout.trim().to_string())),
            Some(LVM_NOT_FOUND) => Ok(None),
            _ => Err(format!("pvs failed: {}", output.diagnostic())),
        }
    }

    fn lvm(&self, cmd: CommandSpec) -> Result<(), String> {
        let output = self.lvm_output(cmd.clone())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!("{} failed: {}", cmd.program, output.diagnostic()))
        }
    }

    fn lvm_output(&self, cmd: CommandSpec) -> Result<CommandOutput, String> {
        self.runner
            .run(&cmd)
            .map_err(|e| format!("failed to launch {}: {}", cmd.program, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimHost, SimNode};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn setup() -> (Arc<SimHost>, VolumeManager, PathBuf) {
        let host = SimHost::new();
        let device = host.paths.device_node("nbd1");
        host.set_node(&device, SimNode::Blank);
        let manager = VolumeManager::new(host.clone(), host.paths.clone(), SimHost::readiness());
        (host, manager, device)
    }

    #[test]
    fn test_creates_group_on_first_device() {
        let (host, manager, device) = setup();
        manager.extend_volume_group(&device, "data_vg").unwrap();

        assert!(host.has_vg("data_vg"));
        assert_eq!(host.calls_to("vgcreate").len(), 1);
        assert!(host.calls_to("vgextend").is_empty());
        assert_eq!(
            host.node(&device),
            Some(SimNode::Pv {
                vg: Some("data_vg".into())
            })
        );
    }

    #[test]
    fn test_extends_existing_group_and_is_idempotent() {
        let (host, manager, device) = setup();
        host.add_vg("data_vg");

        manager.extend_volume_group(&device, "data_vg").unwrap();
        assert_eq!(host.calls_to("vgextend").len(), 1);

        host.clear_calls();
        manager.extend_volume_group(&device, "data_vg").unwrap();
        assert!(host.calls_to("pvcreate").is_empty());
        assert!(host.calls_to("vgextend").is_empty());
    }

    #[test]
    fn test_refuses_devices_with_content() {
        for content in [
            SimNode::Fs {
                fs_type: "ext4".into(),
                uuid: "u".into(),
            },
            SimNode::Table { partitions: 1 },
            SimNode::Pv {
                vg: Some("other_vg".into()),
            },
            SimNode::Ambivalent,
        ] {
            let (host, manager, device) = setup();
            host.set_node(&device, content.clone());

            let err = manager.extend_volume_group(&device, "data_vg").unwrap_err();
            assert!(matches!(err, DiskError::ExtendFailed(_)), "{:?}", content);
            assert!(host.calls_to("pvcreate").is_empty());
            assert_eq!(host.node(&device), Some(content));
        }
    }

    #[test]
    fn test_failed_probe_mutates_nothing() {
        let (host, manager, device) = setup();
        host.fail("blkid");
        assert!(matches!(
            manager.extend_volume_group(&device, "data_vg"),
            Err(DiskError::ExtendFailed(_))
        ));
        assert!(host.calls_to("pvcreate").is_empty());
    }

    #[test]
    fn test_failed_extend_rolls_back_label() {
        let (host, manager, device) = setup();
        host.add_vg("data_vg");
        host.fail("vgextend");

        assert!(matches!(
            manager.extend_volume_group(&device, "data_vg"),
            Err(DiskError::ExtendFailed(_))
        ));
        assert_eq!(host.calls_to("pvremove").len(), 1);
        assert_eq!(host.node(&device), Some(SimNode::Blank));
    }

    #[test]
    fn test_activate() {
        let (host, manager, _device) = setup();
        assert!(manager.activate_volume_group("data_vg").is_err());
        host.add_vg("data_vg");
        manager.activate_volume_group("data_vg").unwrap();
    }
}
