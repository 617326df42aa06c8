//! Disk attachment manager.
//!
//! Wires a [`DiskAttachConfig`] to the three layers and the boot unit
//! installer. The CLI talks to this type only.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskattach_shared::errors::DiskResult;
use serde::Serialize;

use crate::config::DiskAttachConfig;
use crate::export::{BlockExporter, ExportServer, ExportStatus, QemuNbdServer};
use crate::image::{DiskFormat, DiskImage, create_qcow2, parse_size, secure_image};
use crate::lifecycle::{
    BootReport, BootSequence, BootUnit, InstallOutcome, Layers, UnitInstaller, run_boot_sequence,
    teardown,
};
use crate::mount::{MountManager, Mounter, NativeMounter, has_cap_sys_admin};
use crate::util::{CommandRunner, HostPaths, SystemRunner};
use crate::volume::VolumeManager;

/// Host-facing collaborators. [`HostServices::system`] is the real guest.
pub struct HostServices {
    pub runner: Arc<dyn CommandRunner>,
    pub server: Arc<dyn ExportServer>,
    pub mounter: Arc<dyn Mounter>,
    pub paths: HostPaths,
}

impl HostServices {
    pub fn system(config: &DiskAttachConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let paths = HostPaths::default();
        let server = Arc::new(QemuNbdServer::new(
            Arc::clone(&runner),
            paths.proc_root.clone(),
            config.readiness,
        ));
        Self {
            runner,
            server,
            mounter: Arc::new(NativeMounter),
            paths,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MountStatus {
    pub target: PathBuf,
    pub source: String,
    pub fs_type: String,
}

/// Snapshot for `diskattach status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub image: PathBuf,
    pub format: Option<DiskFormat>,
    pub size_bytes: Option<u64>,
    pub export: Option<ExportStatus>,
    pub mount: Option<MountStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub tool: String,
    pub path: Option<PathBuf>,
}

/// Result of `diskattach check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub tools: Vec<ToolCheck>,
    pub cap_sys_admin: bool,
}

impl CheckReport {
    pub fn missing(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|t| t.path.is_none())
            .map(|t| t.tool.as_str())
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.cap_sys_admin && self.missing().is_empty()
    }
}

pub struct DiskAttachManager {
    config: DiskAttachConfig,
    layers: Arc<Layers>,
    installer: UnitInstaller,
}

impl DiskAttachManager {
    /// Manager for the real guest.
    pub fn new(config: DiskAttachConfig) -> DiskResult<Self> {
        let services = HostServices::system(&config);
        Self::with_services(config, services)
    }

    pub fn with_services(config: DiskAttachConfig, services: HostServices) -> DiskResult<Self> {
        config.sanitize()?;
        let dir_mode = config.dir_mode_bits()?;

        let exporter = BlockExporter::new(
            Arc::clone(&services.runner),
            services.server,
            services.paths.clone(),
            config.run_dir.clone(),
            config.nbds_max,
            config.readiness,
        );
        let volumes = VolumeManager::new(
            Arc::clone(&services.runner),
            services.paths.clone(),
            config.readiness,
        );
        let mounts = MountManager::new(
            Arc::clone(&services.runner),
            services.mounter,
            services.paths,
            config.allowed_roots.clone(),
        );
        let installer = UnitInstaller::new(
            services.runner,
            config.unit_dir.clone(),
            config.unit_name.clone(),
        );

        Ok(Self {
            layers: Arc::new(Layers {
                exporter,
                volumes,
                mounts,
                dir_mode,
            }),
            installer,
            config,
        })
    }

    pub fn config(&self) -> &DiskAttachConfig {
        &self.config
    }

    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    /// Run the boot sequence to `PermissionsApplied`.
    pub async fn up(&self, sequence: &BootSequence) -> BootReport {
        run_boot_sequence(Arc::clone(&self.layers), sequence.clone()).await
    }

    /// Unmount, detach and stop the export.
    pub fn down(&self, sequence: &BootSequence) -> DiskResult<()> {
        teardown(&self.layers, sequence)
    }

    /// Install the boot unit replaying `sequence` through `program`, and
    /// optionally start it.
    pub fn install_boot_unit(
        &self,
        sequence: &BootSequence,
        program: &Path,
        config_path: Option<&Path>,
        start: bool,
    ) -> DiskResult<InstallOutcome> {
        let unit = BootUnit::for_sequence(program, sequence, config_path);
        let outcome = self.installer.install(&unit)?;
        if start {
            self.installer.start()?;
            tracing::info!(unit = %self.config.unit_name, "Boot unit started");
        }
        Ok(outcome)
    }

    /// Create `path` as a sparse qcow2 image of `size` (e.g. `126G`) unless
    /// it exists, then restrict it to the `disk` group.
    pub fn create_image(&self, path: &Path, size: &str) -> DiskResult<DiskImage> {
        let size_bytes = parse_size(size)?;
        let image = create_qcow2(path, size_bytes)?;
        secure_image(&image.path)?;
        Ok(image)
    }

    pub fn status(&self, sequence: &BootSequence) -> DiskResult<StatusReport> {
        let image = DiskImage::open(&sequence.image).ok();
        let export = match &image {
            Some(image) => self.layers.exporter.status(&image.path)?,
            None => None,
        };
        let mount = self
            .layers
            .mounts
            .table()?
            .find_target(&sequence.mount_point)
            .map(|entry| MountStatus {
                target: entry.target.clone(),
                source: entry.source.clone(),
                fs_type: entry.fs_type.clone(),
            });

        Ok(StatusReport {
            image: sequence.image.clone(),
            format: image.as_ref().map(|i| i.format),
            size_bytes: image.as_ref().map(|i| i.size),
            export,
            mount,
        })
    }

    /// Verify that every tool the sequence shells out to is on `PATH` and
    /// that mounting is permitted.
    pub fn check(&self, sequence: &BootSequence) -> CheckReport {
        CheckReport {
            tools: check_tools(sequence, None::<&OsStr>),
            cap_sys_admin: has_cap_sys_admin(),
        }
    }
}

/// Programs `sequence` needs, in the order the boot sequence uses them.
pub fn required_tools(sequence: &BootSequence) -> Vec<String> {
    let mut tools: Vec<String> = [
        "qemu-nbd",
        "nbd-client",
        "modprobe",
        "blkid",
        "sfdisk",
        "udevadm",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    tools.push(sequence.fs_type.mkfs_program());
    tools.extend(["setfacl", "systemctl"].map(String::from));
    if sequence.volume_group.is_some() {
        tools.extend(["pvs", "vgs", "pvcreate", "vgcreate", "vgextend", "vgchange"].map(String::from));
    }
    tools
}

/// Look each required tool up in `search_path`, or `PATH` when `None`.
pub fn check_tools<P: AsRef<OsStr>>(sequence: &BootSequence, search_path: Option<P>) -> Vec<ToolCheck> {
    let search_path = search_path.map(|p| p.as_ref().to_os_string());
    required_tools(sequence)
        .into_iter()
        .map(|tool| {
            let found = match &search_path {
                Some(dirs) => which::which_in(&tool, Some(dirs), "/"),
                None => which::which(&tool),
            };
            if let Err(e) = &found {
                tracing::debug!(tool = %tool, error = %e, "Tool not found");
            }
            ToolCheck {
                path: found.ok(),
                tool,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BootState;
    use crate::testing::{FakeMounter, FakeServer, SimHost, current_owner, sim_image};
    use crate::volume::FsType;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn manager(host: &Arc<SimHost>) -> (DiskAttachManager, BootSequence) {
        let owner = current_owner();
        let config = DiskAttachConfig {
            image: sim_image(host, "android.qcow2"),
            mount_point: host.root().join("mnt/data"),
            user: owner.user,
            group: owner.group,
            allowed_roots: vec![host.root().join("mnt")],
            run_dir: host.root().join("run"),
            unit_dir: host.root().join("systemd"),
            readiness: SimHost::readiness(),
            ..Default::default()
        };
        let sequence = config.boot_sequence();
        let services = HostServices {
            runner: host.clone(),
            server: FakeServer::new(),
            mounter: FakeMounter::new(host.clone()),
            paths: host.paths.clone(),
        };
        (DiskAttachManager::with_services(config, services).unwrap(), sequence)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let host = SimHost::new();
        let config = DiskAttachConfig {
            dir_mode: "rwx".into(),
            ..Default::default()
        };
        let services = HostServices {
            runner: host.clone(),
            server: FakeServer::new(),
            mounter: FakeMounter::new(host.clone()),
            paths: host.paths.clone(),
        };
        assert!(DiskAttachManager::with_services(config, services).is_err());
    }

    #[tokio::test]
    async fn test_up_status_down() {
        let host = SimHost::new();
        host.load_nbd(2);
        let (manager, sequence) = manager(&host);

        let before = manager.status(&sequence).unwrap();
        assert_eq!(before.format, Some(DiskFormat::Raw));
        assert!(before.export.is_none());
        assert!(before.mount.is_none());

        let report = manager.up(&sequence).await;
        assert_eq!(report.state, BootState::PermissionsApplied);

        let status = manager.status(&sequence).unwrap();
        let export = status.export.unwrap();
        assert!(export.serving);
        assert!(export.device_connected);
        let mount = status.mount.unwrap();
        assert_eq!(mount.fs_type, "ext4");
        assert!(serde_json::to_string(&manager.status(&sequence).unwrap()).is_ok());

        manager.down(&sequence).unwrap();
        let after = manager.status(&sequence).unwrap();
        assert!(after.export.is_none());
        assert!(after.mount.is_none());
    }

    #[test]
    fn test_install_boot_unit() {
        let host = SimHost::new();
        let (manager, sequence) = manager(&host);

        let outcome = manager
            .install_boot_unit(&sequence, Path::new("/usr/bin/diskattach"), None, true)
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert!(manager.config().unit_path().exists());
        let starts: Vec<_> = host
            .calls_to("systemctl")
            .into_iter()
            .filter(|c| c.has_arg("start"))
            .collect();
        assert_eq!(starts.len(), 1);
    }

    #[test]
    fn test_required_tools_follow_sequence() {
        let host = SimHost::new();
        let (_, mut sequence) = manager(&host);
        sequence.fs_type = FsType::Xfs;
        let tools = required_tools(&sequence);
        assert!(tools.contains(&"mkfs.xfs".to_string()));
        assert!(!tools.contains(&"vgchange".to_string()));

        sequence.volume_group = Some("data_vg".into());
        assert!(required_tools(&sequence).contains(&"vgchange".to_string()));
    }

    #[test]
    fn test_check_tools_reports_missing() {
        let host = SimHost::new();
        let (_, sequence) = manager(&host);
        let bin = TempDir::new().unwrap();
        let tool = bin.path().join("qemu-nbd");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let checks = check_tools(&sequence, Some(bin.path().as_os_str()));
        let report = CheckReport {
            tools: checks,
            cap_sys_admin: true,
        };
        assert_eq!(report.tools[0].path.as_deref(), Some(tool.as_path()));
        assert!(report.missing().contains(&"nbd-client"));
        assert!(!report.missing().contains(&"qemu-nbd"));
        assert!(!report.is_ready());
    }
}
