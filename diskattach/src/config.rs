//! Configuration for the disk attachment manager.
//!
//! Loaded from a JSON file when `--config` is given, otherwise built from
//! defaults. CLI flags override individual fields before [`sanitize`] runs.
//!
//! [`sanitize`]: DiskAttachConfig::sanitize

use std::path::{Path, PathBuf};

use diskattach_shared::errors::{DiskError, DiskResult};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::lifecycle::BootSequence;
use crate::mount::Owner;
use crate::util::Readiness;
use crate::volume::FsType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiskAttachConfig {
    /// Backing disk image.
    pub image: PathBuf,
    /// Where the data volume is mounted.
    pub mount_point: PathBuf,
    pub fs_type: FsType,
    /// Account granted ownership and rwX access on the mount.
    pub user: String,
    pub group: String,
    /// Octal mode applied to the mount root, e.g. `"2775"`.
    pub dir_mode: String,
    /// Volume group to activate at boot. LVM is not used when unset.
    pub volume_group: Option<String>,
    /// Mount targets must lie below one of these.
    pub allowed_roots: Vec<PathBuf>,
    /// `nbds_max` passed when loading the nbd module.
    pub nbds_max: u32,
    /// Session records, sockets and pid files.
    pub run_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub unit_name: String,
    /// Size used by `create-image`, e.g. `"126G"`.
    pub image_size: String,
    pub readiness: Readiness,
    /// Mirror logs into a daily-rotated file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for DiskAttachConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::from("/android.qcow2"),
            mount_point: PathBuf::from("/mnt/data"),
            fs_type: FsType::Ext4,
            user: "droid".to_string(),
            group: "users".to_string(),
            dir_mode: "2775".to_string(),
            volume_group: None,
            allowed_roots: ["/mnt", "/media", "/srv", "/data"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            nbds_max: constants::nbd::DEFAULT_NBDS_MAX,
            run_dir: PathBuf::from(constants::export::DEFAULT_RUN_DIR),
            unit_dir: PathBuf::from(constants::systemd::DEFAULT_UNIT_DIR),
            unit_name: constants::systemd::DEFAULT_UNIT_NAME.to_string(),
            image_size: format!("{}G", constants::qcow2::DEFAULT_DISK_SIZE_GB),
            readiness: Readiness::default(),
            log_dir: None,
        }
    }
}

impl DiskAttachConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> DiskResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiskError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DiskError::Config(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    pub fn sanitize(&self) -> DiskResult<()> {
        for (name, path) in [
            ("image", &self.image),
            ("mount_point", &self.mount_point),
            ("run_dir", &self.run_dir),
            ("unit_dir", &self.unit_dir),
        ] {
            if !path.is_absolute() {
                return Err(DiskError::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    path.display()
                )));
            }
        }

        if self.user.is_empty() || self.group.is_empty() {
            return Err(DiskError::Config("user and group must be set".to_string()));
        }

        if self.nbds_max == 0 {
            return Err(DiskError::Config("nbds_max must be at least 1".to_string()));
        }

        if !self.unit_name.ends_with(".service") || self.unit_name.contains('/') {
            return Err(DiskError::Config(format!(
                "unit_name must be a plain *.service name, got '{}'",
                self.unit_name
            )));
        }

        if let Some(vg) = &self.volume_group
            && !is_valid_lvm_name(vg)
        {
            return Err(DiskError::Config(format!("Invalid volume group name '{}'", vg)));
        }

        self.dir_mode_bits()?;
        Ok(())
    }

    /// `dir_mode` as permission bits.
    pub fn dir_mode_bits(&self) -> DiskResult<u32> {
        u32::from_str_radix(&self.dir_mode, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| {
                DiskError::Config(format!("dir_mode '{}' is not an octal mode", self.dir_mode))
            })
    }

    pub fn owner(&self) -> Owner {
        Owner::new(&self.user, &self.group)
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit_name)
    }

    /// The boot sequence this configuration describes.
    pub fn boot_sequence(&self) -> BootSequence {
        BootSequence {
            image: self.image.clone(),
            mount_point: self.mount_point.clone(),
            fs_type: self.fs_type,
            owner: self.owner(),
            volume_group: self.volume_group.clone(),
        }
    }
}

/// LVM accepts `[A-Za-z0-9+_.-]`, not starting with `-`.
fn is_valid_lvm_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiskAttachConfig::default();
        config.sanitize().unwrap();
        assert_eq!(config.dir_mode_bits().unwrap(), 0o2775);
        assert_eq!(
            config.unit_path(),
            PathBuf::from("/etc/systemd/system/diskattach-data.service")
        );
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("diskattach.json");
        std::fs::write(
            &path,
            r#"{ "mount_point": "/srv/storage", "fs_type": "xfs", "volume_group": "data_vg" }"#,
        )
        .unwrap();

        let config = DiskAttachConfig::load(&path).unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/srv/storage"));
        assert_eq!(config.fs_type, FsType::Xfs);
        assert_eq!(config.volume_group.as_deref(), Some("data_vg"));
        assert_eq!(config.user, "droid");
        assert_eq!(config.image, PathBuf::from("/android.qcow2"));
        config.sanitize().unwrap();
    }

    #[test]
    fn test_load_rejects_unknown_fs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "fs_type": "ntfs" }"#).unwrap();
        assert!(matches!(
            DiskAttachConfig::load(&path),
            Err(DiskError::Config(_))
        ));
    }

    #[test]
    fn test_sanitize_rejections() {
        let relative = DiskAttachConfig {
            mount_point: PathBuf::from("mnt/data"),
            ..Default::default()
        };
        assert!(relative.sanitize().is_err());

        let bad_mode = DiskAttachConfig {
            dir_mode: "rwx".to_string(),
            ..Default::default()
        };
        assert!(bad_mode.sanitize().is_err());

        let bad_vg = DiskAttachConfig {
            volume_group: Some("-vg".to_string()),
            ..Default::default()
        };
        assert!(bad_vg.sanitize().is_err());

        let bad_unit = DiskAttachConfig {
            unit_name: "../evil.service".to_string(),
            ..Default::default()
        };
        assert!(bad_unit.sanitize().is_err());
    }
}
