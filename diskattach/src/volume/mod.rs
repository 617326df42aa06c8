//! Volume layer: partition table and filesystem, probe before mutate.
//!
//! Nothing here ever overwrites a signature it finds. Layouts other than
//! "blank" or "one partition" stop with [`DiskError::AmbiguousDeviceState`],
//! and a partition that already carries a different filesystem stops with
//! [`DiskError::FilesystemTypeConflict`].

mod lvm;
mod probe;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};
use serde::{Deserialize, Serialize};

pub use probe::{Probe, probe, read_partitions, resolve_uuid};

use crate::mount::MountTable;
use crate::util::{CommandRunner, CommandSpec, HostPaths, Readiness};

/// GPT label with one Linux partition spanning the device.
const SINGLE_PARTITION_LAYOUT: &str = "label: gpt\n,,L\n";

/// Supported filesystem types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext4,
    Xfs,
    Btrfs,
}

impl FsType {
    /// Name as reported by blkid and accepted by mount(2).
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Btrfs => "btrfs",
        }
    }

    pub fn mkfs_program(&self) -> String {
        format!("mkfs.{}", self.as_str())
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            "btrfs" => Ok(FsType::Btrfs),
            other => Err(DiskError::Config(format!(
                "Unsupported filesystem type '{}' (expected ext4, xfs or btrfs)",
                other
            ))),
        }
    }
}

/// Filesystem UUID; the stable identity used to find the volume again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeUuid(String);

impl VolumeUuid {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A formatted partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub partition: PathBuf,
    pub fs_type: FsType,
    pub uuid: VolumeUuid,
}

/// Node of partition `index` on `device` (`nbd0` -> `nbd0p1`, `vdb` -> `vdb1`).
pub fn partition_node(device: &Path, index: u32) -> PathBuf {
    let name = device.display().to_string();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", name, index))
    } else {
        PathBuf::from(format!("{}{}", name, index))
    }
}

pub struct VolumeManager {
    runner: Arc<dyn CommandRunner>,
    paths: HostPaths,
    readiness: Readiness,
}

impl VolumeManager {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: HostPaths, readiness: Readiness) -> Self {
        Self {
            runner,
            paths,
            readiness,
        }
    }

    /// Return the single data partition on `device`, creating it on a
    /// blank device.
    pub fn ensure_partitioned(&self, device: &Path) -> DiskResult<PathBuf> {
        let ambiguous = |reason: String| DiskError::AmbiguousDeviceState {
            device: device.display().to_string(),
            reason,
        };

        match probe(self.runner.as_ref(), device).map_err(&ambiguous)? {
            Probe::Blank => self.create_partition(device),
            Probe::PartitionTable { pttype } => {
                let (_, partitions) = read_partitions(self.runner.as_ref(), device)?;
                match partitions.as_slice() {
                    [only] => {
                        tracing::debug!(
                            device = %device.display(),
                            partition = %only.display(),
                            pttype = %pttype,
                            "Partition table already present"
                        );
                        self.wait_for_node(only)?;
                        Ok(only.clone())
                    }
                    [] => Err(ambiguous(format!("{} table with no partitions", pttype))),
                    many => Err(ambiguous(format!(
                        "{} table with {} partitions, expected one",
                        pttype,
                        many.len()
                    ))),
                }
            }
            Probe::Signature { fs_type, .. } => Err(ambiguous(format!(
                "{} signature directly on the device, expected a partition table",
                fs_type
            ))),
            Probe::Ambivalent => Err(ambiguous("conflicting signatures".to_string())),
        }
    }

    fn create_partition(&self, device: &Path) -> DiskResult<PathBuf> {
        let table = MountTable::load(&self.paths.mountinfo)?;
        if let Some(mount) = table.find_device_or_partition(device) {
            return Err(DiskError::PartitionFailed(format!(
                "{} is busy: {} is mounted at {}",
                device.display(),
                mount.source,
                mount.target.display()
            )));
        }

        tracing::info!(device = %device.display(), "Creating GPT partition table");
        let cmd = CommandSpec::new("sfdisk")
            .arg("--quiet")
            .arg(device.display().to_string())
            .stdin(SINGLE_PARTITION_LAYOUT);
        let output = self.runner.run(&cmd).map_err(|e| {
            DiskError::PartitionFailed(format!("Failed to launch sfdisk: {}", e))
        })?;
        if !output.success() {
            return Err(DiskError::PartitionFailed(format!(
                "sfdisk failed on {}: {}",
                device.display(),
                output.diagnostic()
            )));
        }

        self.settle();
        let partition = partition_node(device, 1);
        self.wait_for_node(&partition)?;
        tracing::info!(partition = %partition.display(), "Partition created");
        Ok(partition)
    }

    /// Return the UUID of the `fs_type` filesystem on `partition`,
    /// formatting it only if it carries no signature at all.
    pub fn ensure_filesystem(&self, partition: &Path, fs_type: FsType) -> DiskResult<VolumeUuid> {
        let ambiguous = |reason: String| DiskError::AmbiguousDeviceState {
            device: partition.display().to_string(),
            reason,
        };

        match probe(self.runner.as_ref(), partition).map_err(&ambiguous)? {
            Probe::Blank => {
                self.format(partition, fs_type)?;
                match probe(self.runner.as_ref(), partition).map_err(&ambiguous)? {
                    Probe::Signature {
                        fs_type: found,
                        uuid: Some(uuid),
                    } if found == fs_type.as_str() => Ok(VolumeUuid::new(uuid)),
                    other => Err(DiskError::Storage(format!(
                        "{} reports {:?} right after formatting as {}",
                        partition.display(),
                        other,
                        fs_type
                    ))),
                }
            }
            Probe::Signature { fs_type: found, uuid } if found == fs_type.as_str() => {
                let uuid = uuid.ok_or_else(|| ambiguous(format!("{} filesystem without a UUID", found)))?;
                tracing::debug!(partition = %partition.display(), uuid = %uuid, "Filesystem already present");
                Ok(VolumeUuid::new(uuid))
            }
            Probe::Signature { fs_type: found, .. } => Err(DiskError::FilesystemTypeConflict {
                partition: partition.display().to_string(),
                found,
                requested: fs_type.to_string(),
            }),
            Probe::PartitionTable { pttype } => {
                Err(ambiguous(format!("nested {} partition table", pttype)))
            }
            Probe::Ambivalent => Err(ambiguous("conflicting signatures".to_string())),
        }
    }

    /// [`ensure_partitioned`] then [`ensure_filesystem`].
    ///
    /// [`ensure_partitioned`]: Self::ensure_partitioned
    /// [`ensure_filesystem`]: Self::ensure_filesystem
    pub fn ensure_volume(&self, device: &Path, fs_type: FsType) -> DiskResult<Volume> {
        let partition = self.ensure_partitioned(device)?;
        let uuid = self.ensure_filesystem(&partition, fs_type)?;
        Ok(Volume {
            partition,
            fs_type,
            uuid,
        })
    }

    fn format(&self, partition: &Path, fs_type: FsType) -> DiskResult<()> {
        let program = fs_type.mkfs_program();
        tracing::info!(partition = %partition.display(), fs_type = %fs_type, "Creating filesystem");
        let cmd = CommandSpec::new(program.clone())
            .arg("-q")
            .arg(partition.display().to_string());
        let output = self
            .runner
            .run(&cmd)
            .map_err(|e| DiskError::Storage(format!("Failed to launch {}: {}", program, e)))?;
        if !output.success() {
            return Err(DiskError::Storage(format!(
                "{} failed on {}: {}",
                program,
                partition.display(),
                output.diagnostic()
            )));
        }
        Ok(())
    }

    /// Let udev finish creating nodes for a new table. Best effort.
    fn settle(&self) {
        match self.runner.run(&CommandSpec::new("udevadm").arg("settle")) {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::debug!(error = %output.diagnostic(), "udevadm settle failed"),
            Err(e) => tracing::debug!(error = %e, "udevadm unavailable"),
        }
    }

    fn wait_for_node(&self, node: &Path) -> DiskResult<()> {
        if self.readiness.wait_until(|| node.exists()) {
            Ok(())
        } else {
            Err(DiskError::PartitionFailed(format!(
                "Partition node {} did not appear",
                node.display()
            )))
        }
    }
}
