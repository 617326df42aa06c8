//! Low-level signature probing with `blkid -p` and `sfdisk --json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use diskattach_shared::errors::{DiskError, DiskResult};
use serde::Deserialize;

use crate::constants::blkid::{AMBIVALENT, NOTHING_FOUND};
use crate::util::{CommandRunner, CommandSpec};

/// What a device or partition currently carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// No recognized signature.
    Blank,
    PartitionTable { pttype: String },
    /// A filesystem or other content signature (`LVM2_member`, swap, ...).
    Signature { fs_type: String, uuid: Option<String> },
    /// Several conflicting signatures.
    Ambivalent,
}

/// Probe `node` directly, bypassing the blkid cache.
///
/// Errors are returned as `Err(reason)`; callers map them to the error of
/// the step they belong to.
pub fn probe(runner: &dyn CommandRunner, node: &Path) -> Result<Probe, String> {
    let cmd = CommandSpec::new("blkid")
        .args(["-p", "-o", "export"])
        .arg(node.display().to_string());
    let output = runner
        .run(&cmd)
        .map_err(|e| format!("failed to launch blkid: {}", e))?;

    match output.code {
        Some(0) => Ok(parse_export(&output.stdout)),
        Some(NOTHING_FOUND) => Ok(Probe::Blank),
        Some(AMBIVALENT) => Ok(Probe::Ambivalent),
        _ => Err(format!(
            "blkid could not probe {}: {}",
            node.display(),
            output.diagnostic()
        )),
    }
}

fn parse_export(stdout: &str) -> Probe {
    let fields: HashMap<&str, &str> = stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();

    if let Some(pttype) = fields.get("PTTYPE")
        && !fields.contains_key("TYPE")
    {
        return Probe::PartitionTable {
            pttype: pttype.to_string(),
        };
    }
    match fields.get("TYPE") {
        Some(fs_type) => Probe::Signature {
            fs_type: fs_type.to_string(),
            uuid: fields.get("UUID").map(|u| u.to_string()),
        },
        // Only partition-entry fields (PART_ENTRY_*): nothing on it yet
        None => Probe::Blank,
    }
}

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
struct PartitionTable {
    label: String,
    #[serde(default)]
    partitions: Vec<PartitionEntry>,
}

#[derive(Debug, Deserialize)]
struct PartitionEntry {
    node: PathBuf,
}

/// Partition table label and partition nodes, in table order.
pub fn read_partitions(
    runner: &dyn CommandRunner,
    device: &Path,
) -> DiskResult<(String, Vec<PathBuf>)> {
    let cmd = CommandSpec::new("sfdisk")
        .arg("--json")
        .arg(device.display().to_string());
    let output = runner.run(&cmd).map_err(|e| {
        DiskError::PartitionFailed(format!("Failed to launch sfdisk: {}", e))
    })?;
    if !output.success() {
        return Err(DiskError::AmbiguousDeviceState {
            device: device.display().to_string(),
            reason: format!("partition table unreadable: {}", output.diagnostic()),
        });
    }
    let dump: SfdiskDump =
        serde_json::from_str(&output.stdout).map_err(|e| DiskError::AmbiguousDeviceState {
            device: device.display().to_string(),
            reason: format!("unexpected sfdisk output: {}", e),
        })?;
    let nodes = dump
        .partitiontable
        .partitions
        .into_iter()
        .map(|p| p.node)
        .collect();
    Ok((dump.partitiontable.label, nodes))
}

/// Resolve a filesystem UUID to its device node with `blkid -U`.
pub fn resolve_uuid(runner: &dyn CommandRunner, uuid: &str) -> Result<Option<PathBuf>, String> {
    let output = runner
        .run(&CommandSpec::new("blkid").arg("-U").arg(uuid))
        .map_err(|e| format!("failed to launch blkid: {}", e))?;
    match output.code {
        Some(0) => Ok(output
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)),
        Some(NOTHING_FOUND) => Ok(None),
        _ => Err(format!("blkid -U {} failed: {}", uuid, output.diagnostic())),
    }
}
