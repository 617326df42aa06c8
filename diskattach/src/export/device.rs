//! Kernel NBD device slots, as seen through sysfs.

use std::path::{Path, PathBuf};

use crate::constants::nbd::{MODULE, PID_ATTR, SECTOR_SIZE, SIZE_ATTR};
use crate::util::HostPaths;

/// The pool of `/dev/nbdN` devices.
///
/// A slot is connected while `/sys/block/nbdN/pid` exists; the kernel
/// removes the attribute when the client disconnects.
#[derive(Debug, Clone)]
pub struct NbdDevices {
    paths: HostPaths,
}

impl NbdDevices {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths }
    }

    pub fn module_loaded(&self) -> bool {
        self.paths.module_dir(MODULE).exists()
    }

    /// Slot names (`nbd0`, `nbd1`, ...) in numeric order.
    pub fn slots(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.paths.block_dir()) else {
            return Vec::new();
        };
        let mut slots: Vec<(u32, String)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| slot_index(&name).map(|index| (index, name)))
            .collect();
        slots.sort();
        slots.into_iter().map(|(_, name)| name).collect()
    }

    pub fn is_connected(&self, slot: &str) -> bool {
        self.attr_path(slot, PID_ATTR).exists()
    }

    /// First slot with no client attached.
    pub fn first_free(&self) -> Option<String> {
        self.slots().into_iter().find(|slot| !self.is_connected(slot))
    }

    /// Device size in bytes; 0 when unknown or not yet negotiated.
    pub fn size_bytes(&self, slot: &str) -> u64 {
        std::fs::read_to_string(self.attr_path(slot, SIZE_ATTR))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * SECTOR_SIZE)
            .unwrap_or(0)
    }

    pub fn node(&self, slot: &str) -> PathBuf {
        self.paths.device_node(slot)
    }

    fn attr_path(&self, slot: &str, attr: &str) -> PathBuf {
        self.paths.block_dir().join(slot).join(attr)
    }
}

/// Slot name of an NBD device node (`/dev/nbd3` -> `nbd3`).
pub fn slot_name(device: &Path) -> Option<String> {
    let name = device.file_name()?.to_str()?;
    slot_index(name).map(|_| name.to_string())
}

fn slot_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("nbd")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
