//! `/proc/self/mountinfo` parsing.

use std::path::{Path, PathBuf};

use diskattach_shared::errors::{DiskError, DiskResult};

/// One line of mountinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Snapshot of the mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load(path: &Path) -> DiskResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiskError::Storage(format!("Failed to read mount table {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    /// Parse mountinfo content. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content.lines().filter_map(parse_line).collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Topmost mount at exactly `target`.
    pub fn find_target(&self, target: &Path) -> Option<&MountEntry> {
        self.entries.iter().rev().find(|e| e.target == target)
    }

    /// First mount whose source is `device` or a partition of it
    /// (`/dev/nbd0` matches `/dev/nbd0p1`).
    pub fn find_device_or_partition(&self, device: &Path) -> Option<&MountEntry> {
        self.mounts_of(device).into_iter().next()
    }

    /// Every mount of `device` or its partitions, in mount order.
    pub fn mounts_of(&self, device: &Path) -> Vec<&MountEntry> {
        let device = device.to_string_lossy();
        self.entries
            .iter()
            .filter(|e| {
                e.source == device
                    || e.source
                        .strip_prefix(device.as_ref())
                        .is_some_and(|rest| is_partition_suffix(&device, rest))
            })
            .collect()
    }
}

/// `sda` takes `sda1`, while names ending in a digit need the `p`
/// separator (`nbd3p1`, never `nbd30`).
fn is_partition_suffix(device: &str, rest: &str) -> bool {
    let digits = if device.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest.strip_prefix('p').unwrap_or(rest)
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
fn parse_line(line: &str) -> Option<MountEntry> {
    let (pre, post) = line.split_once(" - ")?;
    let target = pre.split_whitespace().nth(4)?;
    let mut post = post.split_whitespace();
    let fs_type = post.next()?;
    let source = post.next()?;
    Some(MountEntry {
        target: PathBuf::from(unescape(target)),
        fs_type: unescape(fs_type),
        source: unescape(source),
    })
}

/// Decode the octal escapes the kernel uses for space, tab, newline and
/// backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && (b'0'..=b'3').contains(&bytes[i + 1])
            && bytes[i + 2..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
