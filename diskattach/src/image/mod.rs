//! Disk image probing and creation.
//!
//! A [`DiskImage`] is the growable file backing the attached storage. It is
//! supplied out-of-band (host or earlier provisioning) and never deleted here.
//! [`create_qcow2`] exists for the explicit `create-image` command only.

mod qcow2;

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use diskattach_shared::errors::{DiskError, DiskResult};
use serde::{Deserialize, Serialize};

pub use qcow2::{create_qcow2, parse_size, secure_image};

use crate::constants::qcow2::{HEADER_PROBE_LEN, MAGIC};

/// On-disk format of an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    /// Name understood by `qemu-nbd --format`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A probed disk image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    /// Canonical absolute path
    pub path: PathBuf,
    pub format: DiskFormat,
    /// Virtual size in bytes (file length for raw images)
    pub size: u64,
}

impl DiskImage {
    /// Open and probe an existing image.
    ///
    /// Files starting with the qcow2 magic are qcow2; anything else is raw.
    pub fn open(path: &Path) -> DiskResult<Self> {
        let canonical = path.canonicalize().map_err(|e| {
            DiskError::Storage(format!("Disk image {} not found: {}", path.display(), e))
        })?;

        let metadata = std::fs::metadata(&canonical)?;
        if !metadata.is_file() {
            return Err(DiskError::Storage(format!(
                "Disk image {} is not a regular file",
                canonical.display()
            )));
        }

        let mut header = [0u8; HEADER_PROBE_LEN];
        let read = read_prefix(&canonical, &mut header)?;

        let image = if read >= HEADER_PROBE_LEN && be_u32(&header[0..4]) == MAGIC {
            let version = be_u32(&header[4..8]);
            let size = be_u64(&header[24..32]);
            tracing::trace!(
                path = %canonical.display(),
                version,
                size,
                "Probed qcow2 header"
            );
            DiskImage {
                path: canonical,
                format: DiskFormat::Qcow2,
                size,
            }
        } else {
            DiskImage {
                path: canonical,
                format: DiskFormat::Raw,
                size: metadata.len(),
            }
        };

        Ok(image)
    }
}

fn read_prefix(path: &Path, buf: &mut [u8]) -> DiskResult<usize> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        DiskError::Storage(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_image() {
        let dir = TempDir::new().unwrap();
        let err = DiskImage::open(&dir.path().join("missing.qcow2")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_open_raw_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let image = DiskImage::open(&path).unwrap();
        assert_eq!(image.format, DiskFormat::Raw);
        assert_eq!(image.size, 4096);
        assert!(image.path.is_absolute());
    }

    #[test]
    fn test_open_qcow2_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.qcow2");
        let mut header = vec![0u8; 512];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&3u32.to_be_bytes());
        header[24..32].copy_from_slice(&(8u64 << 30).to_be_bytes());
        std::fs::write(&path, header).unwrap();

        let image = DiskImage::open(&path).unwrap();
        assert_eq!(image.format, DiskFormat::Qcow2);
        assert_eq!(image.size, 8 << 30);
    }

    #[test]
    fn test_directory_is_not_an_image() {
        let dir = TempDir::new().unwrap();
        assert!(DiskImage::open(dir.path()).is_err());
    }
}
