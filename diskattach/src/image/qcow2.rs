//! Sparse qcow2 image creation.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use diskattach_shared::errors::{DiskError, DiskResult};
use qcow2_rs::meta::Qcow2Header;

use super::DiskImage;
use crate::constants::qcow2::{BLOCK_SIZE, CLUSTER_BITS, IMAGE_GROUP, IMAGE_MODE, REFCOUNT_ORDER};

/// Create a sparse qcow2 image of `size_bytes` at `path`.
///
/// An existing file is left untouched and probed instead; this never
/// overwrites an image that may already hold data.
pub fn create_qcow2(path: &Path, size_bytes: u64) -> DiskResult<DiskImage> {
    if path.exists() {
        tracing::info!(path = %path.display(), "Disk image already exists, not creating");
        return DiskImage::open(path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DiskError::Storage(format!(
                "Failed to create parent directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    tracing::info!(
        path = %path.display(),
        size_bytes,
        "Creating sparse qcow2 disk image"
    );

    // Calculate required metadata size
    let (rc_table, rc_block, _l1_table) =
        Qcow2Header::calculate_meta_params(size_bytes, CLUSTER_BITS, REFCOUNT_ORDER, BLOCK_SIZE);
    let clusters = 1 + rc_table.1 + rc_block.1;
    let buffer_size = ((clusters as usize) << CLUSTER_BITS) + BLOCK_SIZE;

    let mut header_buf = vec![0u8; buffer_size];
    Qcow2Header::format_qcow2(
        &mut header_buf,
        size_bytes,
        CLUSTER_BITS,
        REFCOUNT_ORDER,
        BLOCK_SIZE,
    )
    .map_err(|e| {
        DiskError::Storage(format!(
            "Failed to format qcow2 header for {}: {}",
            path.display(),
            e
        ))
    })?;

    // create_new: a concurrent creator wins, we fail instead of truncating it
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            DiskError::Storage(format!(
                "Failed to create disk image {}: {}",
                path.display(),
                e
            ))
        })?;

    file.write_all(&header_buf).map_err(|e| {
        DiskError::Storage(format!(
            "Failed to write qcow2 header to {}: {}",
            path.display(),
            e
        ))
    })?;
    file.sync_all()?;

    DiskImage::open(path)
}

/// Restrict an image to mode 0660, group `disk`.
pub fn secure_image(path: &Path) -> DiskResult<()> {
    let group = nix::unistd::Group::from_name(IMAGE_GROUP)
        .map_err(|e| DiskError::Config(format!("Group lookup for '{}' failed: {}", IMAGE_GROUP, e)))?
        .ok_or_else(|| DiskError::Config(format!("Group '{}' does not exist", IMAGE_GROUP)))?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(IMAGE_MODE)).map_err(|e| {
        DiskError::Storage(format!(
            "Failed to set mode {:o} on {}: {}",
            IMAGE_MODE,
            path.display(),
            e
        ))
    })?;
    std::os::unix::fs::chown(path, Some(0), Some(group.gid.as_raw())).map_err(|e| {
        DiskError::Storage(format!(
            "Failed to set ownership root:{} on {}: {}",
            IMAGE_GROUP,
            path.display(),
            e
        ))
    })?;

    tracing::info!(
        path = %path.display(),
        mode = %format!("{:o}", IMAGE_MODE),
        group = IMAGE_GROUP,
        "Secured disk image"
    );
    Ok(())
}

/// Parse a human size such as `126G`, `512M` or a plain byte count.
pub fn parse_size(input: &str) -> DiskResult<u64> {
    let trimmed = input.trim();
    let (digits, shift) = match trimmed.chars().last() {
        Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 10),
        Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 20),
        Some('G') | Some('g') => (&trimmed[..trimmed.len() - 1], 30),
        Some('T') | Some('t') => (&trimmed[..trimmed.len() - 1], 40),
        _ => (trimmed, 0),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| DiskError::Config(format!("Invalid size '{}'", input)))?;
    if value == 0 {
        return Err(DiskError::Config(format!("Size must be non-zero: '{}'", input)));
    }
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| DiskError::Config(format!("Size '{}' overflows", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DiskFormat;
    use tempfile::TempDir;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("126G").unwrap(), 126 << 30);
        assert_eq!(parse_size("512m").unwrap(), 512 << 20);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("0G").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_create_qcow2_is_sparse_and_probeable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("images/data.qcow2");

        let image = create_qcow2(&path, 1 << 30).unwrap();
        assert_eq!(image.format, DiskFormat::Qcow2);
        assert_eq!(image.size, 1 << 30);

        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert!(on_disk < 1 << 20, "image should be sparse, got {} bytes", on_disk);
    }

    #[test]
    fn test_create_qcow2_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.img");
        std::fs::write(&path, b"precious bytes").unwrap();

        let image = create_qcow2(&path, 1 << 30).unwrap();
        assert_eq!(image.format, DiskFormat::Raw);
        assert_eq!(std::fs::read(&path).unwrap(), b"precious bytes");
    }
}
