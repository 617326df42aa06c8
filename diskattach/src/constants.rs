//! Storage and device constants.
//!
//! Centralized location for defaults and on-disk format values.

/// QCOW2 disk image configuration
pub mod qcow2 {
    /// Default virtual size for newly created images (sparse, grows as needed)
    pub const DEFAULT_DISK_SIZE_GB: u64 = 126;

    /// QCOW2 cluster size in bits (64KB = 2^16)
    pub const CLUSTER_BITS: usize = 16;

    /// QCOW2 refcount order (16-bit refcounts = 2^4)
    pub const REFCOUNT_ORDER: u8 = 4;

    /// Block size for QCOW2 formatting (512 bytes)
    pub const BLOCK_SIZE: usize = 512;

    /// "QFI\xfb"
    pub const MAGIC: u32 = 0x514649fb;

    /// Bytes needed to read magic, version, cluster bits and virtual size.
    pub const HEADER_PROBE_LEN: usize = 32;

    /// Mode applied to images created by `create-image`.
    pub const IMAGE_MODE: u32 = 0o660;

    /// Group owning images created by `create-image`.
    pub const IMAGE_GROUP: &str = "disk";
}

/// Kernel NBD client configuration
pub mod nbd {
    /// Kernel module providing /dev/nbdN
    pub const MODULE: &str = "nbd";

    /// Number of device slots requested when loading the module
    pub const DEFAULT_NBDS_MAX: u32 = 16;

    /// sysfs attribute present only while a device is connected
    pub const PID_ATTR: &str = "pid";

    /// sysfs size attribute, in 512-byte sectors
    pub const SIZE_ATTR: &str = "size";

    pub const SECTOR_SIZE: u64 = 512;
}

/// Export session bookkeeping
pub mod export {
    /// Default runtime directory for sockets and session records (tmpfs)
    pub const DEFAULT_RUN_DIR: &str = "/run/diskattach";

    /// Length of the hex digest suffix in export names
    pub const NAME_DIGEST_LEN: usize = 12;
}

/// Polling for devices that appear asynchronously (udev, kernel)
pub mod readiness {
    pub const ATTEMPTS: u32 = 60;
    pub const DELAY_MS: u64 = 500;
}

/// blkid exit codes
pub mod blkid {
    /// No signature found
    pub const NOTHING_FOUND: i32 = 2;
    /// Low-level probe found conflicting signatures
    pub const AMBIVALENT: i32 = 8;
}

/// LVM exit code when a named object does not exist
pub const LVM_NOT_FOUND: i32 = 5;

/// systemd defaults
pub mod systemd {
    pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";
    pub const DEFAULT_UNIT_NAME: &str = "diskattach-data.service";
    pub const WANTED_BY: &str = "multi-user.target";
    /// Bound on the whole boot sequence so a wedged step never stalls boot.
    pub const START_TIMEOUT_SECS: u64 = 300;
}
