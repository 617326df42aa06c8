//! Disk attachment manager.
//!
//! Makes a growable disk image available inside a Linux guest as a mounted,
//! correctly-owned data directory, and keeps it that way across reboots.
//!
//! ```text
//! export  (qemu-nbd, nbd-client)   image -> endpoint -> /dev/nbdN
//! volume  (blkid, sfdisk, mkfs)    /dev/nbdN -> /dev/nbdNp1 -> filesystem UUID
//! mount   (mount(2), setfacl)      UUID -> mount point owned by the user
//! lifecycle                        the boot sequence and its systemd unit
//! ```

pub mod config;
pub mod constants;
pub mod export;
pub mod image;
pub mod lifecycle;
pub mod manager;
pub mod mount;
pub mod pipeline;
pub mod util;
pub mod volume;

#[cfg(test)]
mod testing;

pub use config::DiskAttachConfig;
pub use diskattach_shared::errors::{DiskError, DiskResult};
pub use lifecycle::{BootReport, BootSequence, BootState};
pub use manager::DiskAttachManager;
