//! Command-line definition for `diskattach`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use diskattach::DiskAttachConfig;
use diskattach::volume::FsType;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "diskattach",
    author,
    version,
    about = "Attach a disk image over NBD and keep it mounted across boots"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the whole boot sequence: export, attach, partition, format, mount
    Up(SequenceFlags),
    /// Unmount, detach and stop the export
    Down(SequenceFlags),
    /// Serve the image on its local NBD endpoint
    Export(SequenceFlags),
    /// Bind the exported image to a free NBD device
    Attach(SequenceFlags),
    /// Release an NBD device
    Detach {
        #[arg(long)]
        device: PathBuf,
    },
    /// Create the single data partition on a blank device
    Partition {
        #[arg(long)]
        device: PathBuf,
    },
    /// Create a filesystem on a blank partition and print its UUID
    Format {
        #[arg(long)]
        partition: PathBuf,

        #[arg(long)]
        fs_type: Option<FsType>,
    },
    /// Mount a volume by filesystem UUID and hand it to its owner
    Mount {
        #[arg(long)]
        uuid: String,

        #[command(flatten)]
        sequence: SequenceFlags,
    },
    /// Add a blank device to a volume group
    Extend {
        #[arg(long)]
        device: PathBuf,

        #[arg(long = "vg")]
        volume_group: String,
    },
    /// Install and enable the systemd unit that replays `up` at boot
    InstallUnit {
        #[command(flatten)]
        sequence: SequenceFlags,

        /// Start the unit right away
        #[arg(long)]
        start: bool,
    },
    /// Create a sparse qcow2 image unless it already exists
    CreateImage {
        #[arg(long)]
        image: Option<PathBuf>,

        /// Virtual size, e.g. 126G
        #[arg(long)]
        size: Option<String>,
    },
    /// Verify required tools and privileges
    Check(SequenceFlags),
    /// Show export, device and mount state as JSON
    Status(SequenceFlags),
}

// ============================================================================
// GLOBAL FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// JSON configuration file
    #[arg(long, global = true, env = "DISKATTACH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

// ============================================================================
// SEQUENCE FLAGS
// ============================================================================

/// Per-invocation overrides of the configured boot sequence.
#[derive(Args, Debug, Clone, Default)]
pub struct SequenceFlags {
    /// Backing disk image
    #[arg(long)]
    pub image: Option<PathBuf>,

    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    #[arg(long)]
    pub fs_type: Option<FsType>,

    /// Account that owns the mounted volume
    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub group: Option<String>,

    /// Volume group to activate during `up`
    #[arg(long)]
    pub volume_group: Option<String>,
}

impl SequenceFlags {
    pub fn apply_to(&self, config: &mut DiskAttachConfig) {
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(mount_point) = &self.mount_point {
            config.mount_point = mount_point.clone();
        }
        if let Some(fs_type) = self.fs_type {
            config.fs_type = fs_type;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(group) = &self.group {
            config.group = group.clone();
        }
        if let Some(vg) = &self.volume_group {
            config.volume_group = Some(vg.clone());
        }
    }
}

impl Commands {
    pub fn sequence_flags(&self) -> Option<&SequenceFlags> {
        match self {
            Commands::Up(flags)
            | Commands::Down(flags)
            | Commands::Export(flags)
            | Commands::Attach(flags)
            | Commands::Check(flags)
            | Commands::Status(flags) => Some(flags),
            Commands::Mount { sequence, .. } | Commands::InstallUnit { sequence, .. } => {
                Some(sequence)
            }
            _ => None,
        }
    }
}
