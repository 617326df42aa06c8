//! `diskattach` command-line front end.

mod cli;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use diskattach::util::init_logging;
use diskattach::volume::VolumeUuid;
use diskattach::{DiskAttachConfig, DiskAttachManager};

use cli::{Cli, Commands};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.global.config {
        Some(path) => DiskAttachConfig::load(path)?,
        None => DiskAttachConfig::default(),
    };
    if let Some(flags) = cli.command.sequence_flags() {
        flags.apply_to(&mut config);
    }

    let log_dir = cli.global.log_dir.clone().or_else(|| config.log_dir.clone());
    // Dropped on return, flushing the log file
    let _log_guard = init_logging(cli.global.debug, log_dir.as_deref())?;

    let code = run(cli, config).await?;
    Ok(ExitCode::from(code))
}

async fn run(cli: Cli, config: DiskAttachConfig) -> anyhow::Result<u8> {
    let manager = DiskAttachManager::new(config)?;
    let sequence = manager.config().boot_sequence();
    let layers = manager.layers();

    match cli.command {
        Commands::Up(_) => {
            let report = manager.up(&sequence).await;
            if report.is_degraded() {
                return Ok(1);
            }
        }
        Commands::Down(_) => manager.down(&sequence)?,
        Commands::Export(_) => {
            let endpoint = layers.exporter.ensure_exported(&sequence.image)?;
            println!("{}", endpoint);
        }
        Commands::Attach(_) => {
            let endpoint = layers.exporter.endpoint_for(&sequence.image)?;
            let attached = layers.exporter.attach(&endpoint)?;
            println!("{}", attached.device.display());
        }
        Commands::Detach { device } => layers.exporter.detach(&device)?,
        Commands::Partition { device } => {
            let partition = layers.volumes.ensure_partitioned(&device)?;
            println!("{}", partition.display());
        }
        Commands::Format { partition, fs_type } => {
            let fs_type = fs_type.unwrap_or(sequence.fs_type);
            let uuid = layers.volumes.ensure_filesystem(&partition, fs_type)?;
            println!("{}", uuid);
        }
        Commands::Mount { uuid, .. } => {
            let target = layers.mount_target(&sequence);
            let outcome = layers
                .mounts
                .ensure_mounted(&VolumeUuid::new(uuid), &target)?;
            tracing::info!(target = %target.path.display(), outcome = ?outcome, "Mount done");
        }
        Commands::Extend {
            device,
            volume_group,
        } => layers.volumes.extend_volume_group(&device, &volume_group)?,
        Commands::InstallUnit { start, .. } => {
            let program = std::env::current_exe().context("Cannot locate the diskattach binary")?;
            let config_path = match &cli.global.config {
                Some(path) => Some(
                    path.canonicalize()
                        .with_context(|| format!("Cannot resolve {}", path.display()))?,
                ),
                None => None,
            };
            let outcome = manager.install_boot_unit(
                &sequence,
                &program,
                config_path.as_deref(),
                start,
            )?;
            tracing::info!(
                unit = %manager.config().unit_path().display(),
                outcome = ?outcome,
                "Boot unit installed"
            );
        }
        Commands::CreateImage { image, size } => {
            let path = image.unwrap_or_else(|| sequence.image.clone());
            let size = size.unwrap_or_else(|| manager.config().image_size.clone());
            let image = manager.create_image(&path, &size)?;
            println!("{} ({}, {} bytes)", image.path.display(), image.format, image.size);
        }
        Commands::Check(_) => {
            let report = manager.check(&sequence);
            print_json(&report)?;
            if !report.is_ready() {
                tracing::warn!(
                    missing = ?report.missing(),
                    cap_sys_admin = report.cap_sys_admin,
                    "Host is missing prerequisites"
                );
                return Ok(1);
            }
        }
        Commands::Status(_) => print_json(&manager.status(&sequence)?)?,
    }
    Ok(0)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
