//! NBD export server processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};

use super::Endpoint;
use crate::image::DiskImage;
use crate::util::{
    CommandRunner, CommandSpec, Readiness, find_processes, is_process_alive, is_same_process,
    terminate_process,
};

const QEMU_NBD: &str = "qemu-nbd";

/// A running server found for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProcess {
    pub pid: u32,
    /// Unix socket the server listens on, if it uses one.
    pub socket: Option<PathBuf>,
}

/// Serves disk images over NBD.
pub trait ExportServer: Send + Sync {
    /// Start serving `image` at `endpoint`, returning the server PID.
    fn start(&self, image: &DiskImage, endpoint: &Endpoint, pid_file: &Path) -> DiskResult<u32>;

    /// Whether `pid` is alive and is the server for `endpoint`.
    fn is_serving(&self, pid: u32, endpoint: &Endpoint) -> bool;

    /// Every running server process that has `image` open.
    fn servers_for(&self, image: &Path) -> Vec<ServerProcess>;

    fn stop(&self, pid: u32) -> DiskResult<()>;
}

/// `qemu-nbd` daemonized on a unix socket.
pub struct QemuNbdServer {
    runner: Arc<dyn CommandRunner>,
    proc_root: PathBuf,
    readiness: Readiness,
}

impl QemuNbdServer {
    pub fn new(runner: Arc<dyn CommandRunner>, proc_root: PathBuf, readiness: Readiness) -> Self {
        Self {
            runner,
            proc_root,
            readiness,
        }
    }

    fn command(image: &DiskImage, endpoint: &Endpoint, pid_file: &Path) -> CommandSpec {
        CommandSpec::new(QEMU_NBD)
            .arg("--fork")
            .arg("--persistent")
            .arg(format!("--format={}", image.format))
            .arg(format!("--export-name={}", endpoint.export_name))
            .arg(format!("--socket={}", endpoint.socket.display()))
            .arg(format!("--pid-file={}", pid_file.display()))
            .arg(image.path.display().to_string())
    }
}

impl ExportServer for QemuNbdServer {
    fn start(&self, image: &DiskImage, endpoint: &Endpoint, pid_file: &Path) -> DiskResult<u32> {
        let cmd = Self::command(image, endpoint, pid_file);
        let output = self.runner.run(&cmd).map_err(|e| {
            DiskError::ExportUnavailable(format!("Failed to launch {}: {}", QEMU_NBD, e))
        })?;
        if !output.success() {
            return Err(DiskError::ExportUnavailable(format!(
                "{} could not serve {}: {}",
                QEMU_NBD,
                image.path.display(),
                output.diagnostic()
            )));
        }

        // --fork returns once the socket is listening; the pid file follows
        let mut pid = None;
        self.readiness.wait_until(|| {
            pid = read_pid_file(pid_file);
            pid.is_some()
        });
        let pid = pid.ok_or_else(|| {
            DiskError::ExportUnavailable(format!(
                "{} started but wrote no pid file at {}",
                QEMU_NBD,
                pid_file.display()
            ))
        })?;

        tracing::info!(
            pid,
            image = %image.path.display(),
            endpoint = %endpoint,
            "Export server started"
        );
        Ok(pid)
    }

    fn is_serving(&self, pid: u32, endpoint: &Endpoint) -> bool {
        let socket_arg = format!("--socket={}", endpoint.socket.display());
        is_process_alive(pid) && is_same_process(&self.proc_root, pid, QEMU_NBD, &[&socket_arg])
    }

    fn servers_for(&self, image: &Path) -> Vec<ServerProcess> {
        let image_arg = image.display().to_string();
        find_processes(&self.proc_root, QEMU_NBD, &image_arg)
            .into_iter()
            .filter(|(_, args)| args.last().is_some_and(|last| *last == image_arg))
            .map(|(pid, args)| ServerProcess {
                pid,
                socket: socket_from_args(&args),
            })
            .collect()
    }

    fn stop(&self, pid: u32) -> DiskResult<()> {
        if terminate_process(pid) {
            tracing::info!(pid, "Export server stopped");
            Ok(())
        } else {
            Err(DiskError::ExportUnavailable(format!(
                "Failed to signal export server {}",
                pid
            )))
        }
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

/// Socket path from `--socket=PATH`, `-k PATH` or `--socket PATH`.
fn socket_from_args(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(path) = arg.strip_prefix("--socket=") {
            return Some(PathBuf::from(path));
        }
        if arg == "-k" || arg == "--socket" {
            return iter.next().map(PathBuf::from);
        }
    }
    None
}
