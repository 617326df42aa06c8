//! Block export layer.
//!
//! ```text
//! DiskImage ──qemu-nbd──> Endpoint (unix socket + export name)
//!                              │
//!                         nbd-client
//!                              ▼
//!                        /dev/nbdN (AttachedDevice)
//! ```
//!
//! Every step checks what already exists before acting, so the whole layer
//! can be re-run at each boot. Per-endpoint work is serialized with an
//! advisory lock on `<run_dir>/<export>.lock`; the session record is
//! created exclusively on top of that.

mod device;
mod server;
mod session;

use std::fmt;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use device::{NbdDevices, slot_name};
pub use server::{ExportServer, QemuNbdServer, ServerProcess};
pub use session::{ExportSession, SessionStore};

use crate::constants::export::NAME_DIGEST_LEN;
use crate::constants::nbd::MODULE;
use crate::image::DiskImage;
use crate::mount::MountTable;
use crate::util::{CommandRunner, CommandSpec, HostPaths, Readiness};

const NBD_CLIENT: &str = "nbd-client";

/// Where an image is served: a unix socket plus the NBD export name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub export_name: String,
    pub socket: PathBuf,
}

impl Endpoint {
    /// The endpoint for `image` under `run_dir`.
    ///
    /// Derived from the canonical image path, so every invocation agrees on
    /// it without coordination.
    pub fn for_image(image: &DiskImage, run_dir: &Path) -> Self {
        let digest = hex::encode(Sha256::digest(image.path.as_os_str().as_bytes()));
        let stem: String = image
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect();
        let stem = if stem.is_empty() { "disk".to_string() } else { stem };
        let export_name = format!("{}-{}", stem, &digest[..NAME_DIGEST_LEN]);

        Self {
            socket: run_dir.join(format!("{}.sock", export_name)),
            export_name,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nbd+unix:///{}?socket={}",
            self.export_name,
            self.socket.display()
        )
    }
}

/// A kernel block device bound to an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub device: PathBuf,
    /// Lookup key for the owning session, not ownership.
    pub endpoint: Endpoint,
}

/// What the session record and the host say about one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportStatus {
    pub endpoint: Endpoint,
    pub pid: Option<u32>,
    pub serving: bool,
    pub device: Option<PathBuf>,
    pub device_connected: bool,
}

/// Exports images and binds them to kernel NBD devices.
pub struct BlockExporter {
    runner: Arc<dyn CommandRunner>,
    server: Arc<dyn ExportServer>,
    paths: HostPaths,
    devices: NbdDevices,
    store: SessionStore,
    nbds_max: u32,
    readiness: Readiness,
}

impl BlockExporter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        server: Arc<dyn ExportServer>,
        paths: HostPaths,
        run_dir: PathBuf,
        nbds_max: u32,
        readiness: Readiness,
    ) -> Self {
        Self {
            runner,
            server,
            devices: NbdDevices::new(paths.clone()),
            paths,
            store: SessionStore::new(run_dir),
            nbds_max,
            readiness,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.store
    }

    pub fn devices(&self) -> &NbdDevices {
        &self.devices
    }

    /// Endpoint `image` is (or would be) served on.
    pub fn endpoint_for(&self, image: &Path) -> DiskResult<Endpoint> {
        let image = DiskImage::open(image)?;
        Ok(Endpoint::for_image(&image, self.store.run_dir()))
    }

    /// Read-only view of the export of `image`, if a session exists.
    pub fn status(&self, image: &Path) -> DiskResult<Option<ExportStatus>> {
        let endpoint = self.endpoint_for(image)?;
        let Some(session) = self.store.load(&endpoint)? else {
            return Ok(None);
        };
        let serving = session
            .pid
            .is_some_and(|pid| self.server.is_serving(pid, &endpoint));
        let device_connected = session
            .device
            .as_deref()
            .and_then(slot_name)
            .is_some_and(|slot| self.devices.is_connected(&slot));
        Ok(Some(ExportStatus {
            endpoint,
            pid: session.pid,
            serving,
            device: session.device,
            device_connected,
        }))
    }

    /// Make sure `image` is served, returning its endpoint.
    ///
    /// Reuses a live session, replaces a stale one, and refuses when the
    /// image is already served elsewhere or the socket is taken.
    pub fn ensure_exported(&self, image: &Path) -> DiskResult<Endpoint> {
        let image = DiskImage::open(image).map_err(|e| {
            DiskError::ExportUnavailable(format!("Cannot export {}: {}", image.display(), e))
        })?;
        let endpoint = Endpoint::for_image(&image, self.store.run_dir());
        let _lock = self.lock(&endpoint)?;

        if let Some(session) = self.store.load(&endpoint)? {
            match session.pid {
                Some(pid) if self.server.is_serving(pid, &endpoint) => {
                    tracing::debug!(pid, endpoint = %endpoint, "Image already exported");
                    return Ok(endpoint);
                }
                Some(pid) => {
                    tracing::warn!(pid, endpoint = %endpoint, "Export server gone, replacing stale session");
                }
                None => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        age_secs = session.age_secs(),
                        "Export claim never completed, replacing it"
                    );
                }
            }
            self.store.remove(&endpoint)?;
        }

        let servers = self.server.servers_for(&image.path);
        if let Some(adopt) = servers
            .iter()
            .find(|s| s.socket.as_deref() == Some(endpoint.socket.as_path()))
        {
            // Server survived but its record did not (run dir wiped)
            let mut session = ExportSession::claim(image.path.clone(), image.format, endpoint.clone());
            session.pid = Some(adopt.pid);
            self.store.save(&session)?;
            tracing::info!(pid = adopt.pid, endpoint = %endpoint, "Adopted running export server");
            return Ok(endpoint);
        }
        if let Some(other) = servers.first() {
            return Err(DiskError::ExportUnavailable(format!(
                "{} is already served by pid {}{}",
                image.path.display(),
                other.pid,
                other
                    .socket
                    .as_ref()
                    .map(|s| format!(" at {}", s.display()))
                    .unwrap_or_default()
            )));
        }

        self.reclaim_socket(&endpoint)?;

        let mut session = ExportSession::claim(image.path.clone(), image.format, endpoint.clone());
        if !self.store.claim(&session)? {
            return Err(DiskError::ExportUnavailable(format!(
                "Endpoint {} was claimed concurrently",
                endpoint
            )));
        }

        match self
            .server
            .start(&image, &endpoint, &self.store.pid_path(&endpoint))
        {
            Ok(pid) => {
                session.pid = Some(pid);
                self.store.save(&session)?;
                Ok(endpoint)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&endpoint) {
                    tracing::warn!(error = %cleanup, "Failed to release export claim");
                }
                Err(e)
            }
        }
    }

    /// Bind `endpoint` to a free NBD device.
    ///
    /// Returns the already-bound device when there is one. Failure leaves
    /// the export session untouched so the call can be retried.
    pub fn attach(&self, endpoint: &Endpoint) -> DiskResult<AttachedDevice> {
        let _lock = self.lock(endpoint)?;

        let mut session = self.store.load(endpoint)?.ok_or_else(|| {
            DiskError::AttachFailed(format!("No export session for {}", endpoint))
        })?;
        match session.pid {
            Some(pid) if self.server.is_serving(pid, endpoint) => {}
            _ => {
                return Err(DiskError::AttachFailed(format!(
                    "Export server for {} is not running",
                    endpoint
                )));
            }
        }

        if let Some(device) = session.device.clone() {
            if slot_name(&device).is_some_and(|slot| self.devices.is_connected(&slot)) {
                tracing::debug!(device = %device.display(), "Export already attached");
                return Ok(AttachedDevice {
                    device,
                    endpoint: endpoint.clone(),
                });
            }
            tracing::warn!(device = %device.display(), "Recorded device no longer connected, clearing");
            session.device = None;
            self.store.save(&session)?;
        }

        self.ensure_module()?;

        let slot = self.devices.first_free().ok_or_else(|| {
            DiskError::AttachFailed(format!(
                "No free NBD device ({} slots, all in use)",
                self.devices.slots().len()
            ))
        })?;
        let device = self.devices.node(&slot);

        let cmd = CommandSpec::new(NBD_CLIENT)
            .arg("-unix")
            .arg(endpoint.socket.display().to_string())
            .arg(device.display().to_string())
            .arg("-N")
            .arg(endpoint.export_name.clone());
        let output = self.runner.run(&cmd).map_err(|e| {
            DiskError::AttachFailed(format!("Failed to launch {}: {}", NBD_CLIENT, e))
        })?;
        if !output.success() {
            return Err(DiskError::AttachFailed(format!(
                "{} could not bind {} to {}: {}",
                NBD_CLIENT,
                endpoint,
                device.display(),
                output.diagnostic()
            )));
        }

        if !self.readiness.wait_until(|| self.devices.size_bytes(&slot) > 0) {
            let _ = self.disconnect(&device);
            return Err(DiskError::AttachFailed(format!(
                "{} did not report a size after attach",
                device.display()
            )));
        }

        session.device = Some(device.clone());
        self.store.save(&session)?;
        tracing::info!(
            device = %device.display(),
            endpoint = %endpoint,
            size_bytes = self.devices.size_bytes(&slot),
            "Attached export"
        );

        Ok(AttachedDevice {
            device,
            endpoint: endpoint.clone(),
        })
    }

    /// Unbind `device`. No-op when it is not connected.
    ///
    /// Refuses while the device or one of its partitions is mounted.
    pub fn detach(&self, device: &Path) -> DiskResult<()> {
        let slot = slot_name(device).ok_or_else(|| {
            DiskError::Config(format!("{} is not an NBD device", device.display()))
        })?;

        if self.devices.is_connected(&slot) {
            let table = MountTable::load(&self.paths.mountinfo)?;
            if let Some(mount) = table.find_device_or_partition(device) {
                return Err(DiskError::DeviceBusy(format!(
                    "{} is mounted at {}, unmount it first",
                    mount.source,
                    mount.target.display()
                )));
            }
            self.disconnect(device)?;
            tracing::info!(device = %device.display(), "Detached device");
        } else {
            tracing::debug!(device = %device.display(), "Device not connected, nothing to detach");
        }

        for mut session in self.store.list()? {
            if session.device.as_deref() == Some(device) {
                session.device = None;
                self.store.save(&session)?;
            }
        }
        Ok(())
    }

    /// Stop serving `image` and forget its session.
    pub fn stop_export(&self, image: &Path) -> DiskResult<()> {
        let image = DiskImage::open(image)?;
        let endpoint = Endpoint::for_image(&image, self.store.run_dir());
        let _lock = self.lock(&endpoint)?;

        if let Some(session) = self.store.load(&endpoint)? {
            if let Some(device) = &session.device
                && slot_name(device).is_some_and(|slot| self.devices.is_connected(&slot))
            {
                return Err(DiskError::DeviceBusy(format!(
                    "{} is still attached to {}, detach it first",
                    device.display(),
                    endpoint
                )));
            }
            if let Some(pid) = session.pid
                && self.server.is_serving(pid, &endpoint)
            {
                self.server.stop(pid)?;
            }
        }
        self.store.remove(&endpoint)?;
        tracing::info!(endpoint = %endpoint, "Export stopped");
        Ok(())
    }

    fn ensure_module(&self) -> DiskResult<()> {
        if self.devices.module_loaded() {
            return Ok(());
        }
        let cmd = CommandSpec::new("modprobe")
            .arg(MODULE)
            .arg(format!("nbds_max={}", self.nbds_max));
        let output = self.runner.run(&cmd).map_err(|e| {
            DiskError::AttachFailed(format!("Failed to launch modprobe: {}", e))
        })?;
        if !output.success() {
            return Err(DiskError::AttachFailed(format!(
                "Failed to load the {} module: {}",
                MODULE,
                output.diagnostic()
            )));
        }
        tracing::info!(nbds_max = self.nbds_max, "Loaded nbd module");
        Ok(())
    }

    fn disconnect(&self, device: &Path) -> DiskResult<()> {
        let cmd = CommandSpec::new(NBD_CLIENT)
            .arg("-d")
            .arg(device.display().to_string());
        let output = self.runner.run(&cmd).map_err(|e| {
            DiskError::Storage(format!("Failed to launch {}: {}", NBD_CLIENT, e))
        })?;
        if !output.success() {
            return Err(DiskError::Storage(format!(
                "Failed to disconnect {}: {}",
                device.display(),
                output.diagnostic()
            )));
        }
        Ok(())
    }

    /// Remove a leftover socket file, or fail if something is listening on it.
    fn reclaim_socket(&self, endpoint: &Endpoint) -> DiskResult<()> {
        if std::fs::symlink_metadata(&endpoint.socket).is_err() {
            return Ok(());
        }
        if UnixStream::connect(&endpoint.socket).is_ok() {
            return Err(DiskError::ExportUnavailable(format!(
                "Socket {} is bound by an unrelated process",
                endpoint.socket.display()
            )));
        }
        tracing::debug!(socket = %endpoint.socket.display(), "Removing leftover socket");
        std::fs::remove_file(&endpoint.socket).map_err(|e| {
            DiskError::ExportUnavailable(format!(
                "Failed to remove leftover socket {}: {}",
                endpoint.socket.display(),
                e
            ))
        })
    }

    fn lock(&self, endpoint: &Endpoint) -> DiskResult<Flock<File>> {
        self.store.ensure_dir()?;
        let path = self.store.lock_path(endpoint);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                DiskError::Storage(format!("Failed to open lock {}: {}", path.display(), e))
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            DiskError::Storage(format!("Failed to lock {}: {}", path.display(), errno))
        })
    }
}
