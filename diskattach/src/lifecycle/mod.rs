//! Boot sequence orchestration.
//!
//! ## Architecture
//!
//! The sequence is table-driven, one pipeline task per step:
//!
//! ```text
//!   1. export        NotExported -> Exported
//!   2. attach        Exported    -> Attached
//!   3. partition     Attached    -> Partitioned
//!      filesystem    Partitioned -> FilesystemReady
//!   4. volume_group  (only with a configured VG, state unchanged)
//!   5. mount         FilesystemReady -> Mounted
//!      permissions   Mounted -> PermissionsApplied
//! ```
//!
//! Any failing task stops the pipeline and the run ends `Degraded`, keeping
//! the last state that was reached for the report. Nothing is retried here;
//! the init system decides whether to run the unit again.

mod tasks;
mod unit;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use diskattach_shared::errors::{DiskError, DiskResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub use unit::{BootUnit, InstallOutcome, UnitInstaller};

use crate::export::{BlockExporter, Endpoint};
use crate::image::DiskImage;
use crate::mount::{MountManager, MountTarget, Owner};
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::volume::{FsType, Volume, VolumeManager};

use tasks::{
    AttachTask, BootContext, BootCtx, ExportTask, FilesystemTask, MountTask, PartitionTask,
    PermissionsTask, VolumeGroupTask,
};

/// Where a boot run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    NotExported,
    Exported,
    Attached,
    Partitioned,
    FilesystemReady,
    Mounted,
    PermissionsApplied,
    Degraded,
}

impl BootState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootState::NotExported => "not_exported",
            BootState::Exported => "exported",
            BootState::Attached => "attached",
            BootState::Partitioned => "partitioned",
            BootState::FilesystemReady => "filesystem_ready",
            BootState::Mounted => "mounted",
            BootState::PermissionsApplied => "permissions_applied",
            BootState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one boot run needs to know: which image, where it ends up and
/// for whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSequence {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: FsType,
    pub owner: Owner,
    pub volume_group: Option<String>,
}

/// The three layers a boot run drives.
pub struct Layers {
    pub exporter: BlockExporter,
    pub volumes: VolumeManager,
    pub mounts: MountManager,
    /// Mode applied to the mount root.
    pub dir_mode: u32,
}

impl Layers {
    pub fn mount_target(&self, sequence: &BootSequence) -> MountTarget {
        MountTarget {
            path: sequence.mount_point.clone(),
            owner: sequence.owner.clone(),
            mode: self.dir_mode,
        }
    }
}

/// Outcome of one boot run.
#[derive(Debug)]
pub struct BootReport {
    /// `PermissionsApplied` on success, `Degraded` otherwise.
    pub state: BootState,
    /// Last state reached before the run stopped.
    pub reached: BootState,
    pub failed_task: Option<String>,
    pub error: Option<DiskError>,
    pub endpoint: Option<Endpoint>,
    pub device: Option<PathBuf>,
    pub volume: Option<Volume>,
    pub metrics: PipelineMetrics,
    pub total_duration_ms: u128,
}

impl BootReport {
    pub fn is_degraded(&self) -> bool {
        self.state == BootState::Degraded
    }
}

fn execution_plan(sequence: &BootSequence) -> ExecutionPlan<BootCtx> {
    let mut stages: Vec<Stage<BoxedTask<BootCtx>>> = vec![
        Stage::new("export", vec![Box::new(ExportTask)]),
        Stage::new("attach", vec![Box::new(AttachTask)]),
        Stage::new(
            "volume",
            vec![Box::new(PartitionTask), Box::new(FilesystemTask)],
        ),
    ];
    if sequence.volume_group.is_some() {
        stages.push(Stage::new("volume_group", vec![Box::new(VolumeGroupTask)]));
    }
    stages.push(Stage::new(
        "mount",
        vec![Box::new(MountTask), Box::new(PermissionsTask)],
    ));

    ExecutionPlan::new(stages)
}

/// Drive `sequence` from wherever the host currently is to
/// `PermissionsApplied`.
///
/// Every step probes before it acts, so running this again on a host that
/// is already up changes nothing.
pub async fn run_boot_sequence(layers: Arc<Layers>, sequence: BootSequence) -> BootReport {
    let total_start = Instant::now();
    tracing::info!(
        image = %sequence.image.display(),
        mount_point = %sequence.mount_point.display(),
        fs_type = %sequence.fs_type,
        "Boot sequence starting"
    );

    let plan = execution_plan(&sequence);
    let ctx: BootCtx = Arc::new(Mutex::new(BootContext::new(layers, sequence)));
    let run = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), Arc::clone(&ctx)).await;

    let mut ctx = ctx.lock().await;
    let total_duration_ms = total_start.elapsed().as_millis();
    let (state, error) = match run.result {
        Ok(()) => (ctx.state, None),
        Err(e) => (BootState::Degraded, Some(e)),
    };

    let report = BootReport {
        state,
        reached: ctx.state,
        failed_task: error.as_ref().and_then(|_| ctx.current_task.take()),
        error,
        endpoint: ctx.endpoint.take(),
        device: ctx.device.take().map(|d| d.device),
        volume: ctx.volume.take(),
        metrics: run.metrics,
        total_duration_ms,
    };

    match &report.error {
        None => tracing::info!(
            state = %report.state,
            device = ?report.device,
            duration_ms = total_duration_ms,
            "Boot sequence complete"
        ),
        Some(e) => tracing::error!(
            state = %report.state,
            reached = %report.reached,
            task = report.failed_task.as_deref().unwrap_or("unknown"),
            fail_closed = e.is_fail_closed(),
            error = %e,
            "Boot sequence degraded"
        ),
    }
    report
}

/// Undo a boot run: unmount every mount of the attached device, release the
/// device and stop the export.
///
/// Safe to run when nothing is up. A mount at the target that does not come
/// from the image is left alone.
pub fn teardown(layers: &Layers, sequence: &BootSequence) -> DiskResult<()> {
    let image = match DiskImage::open(&sequence.image) {
        Ok(image) => image,
        Err(e) => {
            tracing::debug!(image = %sequence.image.display(), error = %e, "Nothing to tear down");
            return Ok(());
        }
    };
    let endpoint = Endpoint::for_image(&image, layers.exporter.sessions().run_dir());
    let device = layers
        .exporter
        .sessions()
        .load(&endpoint)?
        .and_then(|session| session.device);

    if let Some(device) = &device {
        unmount_device(layers, device)?;
        layers.exporter.detach(device)?;
    } else if let Some(mount) = layers.mounts.table()?.find_target(&sequence.mount_point) {
        tracing::warn!(
            target = %sequence.mount_point.display(),
            source = %mount.source,
            "Mount point holds a volume this image does not provide, leaving it"
        );
    }

    layers.exporter.stop_export(&image.path)?;
    tracing::info!(image = %image.path.display(), "Teardown complete");
    Ok(())
}

fn unmount_device(layers: &Layers, device: &Path) -> DiskResult<()> {
    let table = layers.mounts.table()?;
    // Innermost first
    for entry in table.mounts_of(device).into_iter().rev() {
        layers.mounts.ensure_unmounted(&entry.target)?;
    }
    Ok(())
}
