//! Boot sequence tasks, one per state transition.

mod attach;
mod export;
mod filesystem;
mod mount;
mod partition;
mod permissions;
mod volume_group;

use std::path::PathBuf;
use std::sync::Arc;

use diskattach_shared::errors::{DiskError, DiskResult};
use tokio::sync::Mutex;

pub use attach::AttachTask;
pub use export::ExportTask;
pub use filesystem::FilesystemTask;
pub use mount::MountTask;
pub use partition::PartitionTask;
pub use permissions::PermissionsTask;
pub use volume_group::VolumeGroupTask;

use super::{BootSequence, BootState, Layers};
use crate::export::{AttachedDevice, Endpoint};
use crate::mount::MountOutcome;
use crate::volume::Volume;

/// Shared state threaded through the boot pipeline.
pub struct BootContext {
    pub layers: Arc<Layers>,
    pub sequence: BootSequence,
    pub state: BootState,
    /// Task currently running, reported when the run degrades.
    pub current_task: Option<String>,
    pub endpoint: Option<Endpoint>,
    pub device: Option<AttachedDevice>,
    pub partition: Option<PathBuf>,
    pub volume: Option<Volume>,
    pub mount_outcome: Option<MountOutcome>,
}

impl BootContext {
    pub fn new(layers: Arc<Layers>, sequence: BootSequence) -> Self {
        Self {
            layers,
            sequence,
            state: BootState::NotExported,
            current_task: None,
            endpoint: None,
            device: None,
            partition: None,
            volume: None,
            mount_outcome: None,
        }
    }

    pub fn advance(&mut self, next: BootState) {
        tracing::debug!(from = %self.state, to = %next, "Boot state transition");
        self.state = next;
    }
}

pub type BootCtx = Arc<Mutex<BootContext>>;

/// Mark `task_name` as running and hand back what every task needs.
async fn task_start(ctx: &BootCtx, task_name: &str) -> (Arc<Layers>, BootSequence) {
    let mut ctx = ctx.lock().await;
    ctx.current_task = Some(task_name.to_string());
    tracing::debug!(
        task = task_name,
        state = %ctx.state,
        image = %ctx.sequence.image.display(),
        "Task starting"
    );
    (Arc::clone(&ctx.layers), ctx.sequence.clone())
}

fn log_task_error(task_name: &str, err: &DiskError) {
    tracing::error!(task = task_name, error = %err, "Task failed");
}

/// Run a layer operation off the async executor. The layers shell out and
/// poll sysfs, all of which blocks.
async fn blocking<T, F>(f: F) -> DiskResult<T>
where
    F: FnOnce() -> DiskResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DiskError::Internal(format!("Blocking task panicked: {}", e)))?
}

fn must_run_first(task: &str) -> DiskError {
    DiskError::Internal(format!("{} task must run first", task))
}
