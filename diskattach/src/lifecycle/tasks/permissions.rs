//! Task: hand the mounted volume to its owner.
//!
//! Runs the full recursive pass after a fresh mount, or when the mount root
//! has drifted from the wanted owner and mode. Otherwise nothing is touched.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, must_run_first, task_start};
use crate::lifecycle::BootState;
use crate::mount::MountOutcome;
use crate::pipeline::PipelineTask;

pub struct PermissionsTask;

#[async_trait]
impl PipelineTask<BootCtx> for PermissionsTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, sequence) = task_start(&ctx, task_name).await;

        let outcome = {
            let ctx = ctx.lock().await;
            ctx.mount_outcome.ok_or_else(|| must_run_first("mount"))?
        };

        blocking(move || {
            let target = layers.mount_target(&sequence);
            if outcome == MountOutcome::AlreadyMounted && layers.mounts.permissions_current(&target)? {
                tracing::debug!(target = %target.path.display(), "Permissions already in place");
                return Ok(());
            }
            layers.mounts.apply_permissions(&target)
        })
        .await
        .inspect_err(|e| log_task_error(task_name, e))?;

        ctx.lock().await.advance(BootState::PermissionsApplied);
        Ok(())
    }

    fn name(&self) -> &str {
        "permissions"
    }
}
