//! Task: mount the volume, located by UUID.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, must_run_first, task_start};
use crate::lifecycle::BootState;
use crate::pipeline::PipelineTask;

pub struct MountTask;

#[async_trait]
impl PipelineTask<BootCtx> for MountTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, sequence) = task_start(&ctx, task_name).await;

        let uuid = {
            let ctx = ctx.lock().await;
            ctx.volume
                .as_ref()
                .map(|v| v.uuid.clone())
                .ok_or_else(|| must_run_first("filesystem"))?
        };

        let outcome = blocking(move || {
            let target = layers.mount_target(&sequence);
            layers.mounts.mount_volume(&uuid, &target)
        })
        .await
        .inspect_err(|e| log_task_error(task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.mount_outcome = Some(outcome);
        ctx.advance(BootState::Mounted);
        Ok(())
    }

    fn name(&self) -> &str {
        "mount"
    }
}
