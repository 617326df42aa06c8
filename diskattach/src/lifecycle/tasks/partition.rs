//! Task: make sure the device carries exactly one data partition.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, must_run_first, task_start};
use crate::lifecycle::BootState;
use crate::pipeline::PipelineTask;

pub struct PartitionTask;

#[async_trait]
impl PipelineTask<BootCtx> for PartitionTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, _) = task_start(&ctx, task_name).await;

        let device = {
            let ctx = ctx.lock().await;
            ctx.device
                .as_ref()
                .map(|d| d.device.clone())
                .ok_or_else(|| must_run_first("attach"))?
        };

        let partition = blocking(move || layers.volumes.ensure_partitioned(&device))
            .await
            .inspect_err(|e| log_task_error(task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.partition = Some(partition);
        ctx.advance(BootState::Partitioned);
        Ok(())
    }

    fn name(&self) -> &str {
        "partition"
    }
}
