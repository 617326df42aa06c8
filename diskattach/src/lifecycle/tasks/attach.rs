//! Task: bind the export to a kernel NBD device.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, must_run_first, task_start};
use crate::lifecycle::BootState;
use crate::pipeline::PipelineTask;

pub struct AttachTask;

#[async_trait]
impl PipelineTask<BootCtx> for AttachTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, _) = task_start(&ctx, task_name).await;

        let endpoint = {
            let ctx = ctx.lock().await;
            ctx.endpoint.clone().ok_or_else(|| must_run_first("export"))?
        };

        let attached = blocking(move || layers.exporter.attach(&endpoint))
            .await
            .inspect_err(|e| log_task_error(task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.device = Some(attached);
        ctx.advance(BootState::Attached);
        Ok(())
    }

    fn name(&self) -> &str {
        "attach"
    }
}
