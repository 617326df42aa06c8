//! Task: serve the image on its local endpoint.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, task_start};
use crate::lifecycle::BootState;
use crate::pipeline::PipelineTask;

pub struct ExportTask;

#[async_trait]
impl PipelineTask<BootCtx> for ExportTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, sequence) = task_start(&ctx, task_name).await;

        let endpoint = blocking(move || layers.exporter.ensure_exported(&sequence.image))
            .await
            .inspect_err(|e| log_task_error(task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.endpoint = Some(endpoint);
        ctx.advance(BootState::Exported);
        Ok(())
    }

    fn name(&self) -> &str {
        "export"
    }
}
