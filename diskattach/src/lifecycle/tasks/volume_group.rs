//! Task: activate the configured volume group.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, task_start};
use crate::pipeline::PipelineTask;

pub struct VolumeGroupTask;

#[async_trait]
impl PipelineTask<BootCtx> for VolumeGroupTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, sequence) = task_start(&ctx, task_name).await;

        let Some(vg) = sequence.volume_group else {
            return Ok(());
        };

        blocking(move || layers.volumes.activate_volume_group(&vg))
            .await
            .inspect_err(|e| log_task_error(task_name, e))
    }

    fn name(&self) -> &str {
        "volume_group"
    }
}
