//! Task: make sure the data partition carries the requested filesystem.
//!
//! A different filesystem already on the partition ends the run; it is
//! never reformatted.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

use super::{BootCtx, blocking, log_task_error, must_run_first, task_start};
use crate::lifecycle::BootState;
use crate::pipeline::PipelineTask;
use crate::volume::Volume;

pub struct FilesystemTask;

#[async_trait]
impl PipelineTask<BootCtx> for FilesystemTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> DiskResult<()> {
        let task_name = self.name();
        let (layers, sequence) = task_start(&ctx, task_name).await;

        let partition = {
            let ctx = ctx.lock().await;
            ctx.partition.clone().ok_or_else(|| must_run_first("partition"))?
        };

        let fs_type = sequence.fs_type;
        let volume = blocking(move || {
            let uuid = layers.volumes.ensure_filesystem(&partition, fs_type)?;
            Ok(Volume {
                partition,
                fs_type,
                uuid,
            })
        })
        .await
        .inspect_err(|e| log_task_error(task_name, e))?;

        tracing::debug!(
            partition = %volume.partition.display(),
            uuid = %volume.uuid,
            "Filesystem ready"
        );

        let mut ctx = ctx.lock().await;
        ctx.volume = Some(volume);
        ctx.advance(BootState::FilesystemReady);
        Ok(())
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
