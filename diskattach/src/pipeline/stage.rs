//! Stages and the tasks they hold.

use async_trait::async_trait;
use diskattach_shared::errors::DiskResult;

/// One step of a pipeline.
///
/// A task receives its own clone of the context (typically an
/// `Arc<Mutex<..>>`) and records what it produced there. Returning an
/// error stops the pipeline.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> DiskResult<()>;

    /// Stable name, used in logs, metrics and failure reports.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;

/// A named group of tasks executed in order.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(name: &'static str, tasks: Vec<T>) -> Self {
        Self { name, tasks }
    }
}
