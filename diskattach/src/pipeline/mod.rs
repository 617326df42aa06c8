//! Table-driven staged execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs stages in order, stopping at the first failure
//! - Stage: a named group of tasks, run one after another
//! - Task: atomic unit of work sharing a context
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::new("export", vec![Box::new(ExportTask)]),
//!     Stage::new("attach", vec![Box::new(AttachTask)]),
//! ]);
//!
//! let ctx = Arc::new(Mutex::new(Context::default()));
//! let run = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), ctx).await;
//! run.result?;
//! println!("pipeline took {}ms", run.metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor, PipelineRun};
pub use stage::{BoxedTask, PipelineTask, Stage};
