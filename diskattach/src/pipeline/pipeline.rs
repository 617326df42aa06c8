//! Staged pipeline executor.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{BoxedTask, Stage};
use diskattach_shared::errors::DiskResult;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// Result of a pipeline run. Metrics cover every stage that finished,
/// including on failure.
#[derive(Debug)]
pub struct PipelineRun {
    pub metrics: PipelineMetrics,
    pub result: DiskResult<()>,
}

/// Pipeline executor.
///
/// Stages run strictly in order; the first failing task aborts the
/// pipeline and its error is returned unchanged. Tasks record their own
/// progress in the context, so the caller can tell how far it got.
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> PipelineRun
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let stage_start = Instant::now();
            tracing::debug!(stage = stage.name, index, "Stage starting");

            let mut task_metrics = Vec::new();
            for task in stage.tasks {
                let name = task.name().to_string();
                let task_start = Instant::now();
                if let Err(e) = task.run(ctx.clone()).await {
                    tracing::debug!(stage = stage.name, task = %name, "Stage aborted");
                    return PipelineRun {
                        metrics: PipelineMetrics {
                            total_duration_ms: total_start.elapsed().as_millis(),
                            stages: stage_metrics,
                        },
                        result: Err(e),
                    };
                }
                task_metrics.push(TaskMetrics {
                    name,
                    duration_ms: task_start.elapsed().as_millis(),
                });
            }

            let duration_ms = stage_start.elapsed().as_millis();
            tracing::debug!(stage = stage.name, duration_ms, "Stage complete");
            stage_metrics.push(StageMetrics {
                index,
                name: stage.name,
                duration_ms,
                tasks: task_metrics,
            });
        }

        PipelineRun {
            metrics: PipelineMetrics {
                total_duration_ms: total_start.elapsed().as_millis(),
                stages: stage_metrics,
            },
            result: Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use diskattach_shared::errors::DiskError;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Record(&'static str);
    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> DiskResult<()> {
            ctx.lock().await.push(self.0);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> DiskResult<()> {
            Err(DiskError::MountFailed("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let plan: ExecutionPlan<Log> = ExecutionPlan::new(vec![
            Stage::new("one", vec![Box::new(Record("a")), Box::new(Record("b"))]),
            Stage::new("two", vec![Box::new(Record("c"))]),
        ]);
        assert_eq!(plan.stage_names(), vec!["one", "two"]);

        let log = Log::default();
        let run = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone()).await;
        run.result.unwrap();

        assert_eq!(*log.lock().await, vec!["a", "b", "c"]);
        assert_eq!(run.metrics.completed_stages(), vec!["one", "two"]);
        assert!(run.metrics.task_duration_ms("c").is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let plan: ExecutionPlan<Log> = ExecutionPlan::new(vec![
            Stage::new("one", vec![Box::new(Record("a"))]),
            Stage::new("two", vec![Box::new(Fail)]),
            Stage::new("three", vec![Box::new(Record("never"))]),
        ]);

        let log = Log::default();
        let run = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone()).await;

        assert!(matches!(run.result, Err(DiskError::MountFailed(_))));
        assert_eq!(*log.lock().await, vec!["a"]);
        assert_eq!(run.metrics.completed_stages(), vec!["one"]);
    }
}
