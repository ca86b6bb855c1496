//! Batch of independent pipelines run in parallel by an [`Executor`].

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use super::batch::{BatchTask, TaskOutcome};
use super::cluster::{ClusterConfig, Executor};
use crate::error::{Error, Result};

/// Labels for the tasks of a batch.
#[derive(Debug, Clone)]
pub enum Labels {
    /// One label for every task
    Shared(String),
    /// One label per task, in task order
    PerTask(Vec<String>),
}

/// Statistics from a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl BatchStats {
    fn from_outcomes(outcomes: &[TaskOutcome]) -> Self {
        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        Self {
            completed: outcomes.len() - failed,
            failed,
            total: outcomes.len(),
        }
    }
}

/// Collection of pipelines run as one batch.
///
/// Each task runs independently: a failure is recorded in its outcome and
/// never stops the others. Outcomes are index-aligned with the tasks.
#[derive(Default)]
pub struct MacroPipeline {
    tasks: Vec<Box<dyn BatchTask>>,
    outcomes: Vec<Option<TaskOutcome>>,
    executor: Option<Executor>,
}

impl MacroPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[Box<dyn BatchTask>] {
        &self.tasks
    }

    /// Replace the tasks; recorded outcomes are reset.
    pub fn set_tasks(&mut self, tasks: Vec<Box<dyn BatchTask>>) -> &mut Self {
        self.outcomes = vec![None; tasks.len()];
        self.tasks = tasks;
        self
    }

    pub fn add_task(&mut self, task: impl BatchTask) -> &mut Self {
        self.tasks.push(Box::new(task));
        self.outcomes.push(None);
        self
    }

    /// Label the tasks with one shared label or one label each.
    pub fn set_labels(&mut self, labels: Labels) -> Result<&mut Self> {
        match labels {
            Labels::Shared(label) => {
                for task in self.tasks.iter_mut() {
                    task.relabel(label.clone());
                }
            }
            Labels::PerTask(labels) => {
                if labels.len() != self.tasks.len() {
                    return Err(Error::Config(format!(
                        "Got {} labels for {} tasks",
                        labels.len(),
                        self.tasks.len()
                    )));
                }
                for (task, label) in self.tasks.iter_mut().zip(labels) {
                    task.relabel(label);
                }
            }
        }
        Ok(self)
    }

    /// Start the executor the tasks are run on.
    pub fn setup_cluster(&mut self, config: &ClusterConfig) -> Result<&mut Self> {
        self.check_no_executor()?;
        self.setup_executor(Executor::start(config)?)
    }

    /// Run the tasks on an executor that is already running, e.g. one
    /// handed over by [`MacroPipeline::release_executor`] of another batch.
    pub fn setup_executor(&mut self, executor: Executor) -> Result<&mut Self> {
        self.check_no_executor()?;
        tracing::info!("Using running {} executor", executor.mode());
        self.executor = Some(executor);
        Ok(self)
    }

    /// Detach the executor without stopping it.
    pub fn release_executor(&mut self) -> Option<Executor> {
        self.executor.take()
    }

    fn check_no_executor(&self) -> Result<()> {
        if self.executor.is_some() {
            return Err(Error::Executor(
                "Client is already set - call shutdown first!".to_string(),
            ));
        }
        Ok(())
    }

    pub fn executor(&self) -> Option<&Executor> {
        self.executor.as_ref()
    }

    /// Run all tasks and wait for every one of them to finish.
    pub fn run(&mut self) -> Result<BatchStats> {
        let executor = self.executor.as_ref().ok_or_else(|| {
            Error::Executor("Client is not set - call setup_cluster first!".to_string())
        })?;

        tracing::info!(
            "Submitting {} tasks to the {} executor",
            self.tasks.len(),
            executor.mode()
        );
        let outcomes = executor.run(&mut self.tasks)?;
        let stats = BatchStats::from_outcomes(&outcomes);
        self.outcomes = outcomes.into_iter().map(Some).collect();

        tracing::info!(
            "Batch finished: {} completed, {} failed, {} total",
            stats.completed,
            stats.failed,
            stats.total
        );
        Ok(stats)
    }

    /// Outcome of each task; `None` for tasks that have not run.
    pub fn outcomes(&self) -> &[Option<TaskOutcome>] {
        &self.outcomes
    }

    /// Write one line per task with its index, label and outcome.
    pub fn write_outcome<W: Write>(&self, mut writer: W) -> Result<()> {
        for (index, (task, outcome)) in self.tasks.iter().zip(&self.outcomes).enumerate() {
            let status = outcome
                .as_ref()
                .map(TaskOutcome::describe)
                .unwrap_or_else(|| "Not run".to_string());
            writeln!(writer, "{:03} {:30} {}", index + 1, task.task_label(), status)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Print the outcome table to stdout, or to `to_file` if given.
    pub fn print_outcome(&self, to_file: Option<&Path>) -> Result<()> {
        match to_file {
            Some(path) => self.write_outcome(File::create(path)?),
            None => self.write_outcome(io::stdout().lock()),
        }
    }

    /// Tasks whose last run failed.
    pub fn get_failed_pipelines(&self) -> Vec<&dyn BatchTask> {
        self.tasks
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, outcome)| outcome.as_ref().is_some_and(TaskOutcome::is_failure))
            .map(|(task, _)| task.as_ref())
            .collect()
    }

    /// Stop the executor.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.executor.take() {
            Some(executor) => {
                executor.shutdown();
                Ok(())
            }
            None => Err(Error::Executor(
                "Client is not set - call setup_cluster first!".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::core::{base_registry, Pipeline, PipelineCore};
    use crate::pipeline::registry::{NoArgs, TaskRegistry};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct NapArgs {
        millis: u64,
    }

    struct Napper {
        core: PipelineCore,
    }

    impl Napper {
        fn new(input: serde_json::Value) -> Self {
            let mut napper = Self {
                core: PipelineCore::new(&["nap", "fail", "panic"]),
            };
            napper.set_input(input).unwrap();
            napper
        }
    }

    impl Pipeline for Napper {
        const NAME: &'static str = "Napper";

        fn core(&self) -> &PipelineCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PipelineCore {
            &mut self.core
        }

        fn registry() -> &'static TaskRegistry<Self> {
            static REGISTRY: OnceLock<TaskRegistry<Napper>> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                base_registry::<Napper>()
                    .register("nap", |_: &mut Napper, a: NapArgs| {
                        std::thread::sleep(Duration::from_millis(a.millis));
                        Ok(())
                    })
                    .register("fail", |_: &mut Napper, _: NoArgs| {
                        Err(Error::InvalidInput("bad tile".to_string()))
                    })
                    .register("panic", |_: &mut Napper, _: NoArgs| -> Result<()> {
                        panic!("lost the plot")
                    })
            })
        }
    }

    fn threads(n: usize) -> ClusterConfig {
        ClusterConfig::Threads { n_workers: Some(n) }
    }

    #[test]
    fn test_failure_does_not_abort_batch() {
        let mut batch = MacroPipeline::new();
        batch
            .add_task(Napper::new(json!({"nap": 100})))
            .add_task(Napper::new(json!({"nap": 10, "fail": {}})))
            .add_task(Napper::new(json!({"nap": 0})));
        batch
            .set_labels(Labels::PerTask(vec!["a".into(), "b".into(), "c".into()]))
            .unwrap();
        batch.setup_cluster(&threads(3)).unwrap();

        let stats = batch.run().unwrap();
        assert_eq!(
            stats,
            BatchStats {
                completed: 2,
                failed: 1,
                total: 3
            }
        );
        let outcomes = batch.outcomes();
        assert_eq!(outcomes[0], Some(TaskOutcome::Completed));
        assert!(outcomes[1].as_ref().unwrap().is_failure());
        assert_eq!(outcomes[2], Some(TaskOutcome::Completed));

        let failed = batch.get_failed_pipelines();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_label(), "b");
        batch.shutdown().unwrap();
    }

    #[test]
    fn test_panic_is_recorded() {
        let mut batch = MacroPipeline::new();
        batch
            .add_task(Napper::new(json!({"panic": {}})))
            .add_task(Napper::new(json!({"nap": 0})));
        batch.setup_cluster(&threads(2)).unwrap();
        batch.run().unwrap();
        match &batch.outcomes()[0] {
            Some(TaskOutcome::Failed { kind, message }) => {
                assert_eq!(kind.as_str(), "Panic");
                assert_eq!(message, "lost the plot");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(batch.outcomes()[1], Some(TaskOutcome::Completed));
        batch.shutdown().unwrap();
    }

    #[test]
    fn test_outcome_table() {
        let dir = TempDir::new().unwrap();
        let mut batch = MacroPipeline::new();
        batch
            .add_task(Napper::new(json!({"nap": 0})))
            .add_task(Napper::new(json!({"fail": {}})));
        batch.set_labels(Labels::Shared("tile".into())).unwrap();
        batch.setup_cluster(&threads(1)).unwrap();
        batch.run().unwrap();

        let path = dir.path().join("outcome.txt");
        batch.print_outcome(Some(&path)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("001 tile"));
        assert!(lines[0].ends_with("Completed"));
        assert!(lines[1].starts_with("002 tile"));
        assert!(lines[1].ends_with("Error: InvalidInputError, invalid input: bad tile"));
    }

    #[test]
    fn test_cluster_lifecycle_errors() {
        let mut batch = MacroPipeline::new();
        batch.add_task(Napper::new(json!({})));
        assert!(matches!(batch.run().unwrap_err(), Error::Executor(_)));
        assert!(batch.shutdown().is_err());

        batch.setup_cluster(&threads(1)).unwrap();
        let err = batch.setup_cluster(&threads(1)).err().unwrap();
        assert!(err.to_string().contains("Client is already set"));
        batch.shutdown().unwrap();
        batch.setup_cluster(&threads(1)).unwrap();
        batch.shutdown().unwrap();
    }

    #[test]
    fn test_executor_shared_between_batches() {
        let executor = Executor::start(&threads(2)).unwrap();

        let mut first = MacroPipeline::new();
        first.add_task(Napper::new(json!({"nap": 0})));
        first.setup_executor(executor).unwrap();
        first.run().unwrap();
        let executor = first.release_executor().unwrap();
        assert!(first.executor().is_none());

        let mut second = MacroPipeline::new();
        second
            .add_task(Napper::new(json!({"nap": 0})))
            .add_task(Napper::new(json!({"fail": {}})));
        second.setup_executor(executor).unwrap();
        let stats = second.run().unwrap();
        assert_eq!(stats.failed, 1);

        let spare = Executor::start(&threads(1)).unwrap();
        let err = second.setup_executor(spare).err().unwrap();
        assert!(err.to_string().contains("Client is already set"));
        second.shutdown().unwrap();
        assert_eq!(first.outcomes()[0], Some(TaskOutcome::Completed));
    }

    #[test]
    fn test_label_count_must_match() {
        let mut batch = MacroPipeline::new();
        batch
            .add_task(Napper::new(json!({})))
            .add_task(Napper::new(json!({})));
        assert!(batch.set_labels(Labels::PerTask(vec!["one".into()])).is_err());
        batch.set_tasks(vec![Box::new(Napper::new(json!({})))]);
        batch.set_labels(Labels::PerTask(vec!["one".into()])).unwrap();
        assert_eq!(batch.tasks()[0].task_label(), "one");
        assert_eq!(batch.outcomes().len(), 1);
        assert!(batch.outcomes()[0].is_none());
    }
}
