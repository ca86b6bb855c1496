//! Units of work in a batch and their outcomes.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::core::{Pipeline, RunSummary};
use crate::error::{Error, ErrorKind, Result};

/// Result of one batch task, as recorded and sent between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
}

impl TaskOutcome {
    pub fn from_result(result: &Result<RunSummary>) -> Self {
        match result {
            Ok(_) => TaskOutcome::Completed,
            Err(e) => TaskOutcome::failed(e),
        }
    }

    pub fn failed(error: &Error) -> Self {
        TaskOutcome::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    /// `Completed` or `Error: <Kind>, <message>`.
    pub fn describe(&self) -> String {
        match self {
            TaskOutcome::Completed => "Completed".to_string(),
            TaskOutcome::Failed { kind, message } => format!("Error: {}, {}", kind, message),
        }
    }
}

/// Serializable description of a pipeline, enough for a worker process to
/// rebuild and run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Pipeline kind
    pub kind: String,
    pub label: String,
    /// Pipeline input mapping
    pub input: Value,
    /// Constructor arguments of the pipeline
    #[serde(default)]
    pub args: Value,
}

/// Anything a batch can run: a labelled unit whose run never fails the
/// batch.
pub trait BatchTask: Send + 'static {
    fn task_label(&self) -> &str;

    fn relabel(&mut self, label: String);

    /// Replace the input mapping.
    fn load_input(&mut self, input: Value) -> Result<()>;

    /// Run to completion, turning errors into a failed outcome.
    fn run_task(&mut self) -> TaskOutcome;

    /// Descriptor for out-of-process execution, if supported.
    fn descriptor(&self) -> Option<TaskDescriptor>;
}

impl<P: Pipeline> BatchTask for P {
    fn task_label(&self) -> &str {
        self.label()
    }

    fn relabel(&mut self, label: String) {
        self.set_label(label);
    }

    fn load_input(&mut self, input: Value) -> Result<()> {
        self.set_input(input).map(|_| ())
    }

    fn run_task(&mut self) -> TaskOutcome {
        let result = self.run();
        if let Err(e) = &result {
            tracing::error!("Pipeline {} failed: {}", self.label(), e);
        }
        TaskOutcome::from_result(&result)
    }

    fn descriptor(&self) -> Option<TaskDescriptor> {
        let args = self.constructor_args()?;
        Some(TaskDescriptor {
            kind: P::NAME.to_string(),
            label: self.label().to_string(),
            input: Value::Object(self.input().clone()),
            args,
        })
    }
}

/// Run a task, recording a panic as a failure.
pub fn run_isolated(task: &mut dyn BatchTask) -> TaskOutcome {
    match catch_unwind(AssertUnwindSafe(|| task.run_task())) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            tracing::error!("Task {} panicked: {}", task.task_label(), message);
            TaskOutcome::Failed {
                kind: ErrorKind::Panic,
                message,
            }
        }
    }
}

/// Object form of constructor arguments, for pipeline builders.
pub fn args_object(args: &Value) -> Result<Map<String, Value>> {
    match args {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(Error::Config(format!(
            "constructor arguments must be an object, got: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Panicking;

    impl BatchTask for Panicking {
        fn task_label(&self) -> &str {
            "panicking"
        }

        fn relabel(&mut self, _label: String) {}

        fn load_input(&mut self, _input: Value) -> Result<()> {
            Ok(())
        }

        fn run_task(&mut self) -> TaskOutcome {
            panic!("boom")
        }

        fn descriptor(&self) -> Option<TaskDescriptor> {
            None
        }
    }

    #[test]
    fn test_outcome_wire_format() {
        let failed = TaskOutcome::Failed {
            kind: ErrorKind::NotFound,
            message: "missing".into(),
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(
            value,
            json!({"status": "failed", "kind": "not_found", "message": "missing"})
        );
        let back: TaskOutcome =
            serde_json::from_value(json!({"status": "completed"})).unwrap();
        assert_eq!(back, TaskOutcome::Completed);
    }

    #[test]
    fn test_describe() {
        assert_eq!(TaskOutcome::Completed.describe(), "Completed");
        let outcome = TaskOutcome::failed(&Error::InvalidInput("bad".into()));
        assert_eq!(outcome.describe(), "Error: InvalidInputError, invalid input: bad");
    }

    #[test]
    fn test_panic_is_captured() {
        let outcome = run_isolated(&mut Panicking);
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                kind: ErrorKind::Panic,
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_args_object() {
        assert!(args_object(&Value::Null).unwrap().is_empty());
        assert!(args_object(&json!([1])).is_err());
    }
}
