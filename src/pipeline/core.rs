//! Sequential task pipeline driven by a declarative input mapping.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::subscriber::DefaultGuard;

use super::logger::{LogConfigArgs, RunLog};
use super::registry::TaskRegistry;
use crate::error::{Error, Result};
use crate::io::fs::get_args_from_configfile;

/// Name of the implicit task that configures the run log.
pub const LOG_CONFIG: &str = "log_config";

/// Source of a pipeline input mapping.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// An in-memory JSON object.
    Dict(Value),
    /// Path to a `.json` file holding the object.
    File(PathBuf),
}

/// Tasks executed by a run, and input entries that no task consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub executed: Vec<String>,
    pub unused: Vec<String>,
}

/// State shared by every pipeline: label, task sequence, input and the
/// log of the active run.
#[derive(Debug)]
pub struct PipelineCore {
    label: String,
    pipeline: Vec<String>,
    input: Map<String, Value>,
    log: Option<RunLog>,
}

impl PipelineCore {
    pub fn new(sequence: &[&str]) -> Self {
        Self {
            label: "pipeline".to_string(),
            pipeline: sequence.iter().map(|s| s.to_string()).collect(),
            input: Map::new(),
            log: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pipeline(&self) -> &[String] {
        &self.pipeline
    }

    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    /// Log of the run in progress, if any.
    pub fn log_mut(&mut self) -> Option<&mut RunLog> {
        self.log.as_mut()
    }

    /// Start logging the current run to a file in `directory`.
    ///
    /// Does nothing outside of a run.
    pub fn start_log_to_file(&mut self, directory: &Path) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.start_log_to_file(directory)?;
        }
        Ok(())
    }
}

/// A pipeline: a fixed set of named tasks run in a declared order with
/// arguments taken from the input mapping.
///
/// Implementors expose their [`PipelineCore`] and a static registry of
/// their tasks; everything else is provided.
pub trait Pipeline: Sized + Send + 'static {
    /// Name used in configuration error messages.
    const NAME: &'static str;

    fn core(&self) -> &PipelineCore;

    fn core_mut(&mut self) -> &mut PipelineCore;

    /// Tasks this pipeline type understands.
    fn registry() -> &'static TaskRegistry<Self>;

    /// Expand the declared sequence into the phases actually run.
    fn phases(sequence: Vec<String>) -> Vec<String> {
        sequence
    }

    /// Arguments that rebuild this pipeline in a worker process, for
    /// pipeline kinds that workers know how to construct.
    fn constructor_args(&self) -> Option<Value> {
        None
    }

    fn label(&self) -> &str {
        self.core().label()
    }

    fn set_label(&mut self, label: impl Into<String>) -> &mut Self {
        self.core_mut().label = label.into();
        self
    }

    /// Declared task sequence.
    fn pipeline(&self) -> &[String] {
        self.core().pipeline()
    }

    /// Replace the declared task sequence. Every name must be a task of
    /// this pipeline.
    fn set_pipeline<S: AsRef<str>>(&mut self, sequence: &[S]) -> Result<&mut Self> {
        Self::registry().check_names(sequence, Self::NAME)?;
        self.core_mut().pipeline = sequence.iter().map(|s| s.as_ref().to_string()).collect();
        Ok(self)
    }

    fn input(&self) -> &Map<String, Value> {
        self.core().input()
    }

    /// Replace the input mapping. Only JSON objects are accepted.
    fn set_input(&mut self, input: Value) -> Result<&mut Self> {
        match input {
            Value::Object(map) => {
                self.core_mut().input = map;
                Ok(self)
            }
            other => Err(Error::Config(format!(
                "A dictionary is expected as pipeline input, got: {}",
                other
            ))),
        }
    }

    /// Set the input from a mapping or a JSON configuration file.
    fn config(&mut self, source: ConfigSource) -> Result<&mut Self> {
        let input = match source {
            ConfigSource::Dict(value) => value,
            ConfigSource::File(path) => get_args_from_configfile(&path)?,
        };
        self.set_input(input)
    }

    /// Run the declared sequence.
    fn run(&mut self) -> Result<RunSummary> {
        self.run_sequence(None::<&[String]>)
    }

    /// Run `sequence` instead of the declared one, if given.
    ///
    /// Tasks run in sequence order, each only if the input has an entry for
    /// it. The first failing task aborts the run. Input entries left over
    /// afterwards are reported, not treated as errors.
    fn run_sequence<S: AsRef<str>>(&mut self, sequence: Option<&[S]>) -> Result<RunSummary> {
        let declared = match sequence {
            Some(names) => {
                Self::registry().check_names(names, Self::NAME)?;
                names.iter().map(|s| s.as_ref().to_string()).collect()
            }
            None => self.pipeline().to_vec(),
        };
        let mut sequence = vec![LOG_CONFIG.to_string()];
        sequence.extend(Self::phases(declared));

        let (log, guard) = RunLog::install(self.label());
        self.core_mut().log = Some(log);
        let mut run = ActiveRun {
            pipeline: self,
            _guard: guard,
        };
        execute(&mut *run.pipeline, &sequence)
    }
}

/// Pipeline with a run log installed. Dropping it, also while unwinding
/// from a panicking task, closes the log before the subscriber guard.
struct ActiveRun<'a, P: Pipeline> {
    pipeline: &'a mut P,
    _guard: DefaultGuard,
}

impl<P: Pipeline> Drop for ActiveRun<'_, P> {
    fn drop(&mut self) {
        if let Some(log) = self.pipeline.core_mut().log.take() {
            log.terminate();
        }
    }
}

fn execute<P: Pipeline>(pipeline: &mut P, sequence: &[String]) -> Result<RunSummary> {
    let registry = P::registry();
    let mut input = pipeline.input().clone();
    let mut summary = RunSummary::default();

    for name in sequence {
        let Some(args) = input.remove(name) else {
            continue;
        };
        tracing::debug!("Running task {} of {}", name, pipeline.label());
        registry.call(pipeline, name, args)?;
        summary.executed.push(name.clone());
    }

    if !input.is_empty() {
        summary.unused = input.keys().cloned().collect();
        tracing::warn!(
            "Some of the attributes in input have not been used: {}",
            summary.unused.join(", ")
        );
    }
    Ok(summary)
}

/// Start a registry for a pipeline type, with the implicit `log_config`
/// task already registered.
pub fn base_registry<P: Pipeline>() -> TaskRegistry<P> {
    TaskRegistry::new().register(LOG_CONFIG, |p: &mut P, args: LogConfigArgs| {
        match p.core_mut().log_mut() {
            Some(log) => log.config(args),
            None => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registry::NoArgs;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PushArgs {
        value: i64,
    }

    #[derive(Debug)]
    struct Recorder {
        core: PipelineCore,
        calls: Vec<String>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                core: PipelineCore::new(&["foo", "bar", "fail"]),
                calls: Vec::new(),
            }
        }
    }

    impl Pipeline for Recorder {
        const NAME: &'static str = "Recorder";

        fn core(&self) -> &PipelineCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PipelineCore {
            &mut self.core
        }

        fn registry() -> &'static TaskRegistry<Self> {
            static REGISTRY: OnceLock<TaskRegistry<Recorder>> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                base_registry::<Recorder>()
                    .register("foo", |p: &mut Recorder, a: PushArgs| {
                        p.calls.push(format!("foo:{}", a.value));
                        Ok(())
                    })
                    .register("bar", |p: &mut Recorder, a: PushArgs| {
                        p.calls.push(format!("bar:{}", a.value));
                        Ok(())
                    })
                    .register("fail", |_: &mut Recorder, _: NoArgs| {
                        Err(Error::task("fail", "boom"))
                    })
                    .register("explode", |_: &mut Recorder, _: NoArgs| -> Result<()> {
                        panic!("exploded")
                    })
                    .register("log_here", |p: &mut Recorder, a: PathArgs| {
                        p.core_mut().start_log_to_file(&a.dir)?;
                        tracing::info!("logged by {}", p.label());
                        Ok(())
                    })
            })
        }
    }

    #[derive(Deserialize)]
    struct PathArgs {
        dir: PathBuf,
    }

    #[test]
    fn test_run_follows_declared_order() {
        let mut p = Recorder::new();
        p.set_input(json!({"bar": {"value": 2}, "foo": [1]})).unwrap();
        let summary = p.run().unwrap();
        assert_eq!(p.calls, vec!["foo:1", "bar:2"]);
        assert_eq!(summary.executed, vec!["foo", "bar"]);
        assert!(summary.unused.is_empty());
    }

    #[test]
    fn test_run_reports_unused_input() {
        let mut p = Recorder::new();
        p.set_pipeline(&["foo"]).unwrap();
        p.set_input(json!({"foo": 1, "bar": 2})).unwrap();
        let summary = p.run().unwrap();
        assert_eq!(p.calls, vec!["foo:1"]);
        assert_eq!(summary.unused, vec!["bar"]);
        // input is not drained by a run
        assert_eq!(p.input().len(), 2);
    }

    #[test]
    fn test_run_with_override_sequence() {
        let mut p = Recorder::new();
        p.set_input(json!({"foo": 1, "bar": 2})).unwrap();
        p.run_sequence(Some(&["bar"][..])).unwrap();
        assert_eq!(p.calls, vec!["bar:2"]);
        assert!(p.run_sequence(Some(&["nope"][..])).is_err());
    }

    #[test]
    fn test_failing_task_propagates() {
        let mut p = Recorder::new();
        p.set_input(json!({"foo": 1, "fail": {}, "bar": 2})).unwrap();
        let err = p.run().unwrap_err();
        assert_eq!(err.to_string(), "fail failed: boom");
        assert_eq!(p.calls, vec!["foo:1"]);
        // run log is released on the error path
        assert!(p.core_mut().log_mut().is_none());
    }

    #[test]
    fn test_bad_arguments_are_config_errors() {
        let mut p = Recorder::new();
        p.set_input(json!({"foo": {"valu": 1}})).unwrap();
        assert!(matches!(p.run().unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_set_pipeline_rejects_unknown_task() {
        let mut p = Recorder::new();
        let err = p.set_pipeline(&["foo", "baz"]).unwrap_err();
        assert!(err.to_string().contains("baz"));
        assert_eq!(p.pipeline(), &["foo", "bar", "fail"]);
    }

    #[test]
    fn test_set_input_requires_object() {
        let mut p = Recorder::new();
        assert!(p.set_input(json!([1, 2])).is_err());
        assert!(p.config(ConfigSource::Dict(json!("foo"))).is_err());
    }

    #[test]
    fn test_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, r#"{"foo": {"value": 7}}"#).unwrap();

        let mut p = Recorder::new();
        p.config(ConfigSource::File(path)).unwrap();
        p.run().unwrap();
        assert_eq!(p.calls, vec!["foo:7"]);

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            p.config(ConfigSource::File(missing)).unwrap_err(),
            Error::NotFound(_)
        ));
        let yaml = dir.path().join("input.yaml");
        std::fs::write(&yaml, "foo: 1").unwrap();
        assert!(matches!(
            p.config(ConfigSource::File(yaml)).unwrap_err(),
            Error::NotImplemented(_)
        ));
    }

    #[test]
    fn test_log_config_and_file_log() {
        let dir = TempDir::new().unwrap();
        let mut p = Recorder::new();
        p.set_label("recorder_run");
        p.set_pipeline(&["log_here"]).unwrap();
        p.set_input(json!({
            "log_config": {"level": "debug"},
            "log_here": {"dir": dir.path()},
        }))
        .unwrap();
        let summary = p.run().unwrap();
        assert_eq!(summary.executed, vec!["log_config", "log_here"]);

        let content = std::fs::read_to_string(dir.path().join("recorder_run.log")).unwrap();
        assert!(content.contains("logged by recorder_run"));
    }

    #[test]
    fn test_panicking_task_closes_run_log() {
        let dir = TempDir::new().unwrap();
        let mut p = Recorder::new();
        p.set_label("exploding_run");
        p.set_pipeline(&["log_here", "explode"]).unwrap();
        p.set_input(json!({"log_here": {"dir": dir.path()}, "explode": {}}))
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| p.run()));
        assert!(result.is_err());
        assert!(p.core_mut().log_mut().is_none());
        let content = std::fs::read_to_string(dir.path().join("exploding_run.log")).unwrap();
        assert!(content.contains("logged by exploding_run"));
    }
}
