//! Configuration of a batch of pipelines run by the `macro` command.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::pipeline::{ClusterConfig, MacroPipeline};
use crate::tasks::PipelineKind;

/// Batch configuration: one pipeline kind, a shared input and one entry
/// per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacroConfig {
    /// Where tasks run (default: threads of this process)
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Pipeline kind of every task
    pub kind: PipelineKind,

    /// Input mapping (task name -> arguments) shared by all tasks
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Constructor arguments shared by all tasks
    #[serde(default)]
    pub args: Map<String, Value>,

    pub tasks: Vec<TaskEntry>,

    /// File the outcome table is written to, stdout if unset
    #[serde(default)]
    pub outcome_file: Option<PathBuf>,

    /// Rayon thread pool size for CPU work (null = num CPUs)
    #[serde(default)]
    pub rayon_threads: Option<usize>,
}

/// One task of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    /// Label of the task; defaults to the input file stem
    #[serde(default)]
    pub label: Option<String>,

    /// Input file or directory, relative to the input folder
    #[serde(default)]
    pub input_path: Option<PathBuf>,

    /// Tile processed by the task (data processing only)
    #[serde(default)]
    pub tile_index: Option<[u64; 2]>,

    /// Constructor arguments replacing the shared ones
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Input entries replacing the shared ones
    #[serde(default)]
    pub input: Map<String, Value>,
}

impl MacroConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: MacroConfig = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the configuration, building every task without running it.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tasks.is_empty() {
            bail!("No tasks defined in the configuration");
        }
        self.cluster.validate()?;
        if self.rayon_threads == Some(0) {
            bail!("rayon_threads must be > 0");
        }
        for (i, entry) in self.tasks.iter().enumerate() {
            if entry.tile_index.is_some() && self.kind != PipelineKind::DataProcessing {
                bail!(
                    "task {}: tile_index is only accepted by data_processing, not {}",
                    i,
                    self.kind
                );
            }
        }
        self.build_pipeline()?;
        Ok(())
    }

    /// Label of task `index`.
    pub fn task_label(&self, index: usize) -> String {
        let entry = &self.tasks[index];
        entry
            .label
            .clone()
            .or_else(|| {
                entry
                    .input_path
                    .as_ref()
                    .and_then(|p| p.file_stem())
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("{}_{}", self.kind, index))
    }

    /// Constructor arguments of task `index`.
    pub fn task_args(&self, index: usize) -> Map<String, Value> {
        let entry = &self.tasks[index];
        let mut args = self.args.clone();
        args.extend(entry.args.clone());
        if let Some(path) = &entry.input_path {
            args.insert(
                self.kind.input_arg().to_string(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }
        if let Some([ix, iy]) = entry.tile_index {
            args.insert("tile_index".to_string(), Value::from(vec![ix, iy]));
        }
        args
    }

    /// Input mapping of task `index`: the shared input with the task's
    /// entries replacing those of the same name.
    pub fn task_input(&self, index: usize) -> Map<String, Value> {
        let mut input = self.input.clone();
        input.extend(self.tasks[index].input.clone());
        input
    }

    /// Batch holding one configured pipeline per task.
    pub fn build_pipeline(&self) -> anyhow::Result<MacroPipeline> {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for index in 0..self.tasks.len() {
            let label = self.task_label(index);
            let task = self
                .kind
                .build_with_input(
                    Some(label.clone()),
                    self.task_args(index),
                    Value::Object(self.task_input(index)),
                )
                .with_context(|| format!("cannot build task {} ({})", index, label))?;
            tasks.push(task);
        }
        let mut pipeline = MacroPipeline::new();
        pipeline.set_tasks(tasks);
        Ok(pipeline)
    }
}

/// Commented sample written by `generate-config`.
pub const SAMPLE_CONFIG: &str = r#"# laserfarm batch configuration

# === CLUSTER: where the tasks run ===
cluster:
  # threads: blocking thread pool in this process
  # local:   pool of `laserfarm worker` subprocesses
  # ssh:     worker processes started on remote hosts
  mode: threads
  # Number of tasks run at once (null = num CPUs)
  n_workers: 4

  # mode: ssh
  # hosts: ["node-1", "node-2"]
  # workers_per_host: 2
  # worker_command: "/opt/laserfarm/bin/laserfarm"
  # ssh_options: ["-o", "BatchMode=yes"]

# === PIPELINE: one of retiling, data_processing, geotiff_writer, classification ===
kind: data_processing

# Input shared by all tasks (task name -> arguments)
input:
  setup_local_fs:
    input_folder: "/data/retiled"
    output_folder: "/data/targets"
  load: {}
  normalize: 1
  generate_targets:
    min_x: -113107.81
    min_y: 214783.87
    max_x: 398892.19
    max_y: 726783.87
    n_tiles_side: 256
    tile_mesh_size: 10.0
    validate: true
  extract_features:
    volume_type: infinite_cylinder
    volume_size: 10
    feature_names: ["point_density", "perc_95_normalized_height"]
  export_targets:
    attributes: ["point_density", "perc_95_normalized_height"]
    multi_band_files: false

# === TASKS: one pipeline per entry ===
tasks:
  - label: tile_101_101
    input_path: tile_101_101
    tile_index: [101, 101]
  - label: tile_101_102
    input_path: tile_101_102
    tile_index: [101, 102]
    # Entries here replace the shared input of the same name
    input:
      normalize: 2

# Outcome table destination (omit to print to stdout)
# outcome_file: "results.txt"

# Rayon thread pool size for feature extraction (null = num CPUs)
# rayon_threads: 8
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_sample_config_is_valid() {
        let config = MacroConfig::from_yaml(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.kind, PipelineKind::DataProcessing);
        assert_eq!(config.cluster, ClusterConfig::Threads { n_workers: Some(4) });
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.task_input(1)["normalize"], json!(2));
        assert_eq!(config.task_input(0)["normalize"], json!(1));
    }

    #[test]
    fn test_task_args_and_labels() {
        let config = MacroConfig::from_yaml(
            r#"
kind: retiling
args:
  input_file: "shared.las"
tasks:
  - input_path: "C_01.las"
  - label: second
  - {}
"#,
        )
        .unwrap();
        assert_eq!(config.task_label(0), "C_01");
        assert_eq!(config.task_label(1), "second");
        assert_eq!(config.task_label(2), "retiling_2");
        assert_eq!(config.task_args(0)["input_file"], json!("C_01.las"));
        assert_eq!(config.task_args(1)["input_file"], json!("shared.las"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let empty = MacroConfig::from_yaml("kind: classification\ntasks: []\n").unwrap();
        assert!(empty.validate().is_err());

        let tile_on_retiler = MacroConfig::from_yaml(
            "kind: retiling\ntasks:\n  - tile_index: [1, 2]\n",
        )
        .unwrap();
        assert!(tile_on_retiler.validate().is_err());

        let bad_args = MacroConfig::from_yaml(
            "kind: geotiff_writer\ntasks:\n  - args: {colour: red}\n",
        )
        .unwrap();
        assert!(bad_args.validate().is_err());

        let bad_cluster = MacroConfig::from_yaml(
            "kind: retiling\ncluster: {mode: ssh, hosts: []}\ntasks: [{}]\n",
        )
        .unwrap();
        assert!(bad_cluster.validate().is_err());

        assert!(MacroConfig::from_yaml("kind: mosaic\ntasks: [{}]\n").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            json!({
                "cluster": {"mode": "local", "n_workers": 2},
                "kind": "GeotiffWriter",
                "args": {"bands": ["point_density"]},
                "input": {"data_split": [1, 1]},
                "tasks": [{"input_path": "tiles"}],
                "outcome_file": "results.txt",
            })
            .to_string(),
        )
        .unwrap();
        let config = MacroConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.task_args(0)["input_dir"], json!("tiles"));

        let pipeline = config.build_pipeline().unwrap();
        assert_eq!(pipeline.tasks().len(), 1);
        assert_eq!(pipeline.tasks()[0].task_label(), "tiles");
    }
}
