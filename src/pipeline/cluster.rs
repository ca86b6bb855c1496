//! Executors that run batch tasks: an in-process blocking pool, or worker
//! processes of this binary on the local machine or on remote hosts.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{BufRead, Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::batch::{run_isolated, BatchTask, TaskDescriptor, TaskOutcome};
use crate::error::{Error, ErrorKind, Result};

/// Subcommand a worker process is started with.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Modes accepted by [`ClusterConfig::from_mode`].
pub const CLUSTER_MODES: [&str; 4] = ["threads", "local", "ssh", "slurm"];

fn default_workers_per_host() -> usize {
    1
}

/// How batch tasks are executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClusterConfig {
    /// Blocking thread pool inside this process
    Threads {
        #[serde(default)]
        n_workers: Option<usize>,
    },

    /// Pool of worker subprocesses on this machine
    Local {
        #[serde(default)]
        n_workers: Option<usize>,
        /// Command that starts this binary; defaults to the running executable
        #[serde(default)]
        worker_command: Option<String>,
    },

    /// Worker processes started on remote hosts over ssh
    Ssh {
        hosts: Vec<String>,
        #[serde(default)]
        worker_command: Option<String>,
        #[serde(default = "default_workers_per_host")]
        workers_per_host: usize,
        #[serde(default)]
        ssh_options: Vec<String>,
    },

    Slurm {
        #[serde(default)]
        options: Value,
    },
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::Threads { n_workers: None }
    }
}

impl ClusterConfig {
    /// Build a configuration from a mode name and its options.
    pub fn from_mode(mode: &str, options: Value) -> Result<Self> {
        if !CLUSTER_MODES.contains(&mode) {
            return Err(Error::Config(format!("Unknown mode of setup client {}!", mode)));
        }
        let mut options = match options {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::Config(format!(
                    "cluster options must be an object, got: {}",
                    other
                )))
            }
        };
        options.insert("mode".to_string(), Value::String(mode.to_string()));
        Self::from_value(Value::Object(options))
    }

    /// Parse a `mode`-tagged configuration object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get("mode").and_then(Value::as_str) {
            Some(mode) if CLUSTER_MODES.contains(&mode) => {}
            Some(mode) => {
                return Err(Error::Config(format!("Unknown mode of setup client {}!", mode)))
            }
            None => return Err(Error::Config("cluster mode is missing".to_string())),
        }
        serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid cluster configuration: {}", e)))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            ClusterConfig::Threads { .. } => "threads",
            ClusterConfig::Local { .. } => "local",
            ClusterConfig::Ssh { .. } => "ssh",
            ClusterConfig::Slurm { .. } => "slurm",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ClusterConfig::Threads { n_workers: Some(0) }
            | ClusterConfig::Local {
                n_workers: Some(0), ..
            } => Err(Error::Config("n_workers must be > 0".to_string())),
            ClusterConfig::Ssh { hosts, .. } if hosts.is_empty() => {
                Err(Error::Config("ssh mode requires at least one host".to_string()))
            }
            ClusterConfig::Ssh {
                workers_per_host: 0,
                ..
            } => Err(Error::Config("workers_per_host must be > 0".to_string())),
            _ => Ok(()),
        }
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A way of starting one worker process.
#[derive(Debug, Clone)]
enum Launcher {
    Local { program: String, args: Vec<String> },
    Ssh { host: String, command: String, ssh_options: Vec<String> },
}

impl Launcher {
    fn command(&self) -> Command {
        match self {
            Launcher::Local { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(WORKER_SUBCOMMAND);
                cmd
            }
            Launcher::Ssh {
                host,
                command,
                ssh_options,
            } => {
                let mut cmd = Command::new("ssh");
                cmd.args(ssh_options)
                    .arg(host)
                    .arg(format!("{} {}", command, WORKER_SUBCOMMAND));
                cmd
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Launcher::Local { program, .. } => program.clone(),
            Launcher::Ssh { host, .. } => format!("ssh://{}", host),
        }
    }
}

fn worker_program(worker_command: Option<&str>) -> Result<(String, Vec<String>)> {
    match worker_command {
        Some(command) => {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts
                .next()
                .ok_or_else(|| Error::Config("worker_command is empty".to_string()))?;
            Ok((program, parts.collect()))
        }
        None => {
            let exe = std::env::current_exe()?;
            Ok((exe.to_string_lossy().into_owned(), Vec::new()))
        }
    }
}

/// Free worker slots of a process backend, one per concurrent worker.
///
/// A task takes a slot when it starts and gives it back when it ends, so a
/// host never runs more workers than it has slots.
#[derive(Debug)]
struct SlotPool {
    free: Mutex<VecDeque<Launcher>>,
}

impl SlotPool {
    fn new(slots: &[Launcher]) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(slots.iter().cloned().collect()),
        })
    }

    fn take(self: &Arc<Self>) -> Option<Slot> {
        let launcher = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()?;
        Some(Slot {
            pool: Arc::clone(self),
            launcher: Some(launcher),
        })
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A taken slot; returned to its pool on drop.
struct Slot {
    pool: Arc<SlotPool>,
    launcher: Option<Launcher>,
}

impl Slot {
    fn launcher(&self) -> Option<&Launcher> {
        self.launcher.as_ref()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(launcher) = self.launcher.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(launcher);
        }
    }
}

/// Worker slots for `hosts`, interleaved so that consecutive tasks start
/// on different hosts.
fn ssh_slots(
    hosts: &[String],
    command: &str,
    workers_per_host: usize,
    ssh_options: &[String],
) -> Vec<Launcher> {
    (0..workers_per_host)
        .flat_map(|_| hosts.iter())
        .map(|host| Launcher::Ssh {
            host: host.clone(),
            command: command.to_string(),
            ssh_options: ssh_options.to_vec(),
        })
        .collect()
}

#[derive(Debug)]
enum Backend {
    Threads,
    /// One launcher per worker slot
    Processes(Vec<Launcher>),
}

/// Stands in for a task an executor failed to hand back.
struct Unrecovered {
    label: String,
}

impl BatchTask for Unrecovered {
    fn task_label(&self) -> &str {
        &self.label
    }

    fn relabel(&mut self, label: String) {
        self.label = label;
    }

    fn load_input(&mut self, _input: Value) -> Result<()> {
        Err(Error::Executor(format!("task {} was lost by the executor", self.label)))
    }

    fn run_task(&mut self) -> TaskOutcome {
        TaskOutcome::failed(&Error::Executor(format!(
            "task {} was lost by the executor",
            self.label
        )))
    }

    fn descriptor(&self) -> Option<TaskDescriptor> {
        None
    }
}

/// Move the tasks out of their slots back into `tasks`, keeping their
/// order. A slot still shared elsewhere leaves a placeholder in place and
/// is reported once every slot has been handled.
fn reclaim_tasks(
    slots: Vec<Arc<Mutex<Box<dyn BatchTask>>>>,
    labels: Vec<String>,
    tasks: &mut Vec<Box<dyn BatchTask>>,
) -> Result<()> {
    let mut held = Vec::new();
    for (index, (slot, label)) in slots.into_iter().zip(labels).enumerate() {
        match Arc::into_inner(slot) {
            Some(task) => tasks.push(task.into_inner().unwrap_or_else(|e| e.into_inner())),
            None => {
                held.push(index);
                tasks.push(Box::new(Unrecovered { label }));
            }
        }
    }
    if held.is_empty() {
        Ok(())
    } else {
        Err(Error::Executor(format!(
            "tasks {:?} are still held by a worker",
            held
        )))
    }
}

/// Running executor: a tokio runtime plus the backend tasks are sent to.
#[derive(Debug)]
pub struct Executor {
    mode: &'static str,
    runtime: Runtime,
    backend: Backend,
    concurrency: usize,
}

impl Executor {
    /// Start an executor for `config`.
    pub fn start(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let (backend, concurrency) = match config {
            ClusterConfig::Threads { n_workers } => {
                (Backend::Threads, n_workers.unwrap_or_else(available_workers))
            }
            ClusterConfig::Local {
                n_workers,
                worker_command,
            } => {
                let (program, args) = worker_program(worker_command.as_deref())?;
                let n_workers = n_workers.unwrap_or_else(available_workers);
                (
                    Backend::Processes(vec![Launcher::Local { program, args }; n_workers]),
                    n_workers,
                )
            }
            ClusterConfig::Ssh {
                hosts,
                worker_command,
                workers_per_host,
                ssh_options,
            } => {
                let command = worker_command
                    .clone()
                    .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
                let slots = ssh_slots(hosts, &command, *workers_per_host, ssh_options);
                let concurrency = slots.len();
                (Backend::Processes(slots), concurrency)
            }
            ClusterConfig::Slurm { .. } => {
                return Err(Error::NotImplemented("slurm deployment".to_string()))
            }
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(concurrency.clamp(1, 8))
            .max_blocking_threads(concurrency.max(1))
            .enable_all()
            .build()
            .map_err(|e| Error::Executor(format!("failed to start runtime: {}", e)))?;

        tracing::info!(
            "Started {} executor with {} workers",
            config.mode(),
            concurrency
        );

        Ok(Self {
            mode: config.mode(),
            runtime,
            backend,
            concurrency,
        })
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task and return their outcomes in submission order.
    ///
    /// Blocks until all tasks have finished. A failing or panicking task
    /// never affects the others.
    pub fn run(&self, tasks: &mut Vec<Box<dyn BatchTask>>) -> Result<Vec<TaskOutcome>> {
        match &self.backend {
            Backend::Threads => self.run_threads(tasks),
            Backend::Processes(slots) => self.run_processes(tasks, slots),
        }
    }

    fn run_threads(&self, tasks: &mut Vec<Box<dyn BatchTask>>) -> Result<Vec<TaskOutcome>> {
        let labels: Vec<String> = tasks.iter().map(|t| t.task_label().to_string()).collect();
        let slots: Vec<Arc<Mutex<Box<dyn BatchTask>>>> = tasks
            .drain(..)
            .map(|task| Arc::new(Mutex::new(task)))
            .collect();

        let jobs = slots
            .iter()
            .map(|slot| {
                let slot = Arc::clone(slot);
                move || async move {
                    tokio::task::spawn_blocking(move || {
                        let mut task = slot.lock().unwrap_or_else(|e| e.into_inner());
                        run_isolated(task.as_mut())
                    })
                    .await
                    .unwrap_or_else(|e| TaskOutcome::Failed {
                        kind: ErrorKind::Panic,
                        message: e.to_string(),
                    })
                }
            })
            .collect();
        let outcomes = self.runtime.block_on(dispatch(jobs, self.concurrency));

        reclaim_tasks(slots, labels, tasks)?;
        Ok(outcomes)
    }

    fn run_processes(
        &self,
        tasks: &[Box<dyn BatchTask>],
        slots: &[Launcher],
    ) -> Result<Vec<TaskOutcome>> {
        let descriptors = tasks
            .iter()
            .map(|task| {
                task.descriptor().ok_or_else(|| {
                    Error::Executor(format!(
                        "task {} cannot be sent to a worker process",
                        task.task_label()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = SlotPool::new(slots);
        let jobs = descriptors
            .into_iter()
            .map(|descriptor| {
                let pool = Arc::clone(&pool);
                move || async move {
                    let label = descriptor.label.clone();
                    // at most one task per slot is in flight
                    let Some(slot) = pool.take() else {
                        return TaskOutcome::failed(&Error::Executor(format!(
                            "no free worker slot for task {}",
                            label
                        )));
                    };
                    let Some(launcher) = slot.launcher() else {
                        return TaskOutcome::failed(&Error::Executor(format!(
                            "empty worker slot for task {}",
                            label
                        )));
                    };
                    match run_in_worker(launcher, &descriptor).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(
                                "Worker {} failed on task {}: {}",
                                launcher.describe(),
                                label,
                                e
                            );
                            TaskOutcome::failed(&e)
                        }
                    }
                }
            })
            .collect();
        Ok(self.runtime.block_on(dispatch(jobs, self.concurrency)))
    }

    /// Stop the runtime, waiting briefly for workers to exit.
    pub fn shutdown(self) {
        tracing::info!("Shutting down {} executor", self.mode);
        self.runtime
            .shutdown_timeout(std::time::Duration::from_secs(10));
    }
}

/// Run jobs with at most `concurrency` in flight, mapping each completed
/// job back to its submission index.
async fn dispatch<J, F>(jobs: Vec<J>, concurrency: usize) -> Vec<TaskOutcome>
where
    J: FnOnce() -> F + Send + 'static,
    F: Future<Output = TaskOutcome> + Send + 'static,
{
    let total = jobs.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut index_of = HashMap::with_capacity(total);

    for (index, job) in jobs.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let handle = set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            job().await
        });
        index_of.insert(handle.id(), index);
    }

    let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; total];
    while let Some(joined) = set.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (
                e.id(),
                TaskOutcome::Failed {
                    kind: ErrorKind::Panic,
                    message: e.to_string(),
                },
            ),
        };
        if let Some(&index) = index_of.get(&id) {
            outcomes[index] = Some(outcome);
        }
    }

    outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| TaskOutcome::Failed {
                kind: ErrorKind::Executor,
                message: "task did not report an outcome".to_string(),
            })
        })
        .collect()
}

async fn run_in_worker(launcher: &Launcher, descriptor: &TaskDescriptor) -> Result<TaskOutcome> {
    let payload = serde_json::to_vec(descriptor)?;
    let mut child = launcher
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            Error::Executor(format!(
                "failed to start worker {}: {}",
                launcher.describe(),
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Executor("worker stdin is not available".to_string()))?;
    stdin.write_all(&payload).await?;
    stdin.shutdown().await?;
    drop(stdin);

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Executor("worker stdout is not available".to_string()))?;
    let mut output = String::new();
    stdout.read_to_string(&mut output).await?;
    let status = child.wait().await?;

    let reply = output.lines().rev().find(|line| !line.trim().is_empty());
    match reply.map(serde_json::from_str::<TaskOutcome>) {
        Some(Ok(outcome)) => Ok(outcome),
        _ if !status.success() => Err(Error::Executor(format!(
            "worker exited with {} for task {}",
            status, descriptor.label
        ))),
        _ => Err(Error::Executor(format!(
            "worker sent no outcome for task {}",
            descriptor.label
        ))),
    }
}

/// Serve one task in a worker process: read a [`TaskDescriptor`] from
/// `reader`, build and run the task, and write its outcome as one JSON line.
pub fn serve_worker<R, W, B>(mut reader: R, mut writer: W, build: B) -> Result<TaskOutcome>
where
    R: BufRead,
    W: Write,
    B: FnOnce(&TaskDescriptor) -> Result<Box<dyn BatchTask>>,
{
    let mut payload = String::new();
    reader.read_to_string(&mut payload)?;
    let outcome = match serde_json::from_str::<TaskDescriptor>(&payload) {
        Ok(descriptor) => match build(&descriptor) {
            Ok(mut task) => {
                task.relabel(descriptor.label.clone());
                tracing::info!("Worker running task {}", descriptor.label);
                run_isolated(task.as_mut())
            }
            Err(e) => TaskOutcome::failed(&e),
        },
        Err(e) => TaskOutcome::failed(&Error::Config(format!("invalid task descriptor: {}", e))),
    };
    serde_json::to_writer(&mut writer, &outcome)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(outcome)
}
