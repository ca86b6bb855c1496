//! Task pipelines, remote staging, and batch execution of pipelines.

mod batch;
mod cluster;
mod core;
mod logger;
mod macro_pipeline;
pub mod registry;
mod remote_data;

pub use batch::{args_object, run_isolated, BatchTask, TaskDescriptor, TaskOutcome};
pub use cluster::{serve_worker, ClusterConfig, Executor, CLUSTER_MODES, WORKER_SUBCOMMAND};
pub use self::core::{base_registry, ConfigSource, Pipeline, PipelineCore, RunSummary, LOG_CONFIG};
pub use logger::{LogConfigArgs, LogStream, RunLog};
pub use macro_pipeline::{BatchStats, Labels, MacroPipeline};
pub use registry::{NoArgs, TaskRegistry};
pub use remote_data::{
    register_remote_tasks, wrap_phases, PullArgs, PushArgs, RemoteData, RemoteDataPipeline,
    SetupLocalFsArgs, WebdavArgs, CLEAN_LOCAL_FS, PULL_REMOTE, PUSH_REMOTE, SETUP_LOCAL_FS,
    SETUP_WEBDAV_CLIENT,
};
