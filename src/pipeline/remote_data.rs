//! Remote staging around a pipeline: local working folders, pulling input
//! from and pushing output to remote storage, and cleanup.
//!
//! A pipeline that stages its data embeds a [`RemoteData`], implements
//! [`RemoteDataPipeline`], registers the staging tasks with
//! [`register_remote_tasks`] and wraps its phases with [`wrap_phases`]:
//!
//! ```text
//! setup_local_fs, setup_webdav_client, pullremote,
//!     <declared tasks>,
//! pushremote, cleanlocalfs
//! ```
//!
//! Like every task, a staging phase only runs if the input has an entry
//! for it.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::core::Pipeline;
use super::registry::{NoArgs, TaskRegistry};
use crate::error::{Error, Result};
use crate::io::fs::{check_dir_exists, purge_local};
use crate::io::{RemoteClient, RemoteOptions, RemoteOptionsSource};

pub const SETUP_LOCAL_FS: &str = "setup_local_fs";
pub const SETUP_WEBDAV_CLIENT: &str = "setup_webdav_client";
pub const PULL_REMOTE: &str = "pullremote";
pub const PUSH_REMOTE: &str = "pushremote";
pub const CLEAN_LOCAL_FS: &str = "cleanlocalfs";

/// Phases run before the declared tasks.
pub const STAGE_IN: [&str; 3] = [SETUP_LOCAL_FS, SETUP_WEBDAV_CLIENT, PULL_REMOTE];
/// Phases run after the declared tasks.
pub const STAGE_OUT: [&str; 2] = [PUSH_REMOTE, CLEAN_LOCAL_FS];

/// Surround a declared sequence with the staging phases.
pub fn wrap_phases(sequence: Vec<String>) -> Vec<String> {
    STAGE_IN
        .iter()
        .map(|s| s.to_string())
        .chain(sequence)
        .chain(STAGE_OUT.iter().map(|s| s.to_string()))
        .collect()
}

/// Local folders, input path and remote client of a staging pipeline.
#[derive(Debug)]
pub struct RemoteData {
    input_folder: PathBuf,
    output_folder: PathBuf,
    input_path: Option<PathBuf>,
    client: Option<RemoteClient>,
}

impl Default for RemoteData {
    fn default() -> Self {
        Self {
            input_folder: PathBuf::from("."),
            output_folder: PathBuf::from("."),
            input_path: None,
            client: None,
        }
    }
}

impl RemoteData {
    pub fn input_folder(&self) -> &Path {
        &self.input_folder
    }

    pub fn set_input_folder(&mut self, folder: impl Into<PathBuf>) {
        self.input_folder = folder.into();
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    pub fn set_output_folder(&mut self, folder: impl Into<PathBuf>) {
        self.output_folder = folder.into();
    }

    /// Input record: the input folder joined with the configured input
    /// path, or the input folder itself when none is set. An absolute
    /// input path replaces the folder.
    pub fn input_path(&self) -> PathBuf {
        match &self.input_path {
            Some(path) => self.input_folder.join(path),
            None => self.input_folder.clone(),
        }
    }

    /// Input path as configured, before joining with the input folder.
    pub fn input_path_setting(&self) -> Option<&Path> {
        self.input_path.as_deref()
    }

    pub fn set_input_path(&mut self, path: impl Into<PathBuf>) {
        self.input_path = Some(path.into());
    }

    pub fn set_client(&mut self, client: RemoteClient) {
        self.client = Some(client);
    }

    pub fn client(&self) -> Result<&RemoteClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::RemoteClient("WebDAV client not setup!".to_string()))
    }

    /// Create the working folders, defaulting to `<tmp>/<label>_input` and
    /// `<tmp>/<label>_output`.
    pub fn setup_local_fs(&mut self, label: &str, args: SetupLocalFsArgs) -> Result<()> {
        let input_folder = args
            .input_folder
            .unwrap_or_else(|| args.tmp_folder.join(format!("{}_input", label)));
        check_dir_exists(&input_folder, true, true)?;
        tracing::info!("Input dir set to {}", input_folder.display());
        self.input_folder = input_folder;

        let output_folder = args
            .output_folder
            .unwrap_or_else(|| args.tmp_folder.join(format!("{}_output", label)));
        check_dir_exists(&output_folder, true, true)?;
        tracing::info!("Output dir set to {}", output_folder.display());
        self.output_folder = output_folder;
        Ok(())
    }

    pub fn setup_webdav_client(&mut self, args: WebdavArgs) -> Result<()> {
        let options = RemoteOptions::resolve(args.webdav_options)?;
        self.client = Some(RemoteClient::connect(&options)?);
        Ok(())
    }

    /// Pull the input from `remote_origin`.
    ///
    /// With an input path set below the input folder, only the record of
    /// that name is pulled; a file lands directly in the input folder.
    pub fn pullremote(&self, args: PullArgs) -> Result<()> {
        let client = self.client()?;
        let input_path = self.input_path();
        let mut remote = args.remote_origin.trim_end_matches('/').to_string();
        let mut local = input_path.clone();
        if absolute(&input_path) != absolute(&self.input_folder) {
            if let Some(name) = input_path.file_name().and_then(|n| n.to_str()) {
                remote = format!("{}/{}", remote, name);
            }
            if input_path.extension().is_some() {
                local = self.input_folder.clone();
            }
        }
        tracing::info!("Pulling from WebDAV {} ...", remote);
        client.pull(&local, &remote)?;
        tracing::info!("... pulling completed.");
        Ok(())
    }

    /// Push the content of the output folder to `remote_destination`.
    pub fn pushremote(&self, args: PushArgs) -> Result<()> {
        let client = self.client()?;
        tracing::info!("Pushing to WebDAV {} ...", args.remote_destination);
        client.push(&self.output_folder, &args.remote_destination)?;
        tracing::info!("... pushing completed.");
        Ok(())
    }

    /// Remove the input and output folders.
    pub fn cleanlocalfs(&self) -> Result<()> {
        tracing::info!("Removing input and output folders");
        purge_local(&self.input_folder)?;
        purge_local(&self.output_folder)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn default_tmp_folder() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupLocalFsArgs {
    #[serde(default)]
    pub input_folder: Option<PathBuf>,
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
    #[serde(default = "default_tmp_folder")]
    pub tmp_folder: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebdavArgs {
    pub webdav_options: RemoteOptionsSource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullArgs {
    pub remote_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushArgs {
    pub remote_destination: String,
}

/// A pipeline whose data is staged through a [`RemoteData`].
pub trait RemoteDataPipeline: Pipeline {
    fn remote(&self) -> &RemoteData;

    fn remote_mut(&mut self) -> &mut RemoteData;
}

/// Add the staging tasks to a pipeline registry.
pub fn register_remote_tasks<P: RemoteDataPipeline>(registry: TaskRegistry<P>) -> TaskRegistry<P> {
    registry
        .register(SETUP_LOCAL_FS, |p: &mut P, args: SetupLocalFsArgs| {
            let label = p.label().to_string();
            p.remote_mut().setup_local_fs(&label, args)?;
            let output = p.remote().output_folder().to_path_buf();
            p.core_mut().start_log_to_file(&output)
        })
        .register(SETUP_WEBDAV_CLIENT, |p: &mut P, args: WebdavArgs| {
            p.remote_mut().setup_webdav_client(args)
        })
        .register(PULL_REMOTE, |p: &mut P, args: PullArgs| p.remote().pullremote(args))
        .register(PUSH_REMOTE, |p: &mut P, args: PushArgs| p.remote().pushremote(args))
        .register(CLEAN_LOCAL_FS, |p: &mut P, _: NoArgs| p.remote().cleanlocalfs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::core::{base_registry, PipelineCore};
    use object_store::local::LocalFileSystem;
    use serde_json::json;
    use std::sync::{Arc, OnceLock};
    use tempfile::TempDir;

    struct Staged {
        core: PipelineCore,
        remote: RemoteData,
        seen: Vec<PathBuf>,
    }

    impl Staged {
        fn new() -> Self {
            Self {
                core: PipelineCore::new(&["inspect"]),
                remote: RemoteData::default(),
                seen: Vec::new(),
            }
        }
    }

    impl Pipeline for Staged {
        const NAME: &'static str = "Staged";

        fn core(&self) -> &PipelineCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut PipelineCore {
            &mut self.core
        }

        fn registry() -> &'static TaskRegistry<Self> {
            static REGISTRY: OnceLock<TaskRegistry<Staged>> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                register_remote_tasks(base_registry::<Staged>()).register(
                    "inspect",
                    |p: &mut Staged, _: NoArgs| {
                        let input = p.remote.input_path();
                        let mut entries: Vec<PathBuf> = std::fs::read_dir(&input)?
                            .map(|e| e.map(|e| e.path()))
                            .collect::<std::io::Result<_>>()?;
                        entries.sort();
                        p.seen = entries;
                        let out = p.remote.output_folder().join("result.txt");
                        std::fs::write(out, "done")?;
                        Ok(())
                    },
                )
            })
        }

        fn phases(sequence: Vec<String>) -> Vec<String> {
            wrap_phases(sequence)
        }
    }

    impl RemoteDataPipeline for Staged {
        fn remote(&self) -> &RemoteData {
            &self.remote
        }

        fn remote_mut(&mut self) -> &mut RemoteData {
            &mut self.remote
        }
    }

    #[test]
    fn test_wrap_phases() {
        let wrapped = wrap_phases(vec!["a".to_string()]);
        assert_eq!(
            wrapped,
            vec![
                "setup_local_fs",
                "setup_webdav_client",
                "pullremote",
                "a",
                "pushremote",
                "cleanlocalfs"
            ]
        );
    }

    #[test]
    fn test_default_folders_follow_label() {
        let tmp = TempDir::new().unwrap();
        let mut data = RemoteData::default();
        let args: SetupLocalFsArgs =
            serde_json::from_value(json!({"tmp_folder": tmp.path()})).unwrap();
        data.setup_local_fs("job", args).unwrap();
        assert_eq!(data.input_folder(), tmp.path().join("job_input"));
        assert_eq!(data.output_folder(), tmp.path().join("job_output"));
        assert!(data.input_folder().is_dir());
        assert!(data.output_folder().is_dir());
    }

    #[test]
    fn test_input_path_joins_folder() {
        let mut data = RemoteData::default();
        data.set_input_folder("/data/in");
        assert_eq!(data.input_path(), PathBuf::from("/data/in"));
        data.set_input_path("tile.laz");
        assert_eq!(data.input_path(), PathBuf::from("/data/in/tile.laz"));
        data.set_input_path("/elsewhere/tile.laz");
        assert_eq!(data.input_path(), PathBuf::from("/elsewhere/tile.laz"));
    }

    #[test]
    fn test_pull_without_client() {
        let data = RemoteData::default();
        let err = data
            .pullremote(PullArgs {
                remote_origin: "/remote".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::RemoteClient(_)));
        assert!(err.to_string().contains("WebDAV client not setup!"));
    }

    #[test]
    fn test_staged_run_against_local_remote() {
        let remote_root = TempDir::new().unwrap();
        std::fs::create_dir_all(remote_root.path().join("in/sub")).unwrap();
        std::fs::write(remote_root.path().join("in/a.txt"), "a").unwrap();
        std::fs::write(remote_root.path().join("in/sub/b.txt"), "b").unwrap();
        let tmp = TempDir::new().unwrap();

        let mut pipeline = Staged::new();
        pipeline.set_label("staged");
        pipeline
            .set_input(json!({
                "setup_local_fs": {"tmp_folder": tmp.path()},
                "setup_webdav_client": {
                    "webdav_options": {"local_root": remote_root.path()}
                },
                "pullremote": "in",
                "inspect": {},
                "pushremote": "out",
                "cleanlocalfs": {}
            }))
            .unwrap();
        let summary = pipeline.run().unwrap();
        assert_eq!(summary.executed.len(), 7);

        let input = tmp.path().join("staged_input");
        assert_eq!(pipeline.seen, vec![input.join("a.txt"), input.join("sub")]);
        assert!(remote_root.path().join("out/result.txt").is_file());
        assert!(remote_root.path().join("out/staged.log").is_file());
        assert!(!input.exists());
        assert!(!tmp.path().join("staged_output").exists());
    }

    #[test]
    fn test_pull_single_record() {
        let remote_root = TempDir::new().unwrap();
        std::fs::create_dir_all(remote_root.path().join("in")).unwrap();
        std::fs::write(remote_root.path().join("in/a.txt"), "a").unwrap();
        std::fs::write(remote_root.path().join("in/b.txt"), "b").unwrap();
        let local = TempDir::new().unwrap();

        let mut data = RemoteData::default();
        data.set_input_folder(local.path());
        data.set_input_path("a.txt");
        let store = Arc::new(LocalFileSystem::new_with_prefix(remote_root.path()).unwrap());
        data.set_client(RemoteClient::with_store(store).unwrap());
        data.pullremote(PullArgs {
            remote_origin: "in".into(),
        })
        .unwrap();
        assert!(local.path().join("a.txt").is_file());
        assert!(!local.path().join("b.txt").exists());
    }
}
