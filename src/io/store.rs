//! Remote storage client for staging pipeline input and output.
//!
//! WebDAV servers are reached through the object_store HTTP backend; a
//! local directory can stand in for the remote when `local_root` is given
//! (shared mounts, tests).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use object_store::http::HttpBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, RetryConfig};
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{Error, Result};
use crate::io::fs::{check_file_exists, get_args_from_configfile};

/// Keys that must be present for a WebDAV client.
const REQUIRED_WEBDAV_KEYS: [&str; 3] = ["webdav_hostname", "webdav_login", "webdav_password"];

/// Remote client options as given in a pipeline input: either inline or the
/// path to a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RemoteOptionsSource {
    File(PathBuf),
    Inline(Map<String, Value>),
}

/// Validated remote connection settings.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOptions {
    WebDav {
        hostname: String,
        login: String,
        password: String,
        root: Option<String>,
    },
    Local {
        root: PathBuf,
    },
}

impl RemoteOptions {
    /// Resolve options from a file or an inline mapping.
    ///
    /// An `authenticationfile` key points to a JSON file whose keys are
    /// merged into the options.
    pub fn resolve(source: RemoteOptionsSource) -> Result<Self> {
        let mut options = match source {
            RemoteOptionsSource::File(path) => {
                check_file_exists(&path, true)?;
                match get_args_from_configfile(&path)? {
                    Value::Object(map) => map,
                    other => {
                        return Err(Error::Config(format!(
                            "remote options file must hold an object, got: {}",
                            other
                        )))
                    }
                }
            }
            RemoteOptionsSource::Inline(map) => map,
        };

        if let Some(auth) = options.remove("authenticationfile") {
            let auth_path = auth
                .as_str()
                .map(PathBuf::from)
                .ok_or_else(|| Error::Config("authenticationfile must be a path".to_string()))?;
            check_file_exists(&auth_path, true)?;
            if let Value::Object(auth) = get_args_from_configfile(&auth_path)? {
                options.extend(auth);
            }
        }

        Self::from_map(&options)
    }

    fn from_map(options: &Map<String, Value>) -> Result<Self> {
        let get = |key: &str| options.get(key).and_then(Value::as_str).map(str::to_string);

        if let Some(root) = get("local_root") {
            return Ok(RemoteOptions::Local { root: root.into() });
        }

        let missing: Vec<&str> = REQUIRED_WEBDAV_KEYS
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            tracing::error!(
                "Options specified for WebDAV client insufficient to establish client"
            );
            return Err(Error::Config(format!(
                "missing remote options: {} (if using an authentication file the \
                 credentials must be specified there)",
                missing.join(", ")
            )));
        }

        Ok(RemoteOptions::WebDav {
            hostname: get("webdav_hostname").unwrap_or_default(),
            login: get("webdav_login").unwrap_or_default(),
            password: get("webdav_password").unwrap_or_default(),
            root: get("webdav_root"),
        })
    }
}

/// HTTP client options for WebDAV transfers of large point-cloud files.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        // Files are large: allow long transfers
        .with_timeout(Duration::from_secs(3600))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_allow_http(true)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(300),
    }
}

/// Build the object store behind a set of remote options.
pub fn create_remote_store(options: &RemoteOptions) -> Result<Arc<dyn ObjectStore>> {
    match options {
        RemoteOptions::Local { root } => {
            if !root.is_dir() {
                return Err(Error::NotFound(format!(
                    "local remote root does not exist: {}",
                    root.display()
                )));
            }
            tracing::info!("Creating LocalFileSystem remote at: {}", root.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?))
        }
        RemoteOptions::WebDav {
            hostname,
            login,
            password,
            root,
        } => {
            let url = webdav_url(hostname, login, password, root.as_deref())?;
            tracing::info!("Creating WebDAV client for host: {}", hostname);
            let store = HttpBuilder::new()
                .with_url(url.as_str())
                .with_client_options(create_client_options())
                .with_retry(create_retry_config())
                .build()?;
            Ok(Arc::new(store))
        }
    }
}

/// Base URL of a WebDAV endpoint with basic-auth credentials embedded.
fn webdav_url(hostname: &str, login: &str, password: &str, root: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(hostname)
        .map_err(|e| Error::Config(format!("invalid webdav_hostname '{}': {}", hostname, e)))?;
    if let Some(root) = root {
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            root.trim_matches('/')
        );
        url.set_path(&joined);
    }
    url.set_username(login)
        .map_err(|_| Error::Config(format!("cannot set login on URL {}", hostname)))?;
    url.set_password(Some(password))
        .map_err(|_| Error::Config(format!("cannot set password on URL {}", hostname)))?;
    Ok(url)
}

/// Convert a slash-separated remote path into an object path.
pub fn object_path(remote: &str) -> ObjectPath {
    ObjectPath::from(remote.trim_matches('/'))
}

/// Blocking remote client.
///
/// Transfers run on a private current-thread runtime, so pipeline tasks can
/// call the client from synchronous code and from blocking worker threads.
pub struct RemoteClient {
    store: Arc<dyn ObjectStore>,
    runtime: tokio::runtime::Runtime,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl RemoteClient {
    /// Connect using resolved options.
    pub fn connect(options: &RemoteOptions) -> Result<Self> {
        Self::with_store(create_remote_store(options)?)
    }

    /// Wrap an existing store.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { store, runtime })
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Whether a file or a non-empty directory exists at `remote`.
    pub fn check(&self, remote: &str) -> Result<bool> {
        self.block_on(exists(self.store.as_ref(), remote))
    }

    /// Whether `remote` is a directory.
    pub fn is_dir(&self, remote: &str) -> Result<bool> {
        self.block_on(is_dir(self.store.as_ref(), remote))
    }

    /// Names of the records directly below `remote`.
    pub fn list(&self, remote: &str) -> Result<Vec<String>> {
        self.block_on(list(self.store.as_ref(), remote))
    }

    /// Download one remote file to a local path.
    pub fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        self.block_on(download_file(self.store.as_ref(), remote, local))
    }

    /// Upload one local file to a remote path, replacing any existing file.
    pub fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.block_on(upload_file(self.store.as_ref(), local, remote))
    }

    /// Create a remote directory, parents included.
    pub fn mkdir(&self, remote: &str) -> Result<()> {
        self.block_on(mkdir(self.store.as_ref(), remote))
    }
}

/// Empty object that keeps a directory alive on stores without real
/// directories. Never listed.
pub const DIR_MARKER: &str = ".keep";

pub(crate) async fn mkdir(store: &dyn ObjectStore, remote: &str) -> Result<()> {
    if exists(store, remote).await? && !is_dir(store, remote).await? {
        return Err(Error::AlreadyExists(format!(
            "remote record is not a directory: {}",
            remote
        )));
    }
    let marker = format!("{}/{}", remote.trim_end_matches('/'), DIR_MARKER);
    tracing::debug!("... creating remote directory {}", remote);
    store
        .put(&object_path(&marker), PutPayload::default())
        .await?;
    Ok(())
}

pub(crate) async fn exists(store: &dyn ObjectStore, remote: &str) -> Result<bool> {
    let path = object_path(remote);
    match store.head(&path).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => has_children(store, &path).await,
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn is_dir(store: &dyn ObjectStore, remote: &str) -> Result<bool> {
    let path = object_path(remote);
    match store.head(&path).await {
        Ok(_) => Ok(false),
        Err(object_store::Error::NotFound { .. }) => has_children(store, &path).await,
        Err(e) => Err(e.into()),
    }
}

async fn has_children(store: &dyn ObjectStore, path: &ObjectPath) -> Result<bool> {
    let prefix = (!path.as_ref().is_empty()).then_some(path);
    match store.list_with_delimiter(prefix).await {
        Ok(listing) => Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty()),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn list(store: &dyn ObjectStore, remote: &str) -> Result<Vec<String>> {
    let path = object_path(remote);
    let prefix = (!path.as_ref().is_empty()).then_some(&path);
    let listing = store.list_with_delimiter(prefix).await?;
    let mut names: Vec<String> = listing
        .common_prefixes
        .iter()
        .chain(listing.objects.iter().map(|meta| &meta.location))
        .filter_map(|p| p.filename())
        .filter(|name| *name != DIR_MARKER)
        .map(str::to_string)
        .collect();
    names.sort();
    Ok(names)
}

pub(crate) async fn download_file(store: &dyn ObjectStore, remote: &str, local: &Path) -> Result<()> {
    tracing::debug!("... pulling {}", remote);
    let bytes = store.get(&object_path(remote)).await?.bytes().await?;
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(local, &bytes).await?;
    Ok(())
}

pub(crate) async fn upload_file(store: &dyn ObjectStore, local: &Path, remote: &str) -> Result<()> {
    tracing::debug!("... pushing {}", local.display());
    let data = tokio::fs::read(local).await?;
    store
        .put(&object_path(remote), PutPayload::from(data))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn inline(value: Value) -> RemoteOptionsSource {
        match value {
            Value::Object(map) => RemoteOptionsSource::Inline(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_resolve_webdav_options() {
        let options = RemoteOptions::resolve(inline(json!({
            "webdav_hostname": "https://webdav.example.org",
            "webdav_login": "user",
            "webdav_password": "secret",
        })))
        .unwrap();
        assert_eq!(
            options,
            RemoteOptions::WebDav {
                hostname: "https://webdav.example.org".into(),
                login: "user".into(),
                password: "secret".into(),
                root: None,
            }
        );
    }

    #[test]
    fn test_resolve_reports_missing_keys() {
        let err = RemoteOptions::resolve(inline(json!({
            "webdav_hostname": "https://webdav.example.org",
        })))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("webdav_login"));
        assert!(msg.contains("webdav_password"));
        assert!(!msg.contains("webdav_hostname"));
    }

    #[test]
    fn test_resolve_from_file_with_authentication_file() {
        let dir = TempDir::new().unwrap();
        let auth = dir.path().join("auth.json");
        std::fs::write(
            &auth,
            r#"{"webdav_login": "user", "webdav_password": "pw"}"#,
        )
        .unwrap();
        let options_file = dir.path().join("webdav.json");
        std::fs::write(
            &options_file,
            serde_json::to_string(&json!({
                "webdav_hostname": "https://host.example.org",
                "webdav_root": "/pnfs/data",
                "authenticationfile": auth,
            }))
            .unwrap(),
        )
        .unwrap();

        let options = RemoteOptions::resolve(RemoteOptionsSource::File(options_file)).unwrap();
        match options {
            RemoteOptions::WebDav { login, root, .. } => {
                assert_eq!(login, "user");
                assert_eq!(root.as_deref(), Some("/pnfs/data"));
            }
            other => panic!("unexpected options: {:?}", other),
        }
    }

    #[test]
    fn test_webdav_url_embeds_credentials_and_root() {
        let url = webdav_url("https://host.example.org/dav", "me", "pw", Some("/data/")).unwrap();
        assert_eq!(url.username(), "me");
        assert_eq!(url.password(), Some("pw"));
        assert_eq!(url.path(), "/dav/data");
    }

    #[test]
    fn test_source_deserializes_from_path_or_object() {
        let file: RemoteOptionsSource = serde_json::from_value(json!("opts.json")).unwrap();
        assert!(matches!(file, RemoteOptionsSource::File(_)));
        let inline: RemoteOptionsSource =
            serde_json::from_value(json!({"local_root": "/tmp"})).unwrap();
        assert!(matches!(inline, RemoteOptionsSource::Inline(_)));
    }

    #[test]
    fn test_local_client_operations() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("data/sub")).unwrap();
        std::fs::write(remote.path().join("data/a.laz"), b"abc").unwrap();
        std::fs::write(remote.path().join("data/sub/b.laz"), b"de").unwrap();

        let client = RemoteClient::connect(&RemoteOptions::Local {
            root: remote.path().to_path_buf(),
        })
        .unwrap();

        assert!(client.check("data").unwrap());
        assert!(client.check("/data/a.laz").unwrap());
        assert!(!client.check("data/none.laz").unwrap());
        assert!(client.is_dir("data").unwrap());
        assert!(!client.is_dir("data/a.laz").unwrap());
        assert_eq!(client.list("data").unwrap(), vec!["a.laz", "sub"]);

        let target = local.path().join("a.laz");
        client.download_file("data/a.laz", &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abc");

        client.upload_file(&target, "out/copy.laz").unwrap();
        assert_eq!(std::fs::read(remote.path().join("out/copy.laz")).unwrap(), b"abc");
    }

    #[test]
    fn test_mkdir_creates_listable_directory() {
        let remote = TempDir::new().unwrap();
        let client = RemoteClient::connect(&RemoteOptions::Local {
            root: remote.path().to_path_buf(),
        })
        .unwrap();

        assert!(!client.check("run/empty").unwrap());
        client.mkdir("run/empty").unwrap();
        assert!(client.check("run/empty").unwrap());
        assert!(client.is_dir("run/empty").unwrap());
        assert!(client.list("run/empty").unwrap().is_empty());
        assert_eq!(client.list("run").unwrap(), vec!["empty"]);

        std::fs::write(remote.path().join("run/file.ply"), b"x").unwrap();
        let err = client.mkdir("run/file.ply").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_local_root_must_exist() {
        let err = create_remote_store(&RemoteOptions::Local {
            root: PathBuf::from("/definitely/not/here"),
        })
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
