//! Recursive pull and push between the local filesystem and the remote.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use object_store::ObjectStore;

use super::store::{self, RemoteClient};
use crate::error::{Error, Result};

/// Files transferred concurrently within one directory.
const TRANSFER_CONCURRENCY: usize = 8;

fn join_remote(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn remote_file_name(remote: &str) -> Result<&str> {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("remote path has no file name: {}", remote)))
}

/// Download a remote record into `local_dir`.
///
/// A remote directory is mirrored recursively into `local_dir`; a remote
/// file is placed inside `local_dir`.
pub async fn pull_from_remote(store: &dyn ObjectStore, local_dir: &Path, remote: &str) -> Result<()> {
    if !store::exists(store, remote).await? {
        tracing::error!("remote resource {} not found", remote);
        return Err(Error::NotFound(format!("remote resource not found: {}", remote)));
    }
    if store::is_dir(store, remote).await? {
        pull_directory(store, local_dir.to_path_buf(), remote.to_string()).await
    } else {
        let name = remote_file_name(remote)?;
        tokio::fs::create_dir_all(local_dir).await?;
        store::download_file(store, remote, &local_dir.join(name)).await
    }
}

fn pull_directory<'a>(
    store: &'a dyn ObjectStore,
    local_dir: PathBuf,
    remote_dir: String,
) -> BoxFuture<'a, Result<()>> {
    async move {
        tracing::debug!("... get content of {}", remote_dir);
        tokio::fs::create_dir_all(&local_dir).await?;

        let mut files = Vec::new();
        for name in store::list(store, &remote_dir).await? {
            let remote_path = join_remote(&remote_dir, &name);
            let local_path = local_dir.join(&name);
            if store::is_dir(store, &remote_path).await? {
                pull_directory(store, local_path, remote_path).await?;
            } else {
                files.push((remote_path, local_path));
            }
        }

        stream::iter(files)
            .map(move |(remote_path, local_path)| async move {
                store::download_file(store, &remote_path, &local_path)
                    .await
                    .map_err(|e| {
                        tracing::error!("failed to pull {} from remote", remote_path);
                        e
                    })
            })
            .buffer_unordered(TRANSFER_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }
    .boxed()
}

/// Upload a local record into `remote_dir`.
///
/// A local directory is mirrored recursively, replacing remote files with
/// the same name; a local file is placed inside `remote_dir`.
pub async fn push_to_remote(store: &dyn ObjectStore, local: &Path, remote_dir: &str) -> Result<()> {
    if !local.exists() {
        tracing::error!("local record {} does not exist", local.display());
        return Err(Error::NotFound(format!(
            "local record not found: {}",
            local.display()
        )));
    }
    if local.is_dir() {
        push_directory(store, local.to_path_buf(), remote_dir.to_string()).await
    } else {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("invalid file name: {}", local.display())))?;
        store::upload_file(store, local, &join_remote(remote_dir, name)).await
    }
}

fn push_directory<'a>(
    store: &'a dyn ObjectStore,
    local_dir: PathBuf,
    remote_dir: String,
) -> BoxFuture<'a, Result<()>> {
    async move {
        if store::exists(store, &remote_dir).await? && !store::is_dir(store, &remote_dir).await? {
            tracing::error!(
                "A record exists at {} on the remote fs which is not a directory",
                remote_dir
            );
            return Err(Error::AlreadyExists(format!(
                "remote record is not a directory: {}",
                remote_dir
            )));
        }

        tracing::debug!("... get content of {}", local_dir.display());
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&local_dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        if entries.is_empty() {
            return store::mkdir(store, &remote_dir).await;
        }

        let mut files = Vec::new();
        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let remote_path = join_remote(&remote_dir, &name);
            if path.is_dir() {
                push_directory(store, path, remote_path).await?;
            } else {
                files.push((path, remote_path));
            }
        }

        stream::iter(files)
            .map(move |(local_path, remote_path)| async move {
                store::upload_file(store, &local_path, &remote_path).await
            })
            .buffer_unordered(TRANSFER_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }
    .boxed()
}

impl RemoteClient {
    /// Blocking [`pull_from_remote`].
    pub fn pull(&self, local_dir: &Path, remote: &str) -> Result<()> {
        self.block_on(pull_from_remote(self.store().as_ref(), local_dir, remote))
    }

    /// Blocking [`push_to_remote`].
    pub fn push(&self, local: &Path, remote_dir: &str) -> Result<()> {
        self.block_on(push_to_remote(self.store().as_ref(), local, remote_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn local_store(root: &Path) -> Arc<dyn ObjectStore> {
        Arc::new(LocalFileSystem::new_with_prefix(root).unwrap())
    }

    #[tokio::test]
    async fn test_pull_directory_recursively() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("run/tile_0_0")).unwrap();
        std::fs::write(remote.path().join("run/a.ply"), b"a").unwrap();
        std::fs::write(remote.path().join("run/tile_0_0/b.ply"), b"b").unwrap();

        let store = local_store(remote.path());
        pull_from_remote(store.as_ref(), &local.path().join("in"), "run")
            .await
            .unwrap();

        assert_eq!(std::fs::read(local.path().join("in/a.ply")).unwrap(), b"a");
        assert_eq!(
            std::fs::read(local.path().join("in/tile_0_0/b.ply")).unwrap(),
            b"b"
        );
    }

    #[tokio::test]
    async fn test_pull_single_file_into_directory() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("raw")).unwrap();
        std::fs::write(remote.path().join("raw/C_25GN1.LAZ"), b"laz").unwrap();

        let store = local_store(remote.path());
        pull_from_remote(store.as_ref(), local.path(), "/raw/C_25GN1.LAZ")
            .await
            .unwrap();
        assert_eq!(std::fs::read(local.path().join("C_25GN1.LAZ")).unwrap(), b"laz");
    }

    #[tokio::test]
    async fn test_pull_missing_remote() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let store = local_store(remote.path());
        let err = pull_from_remote(store.as_ref(), local.path(), "nothing/here")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_push_directory_replaces_files() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("out")).unwrap();
        std::fs::write(remote.path().join("out/x.ply"), b"old").unwrap();
        std::fs::create_dir_all(local.path().join("tile_1_2")).unwrap();
        std::fs::write(local.path().join("x.ply"), b"new").unwrap();
        std::fs::write(local.path().join("tile_1_2/y.ply"), b"y").unwrap();

        let store = local_store(remote.path());
        push_to_remote(store.as_ref(), local.path(), "out").await.unwrap();

        assert_eq!(std::fs::read(remote.path().join("out/x.ply")).unwrap(), b"new");
        assert_eq!(
            std::fs::read(remote.path().join("out/tile_1_2/y.ply")).unwrap(),
            b"y"
        );
    }

    #[tokio::test]
    async fn test_push_empty_directory_round_trips() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(local.path().join("tile_0_0")).unwrap();
        std::fs::write(local.path().join("a.ply"), b"a").unwrap();

        let store = local_store(remote.path());
        push_to_remote(store.as_ref(), local.path(), "out").await.unwrap();
        assert!(store::is_dir(store.as_ref(), "out/tile_0_0").await.unwrap());
        assert_eq!(
            store::list(store.as_ref(), "out").await.unwrap(),
            vec!["a.ply", "tile_0_0"]
        );

        let back = TempDir::new().unwrap();
        pull_from_remote(store.as_ref(), back.path(), "out").await.unwrap();
        assert!(back.path().join("tile_0_0").is_dir());
        assert_eq!(std::fs::read_dir(back.path().join("tile_0_0")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_push_onto_remote_file_fails() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(remote.path().join("out"), b"file").unwrap();
        std::fs::write(local.path().join("x.ply"), b"x").unwrap();

        let store = local_store(remote.path());
        let err = push_to_remote(store.as_ref(), local.path(), "out")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/a/b/c.laz").unwrap(), "c.laz");
        assert_eq!(join_remote("/a/b/", "c"), "/a/b/c");
        assert_eq!(join_remote("", "c"), "c");
    }
}
