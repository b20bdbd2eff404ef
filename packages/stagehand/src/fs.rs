//! Filesystem operations tailored to the enactment core.
//!
//! Inside this module we refer to `std::fs` or `tokio::fs` by fully
//! qualified path to make it maximally clear which one is being used.
//! Everything that commits data does so with a temp-file-then-rename
//! pattern so partially written artifacts are never visible to other
//! callers.

use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

/// Shared advisory lock file on the file system.
///
/// Lock the file with [`LockFile::lock`] (blocking) or
/// [`LockFile::try_lock`]; unlock with [`LockFile::unlock`], or by dropping
/// the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    #[debug(skip)]
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated lock is not held. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated lock is held. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (file, path) =
            spawn_blocking(move || FsLockFile::open(path.as_path()).map(|file| (file, path)))
                .await
                .context("join task")?
                .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile, blocking until it is available.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile panics if the handle is already locked,
                // but the typestate makes that unrepresentable here.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Locked>| trace!(path = ?f.path, "locked file"))
    }

    /// Attempt to lock the lockfile without blocking. Returns `None` when
    /// another process holds it.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_lock(self) -> Result<Option<LockFile<Locked>>> {
        spawn_blocking(move || {
            let acquired = {
                let mut inner = self.inner.blocking_lock();
                inner.try_lock().context("try lock file")?
            };
            if acquired {
                Ok(Some(LockFile {
                    state: PhantomData,
                    inner: self.inner,
                    path: self.path,
                }))
            } else {
                Ok(None)
            }
        })
        .await
        .context("join task")?
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Unlocked>| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Generate a temporary sibling path for the target, suitable for
/// rename-into-place commits.
pub fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

/// Ensure a directory (and its parents) exists.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("create directory {path:?}"))
}

/// Write a file atomically: the content lands under a temporary name in the
/// same directory and is renamed into place once fully written.
#[instrument(skip(content))]
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    let temp = temp_path(path);
    tokio::fs::write(&temp, content)
        .await
        .with_context(|| format!("write {temp:?}"))?;
    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!("failed to remove temp file {temp:?}: {err}");
            }
            Err(err).context(format!("rename {temp:?} to {path:?}"))
        }
    }
}

/// Copy a directory tree recursively, following the source's structure.
/// Symlinks are replicated as symlinks.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    spawn_blocking(move || copy_dir_recursive_blocking(&src, &dst))
        .await
        .context("join task")?
}

fn copy_dir_recursive_blocking(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create directory {dst:?}"))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read directory {src:?}"))? {
        let entry = entry.context("read directory entry")?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().context("stat directory entry")?;
        if file_type.is_dir() {
            copy_dir_recursive_blocking(&from, &to)?;
        } else if file_type.is_symlink() {
            let target =
                std::fs::read_link(&from).with_context(|| format!("read link {from:?}"))?;
            std::os::unix::fs::symlink(&target, &to)
                .with_context(|| format!("replicate symlink {from:?} -> {target:?}"))?;
        } else {
            std::fs::copy(&from, &to)
                .with_context(|| format!("copy {from:?} to {to:?}"))?;
        }
    }
    Ok(())
}

/// Stage `src` at `dst`: hardlink files when possible, fall back to a copy,
/// and copy directories recursively. With `force_copy` the hardlink attempt
/// is skipped so the destination is isolated from later cache mutations.
#[instrument]
pub async fn link_or_copy(src: &Path, dst: &Path, force_copy: bool) -> Result<()> {
    let meta = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("stat {src:?}"))?;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent).await?;
    }

    if meta.is_dir() {
        return copy_dir_recursive(src, dst).await;
    }

    if !force_copy {
        match tokio::fs::hard_link(src, dst).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                trace!(?src, ?dst, "hardlink failed, copying instead: {err}");
            }
        }
    }
    tokio::fs::copy(src, dst)
        .await
        .map(|_| ())
        .with_context(|| format!("copy {src:?} to {dst:?}"))
}

/// Resolve a path which may not (fully) exist yet by canonicalizing its
/// deepest existing ancestor and re-appending the remainder.
pub async fn resolve_lexically(path: &Path) -> Result<PathBuf> {
    let path = path.to_path_buf();
    spawn_blocking(move || {
        let mut existing = path.as_path();
        let mut remainder: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if existing.exists() {
                break;
            }
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    remainder.push(name);
                    existing = parent;
                }
                _ => bail!("path {path:?} has no existing ancestor"),
            }
        }
        let mut resolved = existing
            .canonicalize()
            .with_context(|| format!("canonicalize {existing:?}"))?;
        for part in remainder.into_iter().rev() {
            resolved.push(part);
        }
        Ok(normalize_components(&resolved))
    })
    .await
    .context("join task")?
}

fn normalize_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether `path` resolves inside `jail` once symlinks in existing ancestors
/// are followed.
pub async fn is_within(jail: &Path, path: &Path) -> Result<bool> {
    let jail = tokio::fs::canonicalize(jail)
        .await
        .with_context(|| format!("canonicalize {jail:?}"))?;
    let resolved = resolve_lexically(path).await?;
    Ok(resolved.starts_with(&jail))
}

/// Whether the path is a mount point (its device differs from its parent's).
pub async fn is_mount_point(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).context(format!("stat {path:?}")),
    };
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let parent_meta = tokio::fs::metadata(parent)
        .await
        .with_context(|| format!("stat {parent:?}"))?;
    Ok(meta.dev() != parent_meta.dev())
}

/// Create a directory with mode 1777, the way shared temp directories are
/// expected to be set up.
pub async fn world_writable_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    ensure_dir(path).await?;
    let perms = std::fs::Permissions::from_mode(0o1777);
    tokio::fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("set permissions on {path:?}"))
}

/// Move a tainted directory aside, naming the backup after the current time.
pub async fn move_aside(path: &Path) -> Result<PathBuf> {
    let stamp = jiff::Timestamp::now().as_second();
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!("_tainted_{stamp}"));
    let aside = PathBuf::from(aside);
    tokio::fs::rename(path, &aside)
        .await
        .with_context(|| format!("move tainted {path:?} aside"))?;
    Ok(aside)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn atomic_write_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("a/b/c.txt");
        atomic_write(&target, b"payload").await.unwrap();
        let content = tokio::fs::read(&target).await.unwrap();
        pretty_assert_eq!(content, b"payload");
    }

    #[tokio::test]
    async fn link_or_copy_directory() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        tokio::fs::create_dir_all(src.join("nested")).await.unwrap();
        tokio::fs::write(src.join("nested/file.txt"), b"data")
            .await
            .unwrap();

        let dst = temp.path().join("dst");
        link_or_copy(&src, &dst, true).await.unwrap();
        let content = tokio::fs::read(dst.join("nested/file.txt")).await.unwrap();
        pretty_assert_eq!(content, b"data");
    }

    #[tokio::test]
    async fn jail_check_rejects_escapes() {
        let temp = tempfile::tempdir().unwrap();
        let jail = temp.path().join("inputs");
        tokio::fs::create_dir_all(&jail).await.unwrap();

        assert!(is_within(&jail, &jail.join("fine.txt")).await.unwrap());
        assert!(
            !is_within(&jail, &jail.join("../escape.txt"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn jail_check_follows_symlinked_ancestors() {
        let temp = tempfile::tempdir().unwrap();
        let jail = temp.path().join("inputs");
        let outside = temp.path().join("outside");
        tokio::fs::create_dir_all(&jail).await.unwrap();
        tokio::fs::create_dir_all(&outside).await.unwrap();
        tokio::fs::symlink(&outside, jail.join("sneaky"))
            .await
            .unwrap();

        assert!(
            !is_within(&jail, &jail.join("sneaky/escape.txt"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn lockfile_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let lock_path = temp.path().join("test.lock");
        let lock = LockFile::open(&lock_path).await.unwrap();
        let locked = lock.lock().await.unwrap();

        // A second handle cannot acquire the lock while the first holds it.
        let other = LockFile::open(&lock_path).await.unwrap();
        assert!(other.try_lock().await.unwrap().is_none());

        locked.unlock().await.unwrap();
        let other = LockFile::open(&lock_path).await.unwrap();
        assert!(other.try_lock().await.unwrap().is_some());
    }
}
