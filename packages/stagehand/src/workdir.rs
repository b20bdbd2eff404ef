//! Per-instance working directory lifecycle.
//!
//! An instance owns one raw directory on disk. The working tree is either
//! the raw directory itself or, for secure or paranoid enactments, an
//! encrypted FUSE overlay: ciphertext under `.crypt`, plaintext mounted at
//! `work`, passphrase at `.passphrase`. While a mount is live a background
//! liveness task touches it on a fixed interval so idle-unmount timers never
//! fire mid-run; teardown signals the task, joins it, and unmounts lazily so
//! residual handles cannot wedge shutdown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::SetupError;
use crate::fs::{self, LockFile, Locked};
use crate::process::{self, Limits};

pub const PASSPHRASE_FILE: &str = ".passphrase";
pub const CRYPT_DIR: &str = ".crypt";
pub const WORK_DIR: &str = "work";
pub const TEMP_DIR: &str = ".TEMP";
pub const OWNER_LOCK_FILE: &str = ".stagehand.lock";

pub const INPUTS_DIR: &str = "inputs";
pub const INTERMEDIATE_DIR: &str = "intermediate";
pub const OUTPUTS_DIR: &str = "outputs";
pub const ENGINE_TWEAKS_DIR: &str = "engineTweaks";
pub const WORKFLOW_DIR: &str = "workflow";
pub const CONSOLIDATED_WORKFLOW_DIR: &str = "consolidated-workflow";
pub const CONTAINERS_DIR: &str = "containers";
pub const META_DIR: &str = "meta";

pub const WORKFLOW_META_FILE: &str = "workflow_meta.yaml";
pub const STAGE_STATE_FILE: &str = "stage-state.yaml";
pub const EXECUTION_STATE_FILE: &str = "execution-state.yaml";
pub const EXPORT_STATE_FILE: &str = "export-state.yaml";
pub const TRS_METADATA_FILE: &str = "trs_metadata.json";
pub const TRS_RESULT_FILE: &str = "trs_result.json";

const FUSE_SYSTEM_CONF: &str = "/etc/fuse.conf";

/// How often the liveness task touches the mount. Half of the smallest
/// idle-unmount timeout we configure, so the mount can never expire between
/// touches.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// The pluggable encrypted-filesystem implementations.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumString, Serialize, Deserialize,
)]
pub enum EncryptedFsKind {
    #[strum(serialize = "encfs")]
    #[serde(rename = "encfs")]
    EncFs,
    #[strum(serialize = "gocryptfs")]
    #[serde(rename = "gocryptfs")]
    GoCryptFs,
}

/// Host-level mount configuration, shared by every instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountConfig {
    pub kind: EncryptedFsKind,
    pub fusermount_cmd: String,
    /// Idle minutes before the filesystem would auto-unmount.
    pub idle_minutes: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            kind: EncryptedFsKind::GoCryptFs,
            fusermount_cmd: "fusermount".into(),
            idle_minutes: 5,
        }
    }
}

/// All instance-scoped paths once the working tree is usable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkdirLayout {
    pub work_dir: PathBuf,
    pub inputs_dir: PathBuf,
    pub intermediate_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub engine_tweaks_dir: PathBuf,
    pub workflow_dir: PathBuf,
    pub consolidated_workflow_dir: PathBuf,
    pub containers_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl WorkdirLayout {
    fn of(work_dir: &Path, temp_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            inputs_dir: work_dir.join(INPUTS_DIR),
            intermediate_dir: work_dir.join(INTERMEDIATE_DIR),
            outputs_dir: work_dir.join(OUTPUTS_DIR),
            engine_tweaks_dir: work_dir.join(ENGINE_TWEAKS_DIR),
            workflow_dir: work_dir.join(WORKFLOW_DIR),
            consolidated_workflow_dir: work_dir.join(CONSOLIDATED_WORKFLOW_DIR),
            containers_dir: work_dir.join(CONTAINERS_DIR),
            meta_dir: work_dir.join(META_DIR),
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    /// Create the directories the stager and engine expect to exist.
    pub async fn materialize(&self) -> Result<()> {
        for dir in [
            &self.inputs_dir,
            &self.intermediate_dir,
            &self.outputs_dir,
            &self.engine_tweaks_dir,
        ] {
            fs::ensure_dir(dir).await?;
        }
        Ok(())
    }

    pub fn meta_file(&self, name: &str) -> PathBuf {
        self.meta_dir.join(name)
    }
}

/// Background task keeping an encrypted mount alive.
///
/// The task sleeps on a watch channel with a fixed timeout; every wakeup
/// stats the mount point. Shutdown sends through the channel and joins the
/// task, which is the single long-lived background job in the core.
#[derive(Debug)]
pub struct MountKeepalive {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MountKeepalive {
    pub fn spawn(mount_point: PathBuf) -> Self {
        Self::spawn_with_interval(mount_point, KEEPALIVE_INTERVAL)
    }

    pub fn spawn_with_interval(mount_point: PathBuf, interval: Duration) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(interval, signal.changed()).await {
                    // Shutdown requested, or the sender is gone.
                    Ok(Ok(())) if *signal.borrow() => break,
                    Ok(Err(_)) => break,
                    Ok(Ok(())) => continue,
                    // Timed out: touch the mount so it stays warm.
                    Err(_) => {
                        if let Err(err) = tokio::fs::metadata(&mount_point).await {
                            warn!(?mount_point, "liveness stat failed: {err}");
                        }
                    }
                }
            }
            debug!(?mount_point, "mount keepalive stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal the task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!("mount keepalive task panicked: {err}");
        }
    }
}

/// A live encrypted overlay.
#[derive(Debug)]
struct MountedOverlay {
    mount_point: PathBuf,
    fusermount_cmd: String,
    keepalive: Option<MountKeepalive>,
}

/// Options governing one workdir setup.
#[derive(Clone, Debug)]
pub struct SetupOptions {
    /// Provision the encrypted overlay.
    pub secure: bool,
    /// Paranoid instances are always encrypted and never consult
    /// `user_allow_other`.
    pub paranoid: bool,
    pub mount: MountConfig,
    /// On mount failure, flag the instance damaged instead of failing.
    pub fail_ok: bool,
}

/// The per-instance working directory, with its ownership lock held for as
/// long as this value lives.
#[derive(Debug)]
pub struct Workdir {
    raw_dir: PathBuf,
    layout: Option<WorkdirLayout>,
    overlay: Option<MountedOverlay>,
    allow_other: bool,
    is_encrypted: bool,
    is_damaged: bool,
    _owner_lock: LockFile<Locked>,
}

impl Workdir {
    /// Provision (or re-open) the working tree under `raw_dir`.
    #[instrument(skip(options))]
    pub async fn setup(raw_dir: &Path, options: &SetupOptions) -> Result<Self> {
        fs::ensure_dir(raw_dir).await?;

        // The raw directory is owned by at most one live instance.
        let owner_lock = LockFile::open(raw_dir.join(OWNER_LOCK_FILE)).await?;
        let owner_lock = match owner_lock.try_lock().await? {
            Some(locked) => locked,
            None => {
                return Err(SetupError::WorkdirBusy {
                    raw_dir: raw_dir.to_path_buf(),
                }
                .into());
            }
        };

        let temp_dir = raw_dir.join(TEMP_DIR);
        fs::world_writable_dir(&temp_dir).await?;

        let secure = options.secure || options.paranoid;
        let mut allow_other = false;
        let mut overlay = None;
        let mut is_damaged = false;

        let work_dir = if secure {
            if !options.paranoid {
                allow_other = fuse_user_allow_other().await;
                debug!(allow_other, "FUSE user_allow_other");
            }

            let crypt_dir = raw_dir.join(CRYPT_DIR);
            let mount_point = raw_dir.join(WORK_DIR);
            fs::ensure_dir(&crypt_dir).await?;
            fs::ensure_dir(&mount_point).await?;

            let passphrase_file = raw_dir.join(PASSPHRASE_FILE);
            if !tokio::fs::try_exists(&passphrase_file).await.unwrap_or(false) {
                generate_passphrase(&passphrase_file).await?;
            }

            if fs::is_mount_point(&mount_point).await? {
                // Mounted by someone else; usable, but not ours to unmount.
                warn!(?mount_point, "destination mount point is already in use");
            } else {
                // A non-empty plaintext directory means leftovers from an
                // earlier run that did not unmount cleanly; move it aside.
                if dir_is_tainted(&mount_point).await? {
                    warn!(?mount_point, "destination mount point is tainted, moving");
                    fs::move_aside(&mount_point).await?;
                    fs::ensure_dir(&mount_point).await?;
                }

                match mount_overlay(
                    &options.mount,
                    &crypt_dir,
                    &mount_point,
                    &passphrase_file,
                    allow_other,
                )
                .await
                {
                    Ok(()) => {
                        overlay = Some(MountedOverlay {
                            mount_point: mount_point.clone(),
                            fusermount_cmd: options.mount.fusermount_cmd.clone(),
                            keepalive: Some(MountKeepalive::spawn(mount_point.clone())),
                        });
                    }
                    Err(err) => {
                        error!(?mount_point, "cannot mount encrypted overlay: {err:#}");
                        if !options.fail_ok {
                            return Err(err.wrap_err(SetupError::MountFailed {
                                mount_point: mount_point.clone(),
                                command: options.mount.kind.to_string(),
                            }));
                        }
                        is_damaged = true;
                    }
                }
            }
            mount_point
        } else {
            raw_dir.to_path_buf()
        };

        let layout = if is_damaged {
            None
        } else {
            Some(WorkdirLayout::of(&work_dir, &temp_dir))
        };

        Ok(Self {
            raw_dir: raw_dir.to_path_buf(),
            layout,
            overlay,
            allow_other,
            is_encrypted: secure,
            is_damaged,
            _owner_lock: owner_lock,
        })
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn layout(&self) -> Option<&WorkdirLayout> {
        self.layout.as_ref()
    }

    pub fn allow_other(&self) -> bool {
        self.allow_other
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    pub fn is_damaged(&self) -> bool {
        self.is_damaged
    }

    pub fn mark_damaged(&mut self) {
        self.is_damaged = true;
    }

    /// Whether a passphrase file exists, i.e. the instance was provisioned
    /// with an encrypted working tree at some point.
    pub async fn has_passphrase(raw_dir: &Path) -> bool {
        tokio::fs::try_exists(raw_dir.join(PASSPHRASE_FILE))
            .await
            .unwrap_or(false)
    }

    /// Stop the liveness task and unmount the overlay, lazily, so stray
    /// file handles cannot keep the ciphertext exposed.
    #[instrument(skip(self))]
    pub async fn unmount(&mut self) -> Result<()> {
        let Some(overlay) = self.overlay.take() else {
            return Ok(());
        };

        if let Some(keepalive) = overlay.keepalive {
            keepalive.shutdown().await;
        }

        if fs::is_mount_point(&overlay.mount_point).await? {
            let mut cmd = Command::new(&overlay.fusermount_cmd);
            cmd.arg("-u").arg("-z").arg(&overlay.mount_point);
            process::run_checked(cmd, "fusermount", Limits::default())
                .await
                .map_err(|err| {
                    err.wrap_err(SetupError::UnmountFailed {
                        mount_point: overlay.mount_point.clone(),
                        exit: None,
                    })
                })?;
        }
        Ok(())
    }

    /// Unmount and release the raw directory.
    pub async fn cleanup(mut self) -> Result<()> {
        self.unmount().await
    }
}

async fn dir_is_tainted(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("scan {dir:?}"))?;
    Ok(entries.next_entry().await.context("scan entry")?.is_some())
}

async fn fuse_user_allow_other() -> bool {
    match tokio::fs::read_to_string(FUSE_SYSTEM_CONF).await {
        Ok(conf) => conf
            .lines()
            .any(|line| line.trim_start().starts_with("user_allow_other")),
        Err(_) => false,
    }
}

/// Generate a fresh passphrase, stored with owner-only permissions.
async fn generate_passphrase(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let passphrase: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    fs::atomic_write(path, passphrase.as_bytes()).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("restrict permissions on {path:?}"))
}

async fn read_passphrase(path: &Path) -> Result<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read passphrase {path:?}"))?;
    Ok(raw.trim().to_string())
}

#[instrument(skip(passphrase_file))]
async fn mount_overlay(
    config: &MountConfig,
    crypt_dir: &Path,
    mount_point: &Path,
    passphrase_file: &Path,
    allow_other: bool,
) -> Result<()> {
    match config.kind {
        EncryptedFsKind::EncFs => {
            let passphrase = read_passphrase(passphrase_file).await?;
            let mut cmd = Command::new("encfs");
            cmd.arg("--stdinpass")
                .arg(format!("--idle={}", config.idle_minutes));
            cmd.arg(crypt_dir).arg(mount_point);
            if allow_other {
                cmd.args(["--", "-o", "allow_other"]);
            }
            run_with_stdin(cmd, "encfs mount", &passphrase).await
        }
        EncryptedFsKind::GoCryptFs => {
            let initialized = tokio::fs::try_exists(crypt_dir.join("gocryptfs.conf"))
                .await
                .unwrap_or(false);
            if !initialized {
                let mut init = Command::new("gocryptfs");
                init.args(["-init", "-q", "-passfile"])
                    .arg(passphrase_file)
                    .arg(crypt_dir);
                process::run_checked(init, "gocryptfs init", Limits::default())
                    .await
                    .context("initialize gocryptfs ciphertext directory")?;
            }

            let mut mount = Command::new("gocryptfs");
            mount
                .args(["-q", "-passfile"])
                .arg(passphrase_file)
                .args(["-i", &format!("{}m", config.idle_minutes)]);
            if allow_other {
                mount.arg("-allow_other");
            }
            mount.arg(crypt_dir).arg(mount_point);
            process::run_checked(mount, "gocryptfs mount", Limits::default())
                .await
                .map(|_| ())
        }
    }
}

async fn run_with_stdin(mut cmd: Command, what: &str, input: &str) -> Result<()> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("could not spawn {what}: is the binary installed and in PATH?"))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .with_context(|| format!("write stdin of {what}"))?;
        drop(stdin);
    }
    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("could not complete {what}"))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(eyre!(
            "{what} exited with status {}:\n{}",
            output.status,
            stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn plain_options() -> SetupOptions {
        SetupOptions {
            secure: false,
            paranoid: false,
            mount: MountConfig::default(),
            fail_ok: false,
        }
    }

    #[tokio::test]
    async fn plain_setup_uses_raw_dir_directly() {
        let temp = tempfile::tempdir().unwrap();
        let raw = temp.path().join("instance");
        let workdir = Workdir::setup(&raw, &plain_options()).await.unwrap();

        let layout = workdir.layout().unwrap().clone();
        pretty_assert_eq!(layout.work_dir, raw);
        layout.materialize().await.unwrap();
        assert!(layout.inputs_dir.is_dir());
        assert!(layout.outputs_dir.is_dir());
        assert!(raw.join(TEMP_DIR).is_dir());
        assert!(!workdir.is_encrypted());

        workdir.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn raw_dir_is_single_owner() {
        let temp = tempfile::tempdir().unwrap();
        let raw = temp.path().join("instance");
        let first = Workdir::setup(&raw, &plain_options()).await.unwrap();

        let err = Workdir::setup(&raw, &plain_options()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::WorkdirBusy { .. })
        ));

        first.cleanup().await.unwrap();
        let second = Workdir::setup(&raw, &plain_options()).await.unwrap();
        second.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn keepalive_shutdown_is_deterministic() {
        let temp = tempfile::tempdir().unwrap();
        let keepalive = MountKeepalive::spawn_with_interval(
            temp.path().to_path_buf(),
            Duration::from_millis(10),
        );
        // Let it take a few liveness laps before tearing it down.
        tokio::time::sleep(Duration::from_millis(35)).await;
        keepalive.shutdown().await;
    }

    #[tokio::test]
    async fn passphrase_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join(PASSPHRASE_FILE);
        generate_passphrase(&path).await.unwrap();

        let passphrase = read_passphrase(&path).await.unwrap();
        pretty_assert_eq!(passphrase.len(), 48);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        pretty_assert_eq!(mode & 0o777, 0o600);
    }
}
