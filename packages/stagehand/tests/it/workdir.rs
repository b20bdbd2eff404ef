//! Working-directory lifecycle behaviors beyond the unit coverage.

use pretty_assertions::assert_eq as pretty_assert_eq;

use stagehand::workdir::{MountConfig, SetupOptions, Workdir};

fn plain_options() -> SetupOptions {
    SetupOptions {
        secure: false,
        paranoid: false,
        mount: MountConfig::default(),
        fail_ok: false,
    }
}

#[test_log::test(tokio::test)]
async fn temp_dir_is_world_writable() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().unwrap();
    let raw = temp.path().join("instance");
    let workdir = Workdir::setup(&raw, &plain_options()).await.unwrap();

    let mode = std::fs::metadata(raw.join(".TEMP"))
        .unwrap()
        .permissions()
        .mode();
    pretty_assert_eq!(mode & 0o7777, 0o1777);

    workdir.cleanup().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn reopening_after_cleanup_preserves_the_tree() {
    let temp = tempfile::tempdir().unwrap();
    let raw = temp.path().join("instance");

    let workdir = Workdir::setup(&raw, &plain_options()).await.unwrap();
    let layout = workdir.layout().unwrap().clone();
    layout.materialize().await.unwrap();
    tokio::fs::write(layout.inputs_dir.join("keep.txt"), b"sticky")
        .await
        .unwrap();
    workdir.cleanup().await.unwrap();

    let workdir = Workdir::setup(&raw, &plain_options()).await.unwrap();
    let layout = workdir.layout().unwrap();
    let body = tokio::fs::read(layout.inputs_dir.join("keep.txt"))
        .await
        .unwrap();
    pretty_assert_eq!(body, b"sticky");
    workdir.cleanup().await.unwrap();
}
