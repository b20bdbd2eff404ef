//! End-to-end lifecycle: stage, re-open, execute, export, and the
//! marshalled-state round-trip guarantees.

use pretty_assertions::assert_eq as pretty_assert_eq;

use stagehand::config::parse_staging_config;
use stagehand::instance::WorkflowInstance;
use stagehand::types::{EngineKind, ExitVal, SecurityContextTable, StageMark};
use stagehand::workdir;

use crate::{git_workflow_fixture, staging_definition, test_backend};

#[test_log::test(tokio::test)]
async fn stage_execute_export_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let (repo, tagged_commit) = git_workflow_fixture(temp.path());
    let backend = test_backend(&temp.path().join("home"));

    // Stage.
    let config = parse_staging_config(&staging_definition(&repo)).unwrap();
    let mut instance = WorkflowInstance::create(
        backend.clone(),
        config,
        SecurityContextTable::new(),
        None,
        false,
    )
    .await
    .unwrap();

    let mark = instance.stage_work_dir(false).await.unwrap();
    assert!(mark.is_complete(), "stage must be marshalled");
    pretty_assert_eq!(instance.engine_kind(), Some(EngineKind::Cwl));
    pretty_assert_eq!(
        instance.repo_effective_checkout(),
        Some(tagged_commit.as_str()),
        "the effective checkout is the commit the tag points at"
    );

    let raw_dir = instance.raw_dir().to_path_buf();
    for sub in ["workflow", "inputs", "outputs", "meta"] {
        assert!(raw_dir.join(sub).is_dir(), "{sub} directory must exist");
    }
    let stage_file = raw_dir.join("meta").join(workdir::STAGE_STATE_FILE);
    assert!(stage_file.is_file());
    let params_before = instance.materialized_params().unwrap().to_vec();
    instance.cleanup().await.unwrap();

    // Re-open: an independent controller reconstructs equal state from the
    // marshalled records alone.
    let mut reopened = WorkflowInstance::from_work_dir(backend.clone(), &raw_dir, false)
        .await
        .unwrap();
    let status = reopened.marshalling_status();
    assert!(status.config.is_some_and(|mark| mark.is_complete()));
    assert!(status.stage.is_some_and(|mark| mark.is_complete()));
    pretty_assert_eq!(
        reopened.materialized_params().unwrap().to_vec(),
        params_before
    );
    assert!(
        reopened.local_workflow().is_some(),
        "stage replay re-attaches a live engine and workflow"
    );

    // Idempotence: re-marshalling without overwrite leaves the record
    // untouched.
    let mtime_before = std::fs::metadata(&stage_file).unwrap().modified().unwrap();
    reopened.marshall_stage(true, false).await.unwrap();
    let mtime_after = std::fs::metadata(&stage_file).unwrap().modified().unwrap();
    pretty_assert_eq!(mtime_before, mtime_after);

    // Execute.
    let exit_val = reopened.execute_workflow(false).await.unwrap();
    pretty_assert_eq!(exit_val, ExitVal(0));
    let outputs = reopened.matched_outputs().unwrap();
    let result = outputs.iter().find(|output| output.name == "result").unwrap();
    pretty_assert_eq!(result.values.len(), 1);
    assert!(result.values[0].signature().is_some());
    assert!(
        raw_dir
            .join("meta")
            .join(workdir::EXECUTION_STATE_FILE)
            .is_file()
    );

    // Export, with credentials supplied at call time (they are never
    // persisted).
    let mut credentials = SecurityContextTable::new();
    let mut context = stagehand::types::SecurityContext::new();
    context.insert("token".into(), serde_yaml::Value::from("sekrit"));
    credentials.insert("repo1".into(), context);

    let (materialized, errors) = reopened
        .export_results(None, Some(&credentials), &[], false)
        .await
        .unwrap();
    assert!(errors.is_empty());
    pretty_assert_eq!(materialized.len(), 1);
    pretty_assert_eq!(materialized[0].pids[0].pid, "fake:1-items");

    let export_file = raw_dir.join("meta").join(workdir::EXPORT_STATE_FILE);
    let export_raw = std::fs::read_to_string(&export_file).unwrap();
    assert!(export_raw.contains("fake:1-items"));
    assert!(
        !export_raw.contains("sekrit"),
        "credentials must never be persisted"
    );
    reopened.cleanup().await.unwrap();

    // Execution state replays on a third open.
    let mut third = WorkflowInstance::from_work_dir(backend, &raw_dir, false)
        .await
        .unwrap();
    pretty_assert_eq!(third.exit_val(), Some(ExitVal(0)));
    let status = third.marshalling_status();
    assert!(status.execution.is_some_and(|mark| mark.is_complete()));
    assert!(status.export.is_some_and(|mark| mark.is_complete()));

    // Crates can be emitted offline from the replayed state.
    let crate_path = third.create_execution_crate(None).await.unwrap();
    assert!(crate_path.is_file());
    third.cleanup().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn injection_continues_the_input_sequence() {
    let temp = tempfile::tempdir().unwrap();
    let (repo, _) = git_workflow_fixture(temp.path());
    let backend = test_backend(&temp.path().join("home"));

    let extra = temp.path().join("extra.bed");
    tokio::fs::write(&extra, b"chr1\t0\t100\n").await.unwrap();

    let config = parse_staging_config(&staging_definition(&repo)).unwrap();
    let mut instance = WorkflowInstance::create(
        backend,
        config,
        SecurityContextTable::new(),
        None,
        false,
    )
    .await
    .unwrap();
    instance.stage_work_dir(false).await.unwrap();

    let injected = instance.inject_inputs(&[extra], false).await.unwrap();
    pretty_assert_eq!(injected.len(), 1);
    assert!(
        injected[0].pretty_filename.ends_with("_extra.bed"),
        "injected inputs are sequence-prefixed: {}",
        injected[0].pretty_filename
    );
    assert!(injected[0].local_path.starts_with(instance.raw_dir()));
    instance.cleanup().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn export_without_credentials_reports_the_action() {
    let temp = tempfile::tempdir().unwrap();
    let (repo, _) = git_workflow_fixture(temp.path());
    let backend = test_backend(&temp.path().join("home"));

    let config = parse_staging_config(&staging_definition(&repo)).unwrap();
    let mut instance = WorkflowInstance::create(
        backend,
        config,
        SecurityContextTable::new(),
        None,
        false,
    )
    .await
    .unwrap();
    instance.stage_work_dir(false).await.unwrap();
    instance.execute_workflow(false).await.unwrap();

    // The action names context repo1, but no credentials were supplied at
    // export time.
    let (materialized, errors) = instance
        .export_results(None, None, &[], true)
        .await
        .unwrap();
    assert!(materialized.is_empty());
    pretty_assert_eq!(errors.len(), 1);
    instance.cleanup().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn reopening_an_unstaged_dir_is_damage() {
    let temp = tempfile::tempdir().unwrap();
    let backend = test_backend(&temp.path().join("home"));

    let raw_dir = temp.path().join("not-an-instance");
    std::fs::create_dir_all(&raw_dir).unwrap();

    // Strict re-open refuses.
    let err = WorkflowInstance::from_work_dir(backend.clone(), &raw_dir, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("incomplete"));

    // Lenient re-open flags the instance damaged and stops.
    let instance = WorkflowInstance::from_work_dir(backend, &raw_dir, true)
        .await
        .unwrap();
    assert!(instance.is_damaged());
    let status = instance.marshalling_status();
    pretty_assert_eq!(status.config, Some(StageMark::Damaged(false)));
    instance.cleanup().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn staged_instance_restages_offline_from_shared_cache() {
    let temp = tempfile::tempdir().unwrap();
    let (repo, _) = git_workflow_fixture(temp.path());
    // Both instances share one backend home, hence one cache.
    let backend = test_backend(&temp.path().join("home"));

    let definition = format!(
        r#"workflow_id: "git+file://{repo}#v1"
workflow_config:
  secure: false
params:
  reference:
    c-l-a-s-s: File
    url: "file://{repo}/main.cwl"
outputs: {{}}
"#,
        repo = repo.display()
    );

    let config = parse_staging_config(&definition).unwrap();
    let mut first = WorkflowInstance::create(
        backend.clone(),
        config.clone(),
        SecurityContextTable::new(),
        None,
        false,
    )
    .await
    .unwrap();
    first.stage_work_dir(false).await.unwrap();
    first.cleanup().await.unwrap();

    // A second instance in another raw directory, offline: everything must
    // come from the shared cache without touching the network (or, here,
    // re-reading the sources).
    let mut second = WorkflowInstance::create(
        backend,
        config,
        SecurityContextTable::new(),
        None,
        false,
    )
    .await
    .unwrap();
    let mark = second.stage_work_dir(true).await.unwrap();
    assert!(mark.is_complete());
    second.cleanup().await.unwrap();
}
