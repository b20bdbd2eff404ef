//! Staging behaviors that span the cache and the inputs tree.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq as pretty_assert_eq;
use url::Url;

use stagehand::cache::CacheHandler;
use stagehand::fetch::FetcherRegistry;
use stagehand::stager::InputStager;
use stagehand::types::{InputValue, SecurityContextTable};

struct Fixture {
    _temp: tempfile::TempDir,
    cache: CacheHandler,
    inputs_dir: std::path::PathBuf,
    outputs_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let inputs_dir = temp.path().join("inputs");
    let outputs_dir = temp.path().join("outputs");
    std::fs::create_dir_all(&inputs_dir).unwrap();
    std::fs::create_dir_all(&outputs_dir).unwrap();
    let cache = CacheHandler::new(
        temp.path().join("cache"),
        FetcherRegistry::with_defaults(reqwest::Client::new()),
    );
    Fixture {
        _temp: temp,
        cache,
        inputs_dir,
        outputs_dir,
    }
}

#[test_log::test(tokio::test)]
async fn relative_dir_places_inputs_in_subtrees() {
    let fixture = fixture();
    let source = fixture._temp.path().join("reads.fq");
    tokio::fs::write(&source, b"@read1\nACGT\n+\nFFFF\n")
        .await
        .unwrap();

    let credentials = SecurityContextTable::new();
    let stager = InputStager::new(
        &fixture.cache,
        &fixture.inputs_dir,
        &fixture.outputs_dir,
        &credentials,
        false,
    );

    let params: serde_yaml::Value = serde_yaml::from_str(&format!(
        "reads:\n  c-l-a-s-s: File\n  url: \"{}\"\n  relative-dir: lane1\n",
        Url::from_file_path(&source).unwrap()
    ))
    .unwrap();
    let (inputs, _) = stager.materialize(&params, false).await.unwrap();

    let InputValue::Content(content) = &inputs[0].values[0] else {
        panic!("expected staged content");
    };
    assert!(content.local_path.starts_with(fixture.inputs_dir.join("lane1")));
}

#[test_log::test(tokio::test)]
async fn secondary_urls_stage_alongside_the_primary() {
    let fixture = fixture();
    let primary = fixture._temp.path().join("genome.fa");
    let index = fixture._temp.path().join("genome.fa.fai");
    tokio::fs::write(&primary, b">chr1\nACGT\n").await.unwrap();
    tokio::fs::write(&index, b"chr1\t4\n").await.unwrap();

    let credentials = SecurityContextTable::new();
    let stager = InputStager::new(
        &fixture.cache,
        &fixture.inputs_dir,
        &fixture.outputs_dir,
        &credentials,
        false,
    );

    let params: serde_yaml::Value = serde_yaml::from_str(&format!(
        "genome:\n  c-l-a-s-s: File\n  url: \"{}\"\n  secondary-urls:\n    - \"{}\"\n",
        Url::from_file_path(&primary).unwrap(),
        Url::from_file_path(&index).unwrap(),
    ))
    .unwrap();
    let (inputs, _) = stager.materialize(&params, false).await.unwrap();

    pretty_assert_eq!(inputs.len(), 1);
    pretty_assert_eq!(inputs[0].values.len(), 1);
    let secondary = inputs[0].secondary_inputs.as_ref().unwrap();
    pretty_assert_eq!(secondary.len(), 1);
    pretty_assert_eq!(secondary[0].pretty_filename.contains("genome.fa.fai"), true);
}

#[test_log::test(tokio::test)]
async fn licensed_uri_objects_carry_licences_through() {
    let fixture = fixture();
    let source = fixture._temp.path().join("table.csv");
    tokio::fs::write(&source, b"a,b\n1,2\n").await.unwrap();

    let credentials = SecurityContextTable::new();
    let stager = InputStager::new(
        &fixture.cache,
        &fixture.inputs_dir,
        &fixture.outputs_dir,
        &credentials,
        false,
    );

    let params: serde_yaml::Value = serde_yaml::from_str(&format!(
        r#"table:
  c-l-a-s-s: File
  url:
    uri: "{}"
    licences:
      - "https://spdx.org/licenses/CC-BY-4.0"
    attributions:
      - who: "Example Lab"
        roles: ["author"]
"#,
        Url::from_file_path(&source).unwrap()
    ))
    .unwrap();
    let (inputs, _) = stager.materialize(&params, false).await.unwrap();

    let InputValue::Content(content) = &inputs[0].values[0] else {
        panic!("expected staged content");
    };
    pretty_assert_eq!(
        content.licensed_uri.licences,
        vec!["https://spdx.org/licenses/CC-BY-4.0".to_string()]
    );
    pretty_assert_eq!(content.licensed_uri.attributions[0].who, "Example Lab");
}

#[test_log::test(tokio::test)]
async fn injected_inputs_always_harden() {
    let fixture = fixture();
    // Two distinct files sharing a basename, the case injection exists
    // to keep apart.
    let dir_a = fixture._temp.path().join("a");
    let dir_b = fixture._temp.path().join("b");
    tokio::fs::create_dir_all(&dir_a).await.unwrap();
    tokio::fs::create_dir_all(&dir_b).await.unwrap();
    tokio::fs::write(dir_a.join("sample.txt"), b"aaa").await.unwrap();
    tokio::fs::write(dir_b.join("sample.txt"), b"bbb").await.unwrap();

    let credentials = SecurityContextTable::new();
    let stager = InputStager::new(
        &fixture.cache,
        &fixture.inputs_dir,
        &fixture.outputs_dir,
        &credentials,
        false,
    );

    let (staged, last_input) = stager
        .inject_inputs(
            &[dir_a.join("sample.txt"), dir_b.join("sample.txt")],
            false,
            0,
        )
        .await
        .unwrap();

    pretty_assert_eq!(last_input, 2);
    pretty_assert_eq!(staged.len(), 2);
    // Every injected input carries its sequence prefix, not only the
    // colliding one.
    pretty_assert_eq!(staged[0].pretty_filename, "1_sample.txt");
    pretty_assert_eq!(staged[1].pretty_filename, "2_sample.txt");
    assert_ne!(staged[0].local_path, staged[1].local_path);
    for content in &staged {
        assert!(content.local_path.starts_with(&fixture.inputs_dir));
        assert!(content.licensed_uri.uri.starts_with("file://"));
    }
}

#[test_log::test(tokio::test)]
async fn placeholder_expansion_reaches_fetched_uris() {
    let fixture = fixture();
    let source = fixture._temp.path().join("GRCh38.fa");
    tokio::fs::write(&source, b">chr1\nACGT\n").await.unwrap();

    let base = Url::from_file_path(fixture._temp.path()).unwrap();
    let params: serde_yaml::Value = serde_yaml::from_str(&format!(
        "genome:\n  c-l-a-s-s: File\n  url: \"{base}/{{assembly}}.fa\"\n"
    ))
    .unwrap();

    let table: BTreeMap<String, String> =
        [("assembly".to_string(), "GRCh38".to_string())].into();
    let formatted = stagehand::stager::format_params(&params, &table).unwrap();

    let credentials = SecurityContextTable::new();
    let stager = InputStager::new(
        &fixture.cache,
        &fixture.inputs_dir,
        &fixture.outputs_dir,
        &credentials,
        false,
    );
    let (inputs, _) = stager.materialize(&formatted, false).await.unwrap();

    let InputValue::Content(content) = &inputs[0].values[0] else {
        panic!("expected staged content");
    };
    assert!(content.licensed_uri.uri.ends_with("/GRCh38.fa"));
}
