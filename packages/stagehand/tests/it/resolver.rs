//! Resolution against on-disk fixtures (no live TRS endpoint needed).

use pretty_assertions::assert_eq as pretty_assert_eq;

use stagehand::cache::CacheHandler;
use stagehand::error::ConfigError;
use stagehand::fetch::FetcherRegistry;
use stagehand::resolver::{ResolveRequest, WorkflowResolver, identify_from_rocrate_dir};
use stagehand::types::EngineKind;

fn cache(dir: &std::path::Path) -> CacheHandler {
    CacheHandler::new(dir, FetcherRegistry::with_defaults(reqwest::Client::new()))
}

#[test_log::test(tokio::test)]
async fn absolute_repo_urls_bypass_trs() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache(&temp.path().join("cache"));
    let resolver = WorkflowResolver::new(&cache);

    let resolved = resolver
        .resolve(&ResolveRequest {
            workflow_id: "https://github.com/org/repo.git",
            version_id: Some("v1.2"),
            descriptor_type: None,
            trs_endpoint: None,
            meta_dir: temp.path(),
            offline: true,
        })
        .await
        .unwrap();

    pretty_assert_eq!(resolved.engine, None);
    pretty_assert_eq!(resolved.repo.repo_url, "https://github.com/org/repo.git");
    pretty_assert_eq!(resolved.repo.tag.as_deref(), Some("v1.2"));
}

#[test_log::test(tokio::test)]
async fn opaque_id_without_endpoint_is_a_config_error() {
    let temp = tempfile::tempdir().unwrap();
    let cache = cache(&temp.path().join("cache"));
    let resolver = WorkflowResolver::new(&cache);

    let err = resolver
        .resolve(&ResolveRequest {
            workflow_id: "21",
            version_id: Some("1"),
            descriptor_type: None,
            trs_endpoint: None,
            meta_dir: temp.path(),
            offline: true,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::MissingTrsEndpoint { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn expanded_crate_on_disk_identifies_its_engine() {
    let temp = tempfile::tempdir().unwrap();
    let crate_dir = temp.path().join("crate");
    tokio::fs::create_dir_all(&crate_dir).await.unwrap();

    let metadata = serde_json::json!({
        "@context": "https://w3id.org/ro/crate/1.1/context",
        "@graph": [
            {
                "@id": "ro-crate-metadata.json",
                "@type": "CreativeWork",
                "about": {"@id": "./"}
            },
            {
                "@id": "./",
                "@type": "Dataset",
                "mainEntity": {"@id": "main.nf"},
                "isBasedOn": "https://github.com/org/pipeline/tree/2.1.0"
            },
            {
                "@id": "main.nf",
                "@type": ["File", "ComputationalWorkflow"],
                "programmingLanguage": {"@id": "#nextflow"}
            },
            {
                "@id": "#nextflow",
                "@type": "ComputerLanguage",
                "identifier": {"@id": "https://www.nextflow.io/"},
                "url": {"@id": "https://www.nextflow.io/"}
            }
        ]
    });
    tokio::fs::write(
        crate_dir.join("ro-crate-metadata.json"),
        serde_json::to_vec_pretty(&metadata).unwrap(),
    )
    .await
    .unwrap();

    let identified = identify_from_rocrate_dir(&crate_dir, None).await.unwrap();
    pretty_assert_eq!(identified.workflow_type, EngineKind::Nextflow);
    pretty_assert_eq!(
        identified.remote_repo.repo_url,
        "https://github.com/org/pipeline.git"
    );
    pretty_assert_eq!(identified.remote_repo.tag.as_deref(), Some("2.1.0"));
}
