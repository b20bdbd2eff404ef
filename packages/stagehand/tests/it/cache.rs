//! Cross-process-shaped cache behavior: two handlers sharing one directory.

use pretty_assertions::assert_eq as pretty_assert_eq;

use stagehand::cache::{CacheHandler, CacheType};
use stagehand::error::FetchError;
use stagehand::fetch::FetcherRegistry;
use stagehand::types::LicensedUri;

fn handler(cache_dir: &std::path::Path) -> CacheHandler {
    CacheHandler::new(
        cache_dir,
        FetcherRegistry::with_defaults(reqwest::Client::new()),
    )
}

#[test_log::test(tokio::test)]
async fn a_second_handler_reads_offline_what_the_first_fetched() {
    let temp = tempfile::tempdir().unwrap();
    let shared = temp.path().join("shared-cache");

    let writer = handler(&shared);
    let uri = LicensedUri::new("data:,shared-payload");
    writer.fetch(&uri, CacheType::Input, false).await.unwrap();

    // A different handler over the same directory, strictly offline.
    let reader = handler(&shared);
    let fetched = reader.fetch(&uri, CacheType::Input, true).await.unwrap();
    let body = tokio::fs::read(&fetched.local_path).await.unwrap();
    pretty_assert_eq!(body, b"shared-payload");
}

#[test_log::test(tokio::test)]
async fn cache_types_are_separate_namespaces() {
    let temp = tempfile::tempdir().unwrap();
    let cache = handler(&temp.path().join("cache"));
    let uri = LicensedUri::new("data:,typed");

    cache.fetch(&uri, CacheType::Input, false).await.unwrap();
    let err = cache.fetch(&uri, CacheType::Workflow, true).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::CacheMiss { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn concurrent_fetches_of_one_key_converge() {
    let temp = tempfile::tempdir().unwrap();
    let cache = std::sync::Arc::new(handler(&temp.path().join("cache")));
    let uri = LicensedUri::new("data:,contended");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = std::sync::Arc::clone(&cache);
            let uri = uri.clone();
            tokio::spawn(async move { cache.fetch(&uri, CacheType::Input, false).await })
        })
        .collect();

    let mut paths = Vec::new();
    for task in tasks {
        let fetched = task.await.unwrap().unwrap();
        paths.push(fetched.local_path);
    }
    paths.dedup();
    pretty_assert_eq!(paths.len(), 1, "all callers see the same committed entry");
}
