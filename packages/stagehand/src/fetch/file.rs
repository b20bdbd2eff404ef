//! Local `file:` fetcher.

use std::path::Path;

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde_json::json;
use tracing::instrument;

use crate::fs;
use crate::types::{ContentKind, LicensedUri, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

pub struct FileFetcher;

#[async_trait]
impl SchemeFetcher for FileFetcher {
    fn schemes(&self) -> &[&'static str] {
        &["file"]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let url = url::Url::parse(&uri.uri).with_context(|| format!("parse {}", uri.uri))?;
        let Ok(source) = url.to_file_path() else {
            bail!("file URI {} has no usable path", uri.uri);
        };

        let meta = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("stat {source:?}"))?;
        let kind = if meta.is_dir() {
            ContentKind::Directory
        } else {
            ContentKind::File
        };

        fs::link_or_copy(&source, dest, false).await?;

        let metadata = UriMetadata::new(uri.uri.clone(), json!({ "source": source }));
        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}
