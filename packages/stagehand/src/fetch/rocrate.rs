//! RO-Crate archive fetcher (`ro-crate-zip:` scheme).
//!
//! The canonical form wraps the download URL of a zipped crate, e.g.
//! `ro-crate-zip:https://host/.../files?format=zip`. The fetcher downloads
//! the archive and expands it into the destination directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tracing::instrument;

use crate::error::FetchError;
use crate::fs;
use crate::types::{ContentKind, LicensedUri, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

/// Scheme prefix for zipped RO-Crate URIs.
pub const RO_CRATE_ZIP_SCHEME: &str = "ro-crate-zip";

/// Expand a zip archive into a directory.
pub async fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    spawn_blocking(move || -> Result<()> {
        let file =
            std::fs::File::open(&archive).with_context(|| format!("open archive {archive:?}"))?;
        let mut zip =
            zip::ZipArchive::new(file).with_context(|| format!("read archive {archive:?}"))?;
        zip.extract(&dest)
            .with_context(|| format!("extract {archive:?} into {dest:?}"))
    })
    .await
    .context("join task")?
}

pub struct RoCrateZipFetcher {
    client: reqwest::Client,
}

impl RoCrateZipFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, uri: &str, target: &Path) -> Result<()> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .with_context(|| format!("GET {uri}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                uri: uri.to_string(),
            }
            .into());
        }
        let mut file = tokio::fs::File::create(target)
            .await
            .with_context(|| format!("create {target:?}"))?;
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("read body of {uri}"))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {target:?}"))?;
        }
        file.flush().await.context("flush download")
    }
}

#[async_trait]
impl SchemeFetcher for RoCrateZipFetcher {
    fn schemes(&self) -> &[&'static str] {
        &[RO_CRATE_ZIP_SCHEME]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let Some(inner) = uri.uri.strip_prefix("ro-crate-zip:") else {
            bail!("not an ro-crate-zip URI: {}", uri.uri);
        };

        let archive: PathBuf = fs::temp_path(dest);
        let downloaded = if inner.starts_with("http://") || inner.starts_with("https://") {
            self.download(inner, &archive).await?;
            true
        } else if let Some(local) = inner.strip_prefix("file://") {
            tokio::fs::copy(local, &archive)
                .await
                .with_context(|| format!("copy local crate archive {local:?}"))?;
            true
        } else {
            bail!("unsupported inner URI for ro-crate-zip: {inner}");
        };

        fs::ensure_dir(dest).await?;
        let result = extract_zip(&archive, dest).await;
        if downloaded {
            let _ = tokio::fs::remove_file(&archive).await;
        }
        result?;

        let metadata = UriMetadata::new(uri.uri.clone(), json!({ "expanded_from": inner }));

        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind: ContentKind::Directory,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}
