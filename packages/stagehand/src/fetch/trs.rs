//! GA4GH TRSv2 files fetcher (internal `trs:` scheme).
//!
//! The canonical form wraps the `files` endpoint of a concrete
//! tool/version/descriptor, e.g.
//! `trs:https://host/ga4gh/trs/v2/tools/21/versions/1/CWL/files`. The
//! fetcher materializes every declared file into the destination directory
//! and exposes the entrypoint hints the listing carries.

use std::path::Path;

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};

use crate::error::FetchError;
use crate::fs;
use crate::types::{ContentKind, LicensedUri, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

/// Scheme prefix for the internal TRS files URIs.
pub const TRS_SCHEME: &str = "trs";

/// One entry of a TRSv2 `files` response.
#[derive(Clone, Debug, Deserialize)]
pub struct ToolFile {
    pub path: String,
    #[serde(default)]
    pub file_type: Option<String>,
    /// Some registries expose the upstream location of each file.
    #[serde(default)]
    pub url: Option<String>,
}

pub struct TrsFetcher {
    client: reqwest::Client,
}

impl TrsFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, uri: &str) -> Result<T> {
        let response = self
            .client
            .get(uri)
            .header(reqwest::header::ACCEPT, "application/json")
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
        response
            .json()
            .await
            .with_context(|| format!("decode JSON from {uri}"))
    }

    async fn get_text(&self, uri: &str) -> Result<String> {
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
        response
            .text()
            .await
            .with_context(|| format!("read body of {uri}"))
    }
}

#[async_trait]
impl SchemeFetcher for TrsFetcher {
    fn schemes(&self) -> &[&'static str] {
        &[TRS_SCHEME]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let Some(files_url) = uri.uri.strip_prefix("trs:") else {
            bail!("not an internal TRS files URI: {}", uri.uri);
        };
        let Some(descriptor_base) = files_url.strip_suffix("/files") else {
            bail!("TRS files URI does not end in /files: {}", uri.uri);
        };

        let files: Vec<ToolFile> = self.get_json(files_url).await?;
        if files.is_empty() {
            bail!("TRS tool at {files_url} declares no files");
        }

        fs::ensure_dir(dest).await?;

        let mut workflow_entrypoint: Option<String> = None;
        let mut remote_workflow_entrypoint: Option<String> = None;
        for file in &files {
            // Containerfiles and tests are not materialized into the
            // workflow tree.
            if matches!(file.file_type.as_deref(), Some("CONTAINERFILE")) {
                continue;
            }

            let target = dest.join(&file.path);
            if !fs::is_within(dest, &target).await? {
                warn!(path = %file.path, "TRS file escapes its directory, skipped");
                continue;
            }

            let file_url = format!(
                "{descriptor_base}/descriptor/{}",
                urlencoding::encode(&file.path).replace("%2F", "/")
            );
            let body = self.get_text(&file_url).await?;
            fs::atomic_write(&target, body.as_bytes()).await?;

            if matches!(file.file_type.as_deref(), Some("PRIMARY_DESCRIPTOR"))
                && workflow_entrypoint.is_none()
            {
                workflow_entrypoint = Some(file.path.clone());
                remote_workflow_entrypoint = file.url.clone();
            }
        }

        // Registries which do not type their files still need an entrypoint
        // guess: the first declared file.
        if workflow_entrypoint.is_none() {
            workflow_entrypoint = files.first().map(|file| file.path.clone());
            remote_workflow_entrypoint = files.first().and_then(|file| file.url.clone());
        }

        let metadata = UriMetadata::new(
            uri.uri.clone(),
            json!({
                "workflow_entrypoint": workflow_entrypoint,
                "remote_workflow_entrypoint": remote_workflow_entrypoint,
                "n_files": files.len(),
            }),
        );

        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind: ContentKind::Directory,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}
