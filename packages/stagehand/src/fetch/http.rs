//! HTTP(S) fetcher.
//!
//! GETs with optional bearer-token or basic auth taken from the security
//! context attached to the URI. Transient transport errors are retried once;
//! HTTP error statuses are not.

use std::path::Path;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::types::{ContentKind, LicensedUri, SecurityContext, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, uri: &str, sec_context: Option<&SecurityContext>) -> reqwest::RequestBuilder {
        let mut request = self.client.get(uri);
        if let Some(context) = sec_context {
            if let Some(token) = context.get("token").and_then(|v| v.as_str()) {
                request = request.bearer_auth(token);
            } else if let Some(username) = context.get("username").and_then(|v| v.as_str()) {
                let password = context.get("password").and_then(|v| v.as_str());
                request = request.basic_auth(username, password);
            }
        }
        request
    }

    async fn get_with_retry(
        &self,
        uri: &str,
        sec_context: Option<&SecurityContext>,
    ) -> Result<reqwest::Response> {
        match self.request(uri, sec_context).send().await {
            Ok(response) => Ok(response),
            Err(err) if err.is_timeout() || err.is_connect() => {
                debug!(uri, "transient error, retrying once: {err}");
                self.request(uri, sec_context)
                    .send()
                    .await
                    .map_err(|err| classify(uri, err))
            }
            Err(err) => Err(classify(uri, err)),
        }
    }
}

fn classify(uri: &str, err: reqwest::Error) -> color_eyre::Report {
    if err.is_timeout() {
        return FetchError::Timeout {
            uri: uri.to_string(),
        }
        .into();
    }
    color_eyre::Report::new(err).wrap_err(format!("GET {uri}"))
}

#[async_trait]
impl SchemeFetcher for HttpFetcher {
    fn schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let response = self
            .get_with_retry(&uri.uri, uri.sec_context.as_ref())
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                uri: uri.uri.clone(),
            }
            .into());
        }

        let final_uri = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {dest:?}"))?;
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("read body of {}", uri.uri))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {dest:?}"))?;
        }
        file.flush().await.context("flush download")?;

        let metadata = UriMetadata::new(
            uri.uri.clone(),
            json!({
                "fetched": final_uri,
                "content-type": content_type,
                "status": status.as_u16(),
            }),
        );

        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind: ContentKind::File,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}
