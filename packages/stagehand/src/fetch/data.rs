//! RFC 2397 `data:` fetcher.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde_json::json;
use tracing::instrument;

use crate::fs;
use crate::types::{ContentKind, LicensedUri, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

pub struct DataFetcher;

/// Decode a `data:[mediatype][;base64],payload` URI into its bytes.
pub fn decode_data_uri(uri: &str) -> Result<(Vec<u8>, Option<String>)> {
    let Some(rest) = uri.strip_prefix("data:") else {
        bail!("not a data URI: {uri}");
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("data URI has no payload separator: {uri}");
    };

    let mut media_type = None;
    let mut is_base64 = false;
    for (i, part) in header.split(';').enumerate() {
        if part.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if i == 0 && !part.is_empty() {
            media_type = Some(part.to_string());
        }
    }

    let bytes = if is_base64 {
        STANDARD
            .decode(payload)
            .with_context(|| format!("decode base64 payload of {uri}"))?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };
    Ok((bytes, media_type))
}

#[async_trait]
impl SchemeFetcher for DataFetcher {
    fn schemes(&self) -> &[&'static str] {
        &["data"]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let (bytes, media_type) = decode_data_uri(&uri.uri)?;
        fs::atomic_write(dest, &bytes).await?;

        let metadata = UriMetadata::new(uri.uri.clone(), json!({ "media-type": media_type }));
        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind: ContentKind::File,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}
