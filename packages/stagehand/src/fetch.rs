//! Pluggable URI-scheme fetchers.
//!
//! Each fetcher is selected by the scheme of the canonical URI produced
//! after dereference. A fetcher either materializes the payload at the
//! destination the cache handler chose, or answers with a new URI to
//! dereference; the handler loops and records every step of the chain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;

use crate::error::FetchError;
use crate::types::{ContentKind, LicensedUri, UriMetadata};

pub mod data;
pub mod file;
pub mod git;
pub mod http;
pub mod rocrate;
pub mod trs;

/// Payload a fetcher materialized at the destination path.
#[derive(Clone, Debug)]
pub struct FetchedPayload {
    pub kind: ContentKind,
    /// Metadata recorded for this dereference step.
    pub metadata: UriMetadata,
    pub licences: Vec<String>,
}

/// Result of asking a fetcher to resolve one URI.
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    /// The payload now exists at the destination path.
    Materialized(FetchedPayload),
    /// The URI dereferences to another URI; the handler should continue.
    Dereference(LicensedUri),
}

/// A resolver for one (or more) URI schemes.
#[async_trait]
pub trait SchemeFetcher: Send + Sync {
    /// The schemes this fetcher claims.
    fn schemes(&self) -> &[&'static str];

    /// Materialize the payload of `uri` exactly at `dest` (a file or a
    /// directory, per the content kind), or return a dereference.
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome>;
}

impl std::fmt::Debug for dyn SchemeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeFetcher")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Registry of scheme fetchers, keyed by URI scheme.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<&'static str, Arc<dyn SchemeFetcher>>,
}

impl FetcherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every fetcher this crate ships: http(s), git, trs,
    /// ro-crate-zip, file and data.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http::HttpFetcher::new(client.clone())));
        registry.register(Arc::new(git::GitFetcher::default()));
        registry.register(Arc::new(trs::TrsFetcher::new(client.clone())));
        registry.register(Arc::new(rocrate::RoCrateZipFetcher::new(client)));
        registry.register(Arc::new(file::FileFetcher));
        registry.register(Arc::new(data::DataFetcher));
        registry
    }

    pub fn register(&mut self, fetcher: Arc<dyn SchemeFetcher>) {
        for scheme in fetcher.schemes() {
            self.fetchers.insert(scheme, Arc::clone(&fetcher));
        }
    }

    /// Look up the fetcher for a URI, by its scheme.
    pub fn for_uri(&self, uri: &str) -> Result<Arc<dyn SchemeFetcher>, FetchError> {
        let scheme = scheme_of(uri).unwrap_or_default();
        self.fetchers
            .get(scheme.as_str())
            .cloned()
            .ok_or_else(|| FetchError::UnknownScheme {
                scheme,
                uri: uri.to_string(),
            })
    }
}

/// The scheme of a URI-shaped string, lowercased.
pub fn scheme_of(uri: &str) -> Option<String> {
    let colon = uri.find(':')?;
    let scheme = &uri[..colon];
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        || !scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn scheme_parsing() {
        pretty_assert_eq!(
            scheme_of("https://example.org/x"),
            Some("https".to_string())
        );
        pretty_assert_eq!(scheme_of("trs:https://x"), Some("trs".to_string()));
        pretty_assert_eq!(scheme_of("data:,hello"), Some("data".to_string()));
        pretty_assert_eq!(scheme_of("no-scheme-here"), None);
        pretty_assert_eq!(scheme_of("21"), None);
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let registry = FetcherRegistry::new();
        let err = registry.for_uri("gopher://example.org").unwrap_err();
        assert!(matches!(err, FetchError::UnknownScheme { .. }));
    }
}
