//! Content-addressed fetch cache.
//!
//! Entries are keyed by (cache type, canonical URI). Each entry persists the
//! payload itself (a file or a directory), a metadata sidecar recording every
//! dereference step, and the final resolved URI. Payloads are committed with
//! a temp-then-rename pattern so partially fetched entries are never visible
//! to other callers.
//!
//! ## Concurrency
//!
//! Fetches for the same key are serialized: an in-process mutex table keeps
//! one download per key per process, and an advisory lock next to the
//! payload covers shared cache directories across processes.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::digest;
use crate::error::FetchError;
use crate::fetch::{FetchOutcome, FetcherRegistry};
use crate::fs::{self, LockFile};
use crate::types::{ContentKind, LicensedUri, UriMetadata};

/// Which cache a fetch should land in. Each type is a separate namespace on
/// disk.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum CacheType {
    #[strum(serialize = "inputs")]
    Input,
    #[strum(serialize = "workflows")]
    Workflow,
    #[strum(serialize = "ro-crates")]
    RoCrate,
    #[strum(serialize = "trs")]
    Trs,
}

/// Result of a fetch: the payload's resting place plus its provenance.
#[derive(Clone, Debug)]
pub struct Fetched {
    pub kind: ContentKind,
    pub local_path: PathBuf,
    /// Every dereference step that led to the payload, in order.
    pub metadata_chain: Vec<UriMetadata>,
    pub licences: Vec<String>,
}

impl Fetched {
    /// Metadata of the final dereference step, when any was recorded.
    pub fn last_metadata(&self) -> Option<&UriMetadata> {
        self.metadata_chain.last()
    }
}

/// The persisted sidecar of one cache entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Sidecar {
    resolved_uri: String,
    kind: ContentKind,
    fetched: Vec<UriMetadata>,
    #[serde(default)]
    licences: Vec<String>,
}

/// Bounded dereference depth; chains longer than this are configuration
/// errors, not legitimate redirects.
const MAX_HOPS: usize = 8;

pub struct CacheHandler {
    cache_dir: PathBuf,
    fetchers: FetcherRegistry,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheHandler {
    pub fn new(cache_dir: impl Into<PathBuf>, fetchers: FetcherRegistry) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetchers,
            inflight: DashMap::new(),
        }
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    pub fn fetchers(&self) -> &FetcherRegistry {
        &self.fetchers
    }

    fn entry_key(cache_type: CacheType, uri: &str) -> String {
        format!("{cache_type}/{}", digest::cache_key(uri))
    }

    fn payload_path(&self, cache_type: CacheType, uri: &str) -> PathBuf {
        self.cache_dir.join(Self::entry_key(cache_type, uri))
    }

    /// Fetch a URI into the shared cache, dereferencing as needed, and
    /// return the cached payload. Identical inputs are idempotent; when
    /// `offline` the cache is consulted but never populated.
    #[instrument(skip(self), fields(uri = %uri.uri, %cache_type))]
    pub async fn fetch(
        &self,
        uri: &LicensedUri,
        cache_type: CacheType,
        offline: bool,
    ) -> Result<Fetched> {
        let key = Self::entry_key(cache_type, &uri.uri);
        let slot = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _in_process = slot.lock().await;

        let payload = self.payload_path(cache_type, &uri.uri);
        let sidecar_path = payload.with_extension("meta.json");
        if let Some(parent) = payload.parent() {
            fs::ensure_dir(parent).await?;
        }

        // Advisory lock for shared cache directories: at most one process
        // commits an entry for this key at a time.
        let lock = LockFile::open(payload.with_extension("lock")).await?;
        let _locked = lock.lock().await?;

        if let Some(hit) = self.read_entry(&payload, &sidecar_path).await? {
            debug!(%key, "cache hit");
            return Ok(hit);
        }

        if offline {
            return Err(FetchError::CacheMiss {
                uri: uri.uri.clone(),
            }
            .into());
        }

        let staged = self.resolve_into(uri, &payload).await?;
        let sidecar = Sidecar {
            resolved_uri: staged
                .metadata_chain
                .last()
                .map(|step| step.uri.clone())
                .unwrap_or_else(|| uri.uri.clone()),
            kind: staged.kind,
            fetched: staged.metadata_chain.clone(),
            licences: staged.licences.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&sidecar).context("serialize cache sidecar")?;
        fs::atomic_write(&sidecar_path, &encoded).await?;

        Ok(staged)
    }

    /// Fetch a URI directly into `dest_dir`, bypassing the shared cache.
    /// Used in paranoid mode and for `cache=false` inputs: nothing is
    /// registered, and the payload lands inside the instance.
    #[instrument(skip(self), fields(uri = %uri.uri))]
    pub async fn fetch_to(
        &self,
        uri: &LicensedUri,
        dest_dir: &std::path::Path,
        offline: bool,
    ) -> Result<Fetched> {
        if offline {
            return Err(FetchError::CacheMiss {
                uri: uri.uri.clone(),
            }
            .into());
        }
        fs::ensure_dir(dest_dir).await?;
        let payload = dest_dir.join(digest::cache_key(&uri.uri));
        self.resolve_into(uri, &payload).await
    }

    async fn read_entry(
        &self,
        payload: &std::path::Path,
        sidecar_path: &std::path::Path,
    ) -> Result<Option<Fetched>> {
        let Ok(raw) = tokio::fs::read(sidecar_path).await else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(payload).await.unwrap_or(false) {
            warn!(?payload, "cache sidecar without payload, refetching");
            return Ok(None);
        }
        let sidecar: Sidecar = match serde_json::from_slice(&raw) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                warn!(?sidecar_path, "unreadable cache sidecar, refetching: {err}");
                return Ok(None);
            }
        };
        Ok(Some(Fetched {
            kind: sidecar.kind,
            local_path: payload.to_path_buf(),
            metadata_chain: sidecar.fetched,
            licences: sidecar.licences,
        }))
    }

    /// Run the dereference loop until a fetcher materializes a payload,
    /// committing it at `payload` atomically.
    async fn resolve_into(&self, uri: &LicensedUri, payload: &std::path::Path) -> Result<Fetched> {
        let mut current = uri.clone();
        let mut chain: Vec<UriMetadata> = Vec::new();
        let mut licences: Vec<String> = uri.licences.clone();

        for _hop in 0..MAX_HOPS {
            let fetcher = self.fetchers.for_uri(&current.uri)?;
            let staging = fs::temp_path(payload);
            let outcome = match fetcher.fetch(&current, &staging).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    cleanup(&staging).await;
                    return Err(err.wrap_err(format!("fetch {}", current.uri)));
                }
            };

            match outcome {
                FetchOutcome::Materialized(fetched) => {
                    chain.push(fetched.metadata);
                    for licence in fetched.licences {
                        if !licences.contains(&licence) {
                            licences.push(licence);
                        }
                    }
                    if tokio::fs::try_exists(payload).await.unwrap_or(false) {
                        // A previous (possibly interrupted) payload is being
                        // replaced wholesale.
                        remove_any(payload).await;
                    }
                    tokio::fs::rename(&staging, payload)
                        .await
                        .with_context(|| format!("commit {staging:?} to {payload:?}"))?;
                    return Ok(Fetched {
                        kind: fetched.kind,
                        local_path: payload.to_path_buf(),
                        metadata_chain: chain,
                        licences,
                    });
                }
                FetchOutcome::Dereference(mut next) => {
                    cleanup(&staging).await;
                    debug!(from = %current.uri, to = %next.uri, "dereference");
                    chain.push(UriMetadata::new(
                        current.uri.clone(),
                        serde_json::json!({ "dereferenced_to": next.uri }),
                    ));
                    if next.sec_context.is_none() {
                        next.sec_context = current.sec_context.clone();
                    }
                    current = next;
                }
            }
        }

        Err(FetchError::TooManyHops {
            uri: uri.uri.clone(),
        }
        .into())
    }
}

async fn cleanup(path: &std::path::Path) {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        remove_any(path).await;
    }
}

async fn remove_any(path: &std::path::Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(err) = result {
        warn!(?path, "failed to remove staging leftovers: {err}");
    }
}
