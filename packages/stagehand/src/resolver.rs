//! Workflow resolution: from a workflow reference to an identified repo.
//!
//! A workflow id is either an absolute URI (a git hosting URL, or a URL of a
//! zipped RO-Crate) or an opaque identifier to be looked up through a GA4GH
//! TRSv2 endpoint. Resolution produces a [`RemoteRepo`] plus, when the
//! metadata reveals it, the workflow language that should drive execution.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::cache::{CacheHandler, CacheType};
use crate::engine::{self, EngineDescriptor};
use crate::error::{ConfigError, ResolverError};
use crate::fetch::git::guess_repo_params;
use crate::fetch::{rocrate::RO_CRATE_ZIP_SCHEME, trs::TRS_SCHEME};
use crate::types::{EngineKind, IdentifiedWorkflow, LicensedUri, RemoteRepo};
use crate::workdir::{TRS_METADATA_FILE, TRS_RESULT_FILE};

const TRS_TOOLS_PATH: &str = "tools/";

/// What resolution produced: the repository holding the workflow, the
/// engine when the metadata declared one, and the cached RO-Crate archive
/// when one was fetched along the way.
#[derive(Clone, Debug)]
pub struct ResolvedWorkflow {
    pub engine: Option<EngineKind>,
    pub repo: RemoteRepo,
    pub rocrate_cache: Option<PathBuf>,
}

impl From<IdentifiedWorkflow> for ResolvedWorkflow {
    fn from(identified: IdentifiedWorkflow) -> Self {
        Self {
            engine: Some(identified.workflow_type),
            repo: identified.remote_repo,
            rocrate_cache: None,
        }
    }
}

/// One resolution request.
#[derive(Clone, Debug)]
pub struct ResolveRequest<'a> {
    pub workflow_id: &'a str,
    pub version_id: Option<&'a str>,
    pub descriptor_type: Option<&'a str>,
    pub trs_endpoint: Option<&'a str>,
    /// Instance metadata directory; TRS responses are mirrored here under
    /// friendly names so the instance can be inspected offline.
    pub meta_dir: &'a Path,
    pub offline: bool,
}

/// Normalize a TRS endpoint: always slash-terminated, never ending in the
/// legacy `tools/` suffix.
pub fn normalize_trs_endpoint(endpoint: &str) -> String {
    let mut normalized = endpoint.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    if let Some(stripped) = normalized.strip_suffix(TRS_TOOLS_PATH) {
        normalized = stripped.to_string();
    }
    normalized
}

pub struct WorkflowResolver<'a> {
    cache: &'a CacheHandler,
}

impl<'a> WorkflowResolver<'a> {
    pub fn new(cache: &'a CacheHandler) -> Self {
        Self { cache }
    }

    /// Map a workflow reference to an identified repository.
    #[instrument(skip(self, request), fields(workflow_id = request.workflow_id))]
    pub async fn resolve(&self, request: &ResolveRequest<'_>) -> Result<ResolvedWorkflow> {
        if Url::parse(request.workflow_id).is_ok() {
            if let Some(mut repo) = guess_repo_params(request.workflow_id) {
                if repo.tag.is_none() {
                    repo.tag = request.version_id.map(str::to_string);
                }
                debug!(?repo, "workflow id recognized as a repository URL");
                return Ok(ResolvedWorkflow {
                    engine: None,
                    repo,
                    rocrate_cache: None,
                });
            }
            // Not a recognizable repository URL: treat it as the location
            // of a zipped RO-Crate.
            return self
                .resolve_from_rocrate_url(request.workflow_id, None, request.offline)
                .await;
        }

        let Some(endpoint) = request.trs_endpoint else {
            return Err(ConfigError::MissingTrsEndpoint {
                workflow_id: request.workflow_id.to_string(),
            }
            .into());
        };
        self.resolve_from_trs(&normalize_trs_endpoint(endpoint), request)
            .await
    }

    /// Resolve through a GA4GH TRSv2 endpoint.
    async fn resolve_from_trs(
        &self,
        endpoint: &str,
        request: &ResolveRequest<'_>,
    ) -> Result<ResolvedWorkflow> {
        let service_info = self
            .fetch_service_info(endpoint, request.meta_dir, request.offline)
            .await?;

        let trs_version = service_info
            .api_version
            .clone()
            .or_else(|| service_info.service_type.as_ref().and_then(|t| t.version.clone()));
        if trs_version.is_none() {
            return Err(ResolverError::Protocol {
                endpoint: endpoint.to_string(),
            }
            .into());
        }

        let tools_url = format!(
            "{endpoint}{TRS_TOOLS_PATH}{}",
            urlencoding::encode(request.workflow_id)
        );
        let tool: ToolDesc = self
            .fetch_json(
                &tools_url,
                request.meta_dir.join(TRS_RESULT_FILE),
                request.offline,
            )
            .await
            .with_context(|| format!("fetch TRS tool descriptor {tools_url}"))?;

        if tool.toolclass.as_ref().map(|c| c.name.as_str()) != Some("Workflow") {
            return Err(ResolverError::NotAWorkflow {
                workflow_id: request.workflow_id.to_string(),
                endpoint: endpoint.to_string(),
            }
            .into());
        }

        let version = select_version(&tool, request.workflow_id, request.version_id, endpoint)?;
        let descriptor = select_descriptor(
            &version,
            request.workflow_id,
            request.descriptor_type,
            endpoint,
        )?;

        let files_url = format!(
            "{tools_url}/versions/{}/{}/files",
            urlencoding::encode(&version.id),
            urlencoding::encode(descriptor.trs_descriptor)
        );

        let is_workflowhub = service_info
            .organization
            .as_ref()
            .map(|org| org.name == "WorkflowHub")
            .unwrap_or(false);

        if is_workflowhub {
            debug!("TRS endpoint is WorkflowHub, delegating to the RO-Crate export");
            let rocrate_url = format!("{files_url}?format=zip");
            return self
                .resolve_from_rocrate_url(&rocrate_url, Some(descriptor.kind), request.offline)
                .await;
        }

        debug!("plain TRS workflow, materializing the declared files");
        let fetched = self
            .cache
            .fetch(
                &LicensedUri::new(format!("{TRS_SCHEME}:{files_url}")),
                CacheType::Trs,
                request.offline,
            )
            .await
            .with_context(|| format!("materialize TRS files of {files_url}"))?;

        let hints = fetched
            .last_metadata()
            .map(|step| step.metadata.clone())
            .unwrap_or_default();

        if let Some(remote_entrypoint) = hints
            .get("remote_workflow_entrypoint")
            .and_then(Value::as_str)
        {
            if let Some(repo) = guess_repo_params(remote_entrypoint) {
                debug!(?repo, "derived origin repository from TRS file metadata");
                return Ok(IdentifiedWorkflow {
                    workflow_type: descriptor.kind,
                    remote_repo: repo,
                }
                .into());
            }
        }

        if let Some(entrypoint) = hints.get("workflow_entrypoint").and_then(Value::as_str) {
            return Ok(IdentifiedWorkflow {
                workflow_type: descriptor.kind,
                remote_repo: RemoteRepo {
                    repo_url: fetched.local_path.to_string_lossy().into_owned(),
                    tag: None,
                    rel_path: Some(entrypoint.to_string()),
                },
            }
            .into());
        }

        Err(ResolverError::Unresolvable {
            uri: files_url.clone(),
        }
        .into())
    }

    /// Download a zipped RO-Crate and identify the workflow it describes.
    pub async fn resolve_from_rocrate_url(
        &self,
        url: &str,
        expected: Option<EngineKind>,
        offline: bool,
    ) -> Result<ResolvedWorkflow> {
        let wrapped = LicensedUri::new(format!("{RO_CRATE_ZIP_SCHEME}:{url}"));
        let fetched = self
            .cache
            .fetch(&wrapped, CacheType::RoCrate, offline)
            .await
            .with_context(|| format!("fetch RO-Crate {url}"))?;

        let identified = identify_from_rocrate_dir(&fetched.local_path, expected).await?;
        Ok(ResolvedWorkflow {
            engine: Some(identified.workflow_type),
            repo: identified.remote_repo,
            rocrate_cache: Some(fetched.local_path),
        })
    }

    async fn fetch_service_info(
        &self,
        endpoint: &str,
        meta_dir: &Path,
        offline: bool,
    ) -> Result<ServiceInfo> {
        let target = meta_dir.join(TRS_METADATA_FILE);
        let modern = format!("{endpoint}service-info");
        match self.fetch_json(&modern, target.clone(), offline).await {
            Ok(info) => Ok(info),
            Err(modern_err) => {
                let legacy = format!("{endpoint}metadata");
                self.fetch_json(&legacy, target, offline)
                    .await
                    .map_err(|legacy_err| {
                        eyre!(
                            "unable to fetch TRS metadata from {endpoint}:\n{modern_err:#}\n{legacy_err:#}"
                        )
                    })
            }
        }
    }

    /// Fetch a JSON document through the cache and mirror it into the
    /// instance metadata directory under a friendly name.
    async fn fetch_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        friendly: PathBuf,
        offline: bool,
    ) -> Result<T> {
        let fetched = self
            .cache
            .fetch(&LicensedUri::new(url), CacheType::Trs, offline)
            .await?;
        if !tokio::fs::try_exists(&friendly).await.unwrap_or(false) {
            if let Err(err) = tokio::fs::symlink(&fetched.local_path, &friendly).await {
                debug!(?friendly, "could not mirror TRS response: {err}");
            }
        }
        let raw = tokio::fs::read(&fetched.local_path)
            .await
            .with_context(|| format!("read cached response of {url}"))?;
        serde_json::from_slice(&raw).with_context(|| format!("decode JSON from {url}"))
    }
}

/// Pick the tool version matching the requested id (by `id` or `name`), or
/// the lexicographically greatest version id when none was requested.
fn select_version(
    tool: &ToolDesc,
    workflow_id: &str,
    version_id: Option<&str>,
    endpoint: &str,
) -> Result<ToolVersion> {
    let not_found = |version: &str| ResolverError::VersionNotFound {
        workflow_id: workflow_id.to_string(),
        version: version.to_string(),
        endpoint: endpoint.to_string(),
    };

    if tool.versions.is_empty() {
        return Err(not_found(version_id.unwrap_or("<any>")).into());
    }

    match version_id {
        Some(wanted) if !wanted.is_empty() => tool
            .versions
            .iter()
            .find(|v| v.id == wanted || v.name.as_deref() == Some(wanted))
            .cloned()
            .ok_or_else(|| not_found(wanted).into()),
        _ => {
            let best = tool
                .versions
                .iter()
                .filter(|v| !v.id.is_empty())
                .max_by(|a, b| a.id.cmp(&b.id))
                .cloned();
            best.ok_or_else(|| not_found("<any>").into())
        }
    }
}

/// Intersect the requested descriptor type with what the version declares,
/// or pick the first recognized one.
fn select_descriptor(
    version: &ToolVersion,
    workflow_id: &str,
    requested: Option<&str>,
    _endpoint: &str,
) -> Result<&'static EngineDescriptor> {
    match requested {
        Some(descriptor) => {
            let known = engine::by_trs_descriptor(descriptor).ok_or_else(|| {
                ResolverError::DescriptorTypeNotRecognized {
                    descriptor: descriptor.to_string(),
                }
            })?;
            if !version
                .descriptor_type
                .iter()
                .any(|d| d.eq_ignore_ascii_case(descriptor))
            {
                return Err(ResolverError::DescriptorTypeNotAvailable {
                    workflow_id: workflow_id.to_string(),
                    version: version.id.clone(),
                    descriptor: descriptor.to_string(),
                }
                .into());
            }
            Ok(known)
        }
        None => version
            .descriptor_type
            .iter()
            .find_map(|d| engine::by_trs_descriptor(d))
            .ok_or_else(|| {
                ResolverError::DescriptorTypeNotRecognized {
                    descriptor: version.descriptor_type.join(","),
                }
                .into()
            }),
    }
}

/// Walk an expanded RO-Crate and identify the workflow it describes.
///
/// The walk follows the JSON-LD shape WorkflowHub emits: the metadata
/// descriptor (`CreativeWork` whose id names the metadata file) points at
/// the root dataset through `about`; the root points at the workflow file
/// through `mainEntity`; the workflow names its language through
/// `programmingLanguage`, whose entity carries `identifier` and `url`.
pub async fn identify_from_rocrate_dir(
    dir: &Path,
    expected: Option<EngineKind>,
) -> Result<IdentifiedWorkflow> {
    let metadata_file = locate_crate_metadata(dir).await?;
    let raw = tokio::fs::read(&metadata_file)
        .await
        .with_context(|| format!("read {metadata_file:?}"))?;
    let document: Value =
        serde_json::from_slice(&raw).with_context(|| format!("decode {metadata_file:?}"))?;

    identify_from_rocrate_json(&document, expected)
}

async fn locate_crate_metadata(dir: &Path) -> Result<PathBuf> {
    for candidate in ["ro-crate-metadata.json", "ro-crate-metadata.jsonld"] {
        let path = dir.join(candidate);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
    }
    // Some archives wrap the crate in a single top-level directory.
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("scan {dir:?}"))?;
    while let Some(entry) = entries.next_entry().await.context("scan entry")? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            for candidate in ["ro-crate-metadata.json", "ro-crate-metadata.jsonld"] {
                let path = entry.path().join(candidate);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok(path);
                }
            }
        }
    }
    bail!("no RO-Crate metadata file under {dir:?}")
}

/// Identify the workflow language and origin repository from a parsed
/// RO-Crate metadata document.
pub fn identify_from_rocrate_json(
    document: &Value,
    expected: Option<EngineKind>,
) -> Result<IdentifiedWorkflow> {
    let graph = document
        .get("@graph")
        .and_then(Value::as_array)
        .ok_or_else(|| eyre!("RO-Crate metadata has no @graph"))?;

    let entity = |id: &str| graph.iter().find(|e| e.get("@id").and_then(Value::as_str) == Some(id));

    // The metadata descriptor: a CreativeWork whose id names the metadata
    // file itself.
    let root_id = graph
        .iter()
        .find(|e| {
            type_contains(e, "CreativeWork")
                && e.get("@id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.contains(".json"))
        })
        .and_then(|descriptor| descriptor.get("about"))
        .and_then(id_of)
        .ok_or_else(|| eyre!("RO-Crate metadata descriptor does not point at a root dataset"))?;

    let root = entity(root_id).ok_or_else(|| eyre!("RO-Crate root dataset {root_id:?} missing"))?;
    let main_entity_id = root
        .get("mainEntity")
        .and_then(id_of)
        .ok_or_else(|| eyre!("RO-Crate root dataset has no mainEntity"))?;
    let main_entity = entity(main_entity_id)
        .ok_or_else(|| eyre!("RO-Crate mainEntity {main_entity_id:?} missing"))?;

    let upload_url = main_entity
        .get("url")
        .and_then(string_or_id)
        .map(str::to_string);

    let language_ref = main_entity
        .get("programmingLanguage")
        .and_then(id_of)
        .map(str::to_string);

    let (language_id, language_url) = match language_ref.as_deref().and_then(&entity) {
        Some(language) => (
            language
                .get("identifier")
                .and_then(string_or_id)
                .map(str::to_string)
                .or(language_ref.clone()),
            language
                .get("url")
                .and_then(string_or_id)
                .map(str::to_string),
        ),
        None => (language_ref.clone(), None),
    };

    let mut matched_by_id: Option<&'static EngineDescriptor> = None;
    let mut matched_by_url: Option<&'static EngineDescriptor> = None;
    for descriptor in engine::catalog() {
        if matched_by_id.is_none() {
            if let Some(id) = &language_id {
                if descriptor.uri_patterns.iter().any(|pattern| pattern.is_match(id)) {
                    matched_by_id = Some(descriptor);
                }
            }
        }
        if matched_by_url.is_none() && language_url.as_deref() == Some(descriptor.canonical_url) {
            matched_by_url = Some(descriptor);
        }
    }

    let chosen = match (matched_by_id, matched_by_url) {
        (Some(by_id), Some(by_url)) => {
            if by_id.kind != by_url.kind {
                warn!(
                    ?language_id,
                    ?language_url,
                    "programming language id and url identify different engines"
                );
            }
            by_id
        }
        (Some(by_id), None) => by_id,
        (None, Some(by_url)) => by_url,
        (None, None) => {
            return Err(ResolverError::UnknownLanguage {
                language_id,
                language_url,
            }
            .into());
        }
    };

    if let Some(expected) = expected {
        if chosen.kind != expected {
            bail!(
                "expected programming language {expected} does not match identified {} in RO-Crate manifest",
                chosen.kind
            );
        }
    }

    // The workflow URL can reveal the repo, the tag and the relative path.
    // Some crates have it missing or ill-built; fall back to isBasedOn.
    let mut remote_repo = upload_url.as_deref().and_then(guess_repo_params);
    if remote_repo.is_none() {
        remote_repo = root
            .get("isBasedOn")
            .and_then(string_or_id)
            .and_then(guess_repo_params);
    }

    let remote_repo = remote_repo.ok_or_else(|| ResolverError::UnsupportedGitHost {
        uri: upload_url.unwrap_or_else(|| main_entity_id.to_string()),
    })?;

    Ok(IdentifiedWorkflow {
        workflow_type: chosen.kind,
        remote_repo,
    })
}

fn type_contains(entity: &Value, wanted: &str) -> bool {
    match entity.get("@type") {
        Some(Value::String(ty)) => ty == wanted,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

/// Accept `{"@id": "..."}` or a bare string.
fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("@id").and_then(Value::as_str),
        _ => None,
    }
}

fn string_or_id(value: &Value) -> Option<&str> {
    id_of(value)
}

#[derive(Clone, Debug, Deserialize)]
struct ServiceInfo {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default, rename = "type")]
    service_type: Option<ServiceType>,
    #[serde(default)]
    organization: Option<Organization>,
}

#[derive(Clone, Debug, Deserialize)]
struct ServiceType {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct Organization {
    #[serde(default)]
    name: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ToolDesc {
    #[serde(default)]
    toolclass: Option<ToolClass>,
    #[serde(default)]
    versions: Vec<ToolVersion>,
}

#[derive(Clone, Debug, Deserialize)]
struct ToolClass {
    #[serde(default)]
    name: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ToolVersion {
    #[serde(default, deserialize_with = "crate::config::string_or_number")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    descriptor_type: Vec<String>,
}
