//! Input staging: from the declared parameter tree to materialized content.
//!
//! Parameters form a recursive tree whose leaves are atomic values, lists of
//! atomic values, or input specs (`c-l-a-s-s: File | Directory`). Staging
//! walks the tree composing dot-separated linear keys, substitutes
//! placeholders, fetches every remote URI (through the shared cache, or
//! straight into the instance in paranoid mode) and plants hardened links
//! inside the inputs directory. Nothing staged here may resolve outside the
//! inputs jail.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures::future::BoxFuture;
use lazy_regex::{Lazy, Regex, lazy_regex};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::cache::{CacheHandler, CacheType};
use crate::error::ConfigError;
use crate::fs;
use crate::types::{
    Attribution, ContentKind, InputValue, LicensedUri, MaterializedContent, MaterializedInput,
    ScalarValue, SecurityContextTable,
};

static PLACEHOLDER: Lazy<Regex> = lazy_regex!(r"\{([A-Za-z_][A-Za-z0-9_.\-]*)\}");

/// Substitute `{name}` placeholders in a string. When any referenced
/// placeholder is missing the original text is returned unchanged and a
/// warning is logged, so a stray brace never silently corrupts a URI.
pub fn expand_placeholders(text: &str, table: &BTreeMap<String, String>) -> String {
    if !text.contains('{') {
        return text.to_string();
    }

    let mut missing = Vec::new();
    for captures in PLACEHOLDER.captures_iter(text) {
        let name = &captures[1];
        if !table.contains_key(name) {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() {
        warn!(?missing, "failed to format (revise placeholders): {text}");
        return text.to_string();
    }

    PLACEHOLDER
        .replace_all(text, |captures: &lazy_regex::regex::Captures<'_>| {
            table[&captures[1]].clone()
        })
        .into_owned()
}

/// Apply the placeholder pass over a whole parameter tree: `url`,
/// `secondary-urls`, `preferred-name` and `relative-dir` fields of input
/// specs, plus nested atomic strings.
pub fn format_params(params: &Value, table: &BTreeMap<String, String>) -> Result<Value> {
    format_params_inner(params, table, "")
}

fn format_params_inner(
    params: &Value,
    table: &BTreeMap<String, String>,
    prefix: &str,
) -> Result<Value> {
    let Value::Mapping(map) = params else {
        return Ok(params.clone());
    };

    let mut formatted = serde_yaml::Mapping::with_capacity(map.len());
    for (key, raw) in map {
        let key_name = mapping_key(key);
        let linear_key = join_key(prefix, &key_name);

        let class_key = Value::from("c-l-a-s-s");
        let new_value = match raw {
            Value::Mapping(inner) => {
                match inner.get(&class_key).and_then(Value::as_str) {
                    Some("File") | Some("Directory") => {
                        let mut spec = inner.clone();
                        for field in ["url", "secondary-urls"] {
                            if let Some(value) = spec.get(&Value::from(field)).cloned() {
                                spec.insert(Value::from(field), format_input_uri(&value, table));
                            }
                        }
                        for field in ["preferred-name", "relative-dir"] {
                            let field_key = Value::from(field);
                            if let Some(Value::String(text)) = spec.get(&field_key) {
                                let replaced = expand_placeholders(text, table);
                                spec.insert(field_key, Value::String(replaced));
                            }
                        }
                        Value::Mapping(spec)
                    }
                    Some(other) => {
                        return Err(ConfigError::UnrecognizedInputClass {
                            class: other.to_string(),
                            linear_key,
                        }
                        .into());
                    }
                    None => format_params_inner(raw, table, &linear_key)?,
                }
            }
            Value::Sequence(items) => Value::Sequence(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => {
                            Ok(Value::String(expand_placeholders(text, table)))
                        }
                        Value::Mapping(_) => format_params_inner(item, table, &linear_key),
                        other => Ok(other.clone()),
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::String(text) => Value::String(expand_placeholders(text, table)),
            other => other.clone(),
        };
        formatted.insert(key.clone(), new_value);
    }
    Ok(Value::Mapping(formatted))
}

/// Placeholder substitution over an input URI value: a plain string, a
/// licensed-URI object, or a list of either.
fn format_input_uri(value: &Value, table: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(text) => Value::String(expand_placeholders(text, table)),
        Value::Mapping(map) => {
            let mut out = map.clone();
            if let Some(Value::String(uri)) = map.get(&Value::from("uri")) {
                out.insert(
                    Value::from("uri"),
                    Value::String(expand_placeholders(uri, table)),
                );
            }
            Value::Mapping(out)
        }
        Value::Sequence(items) => {
            Value::Sequence(items.iter().map(|item| format_input_uri(item, table)).collect())
        }
        other => other.clone(),
    }
}

/// The recognized options of an input spec.
#[derive(Clone, Debug, Default, Deserialize)]
struct RawInputSpec {
    #[serde(rename = "c-l-a-s-s")]
    class: String,
    #[serde(default)]
    url: Option<Value>,
    #[serde(default, rename = "secondary-urls")]
    secondary_urls: Option<Value>,
    /// A string, or `false` to drop the precomputed name.
    #[serde(default, rename = "preferred-name")]
    preferred_name: Option<Value>,
    /// A string, or `false` to drop the precomputed relative dir.
    #[serde(default, rename = "relative-dir")]
    relative_dir: Option<Value>,
    #[serde(default, rename = "security-context")]
    security_context: Option<String>,
    #[serde(default, rename = "globExplode")]
    glob_explode: Option<String>,
    #[serde(default, rename = "autoFill")]
    auto_fill: bool,
    #[serde(default = "default_true", rename = "autoPrefix")]
    auto_prefix: bool,
    #[serde(default = "default_true")]
    cache: bool,
}

fn default_true() -> bool {
    true
}

/// Stages the inputs of one instance.
pub struct InputStager<'a> {
    cache: &'a CacheHandler,
    inputs_dir: &'a Path,
    outputs_dir: &'a Path,
    credentials: &'a SecurityContextTable,
    paranoid: bool,
}

impl<'a> InputStager<'a> {
    pub fn new(
        cache: &'a CacheHandler,
        inputs_dir: &'a Path,
        outputs_dir: &'a Path,
        credentials: &'a SecurityContextTable,
        paranoid: bool,
    ) -> Self {
        Self {
            cache,
            inputs_dir,
            outputs_dir,
            credentials,
            paranoid,
        }
    }

    /// Walk a (placeholder-expanded) parameter tree and materialize every
    /// leaf. Returns the materialized inputs and the final input sequence
    /// number, for callers that later inject more content.
    #[instrument(skip_all)]
    pub async fn materialize(
        &self,
        params: &Value,
        offline: bool,
    ) -> Result<(Vec<MaterializedInput>, usize)> {
        let mut inputs = Vec::new();
        let mut last_input = 0usize;
        self.walk(params, String::new(), offline, &mut last_input, &mut inputs)
            .await?;
        Ok((inputs, last_input))
    }

    fn walk<'s>(
        &'s self,
        params: &'s Value,
        prefix: String,
        offline: bool,
        last_input: &'s mut usize,
        out: &'s mut Vec<MaterializedInput>,
    ) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            let Value::Mapping(map) = params else {
                return Ok(());
            };

            for (key, raw) in map {
                let key_name = mapping_key(key);
                let linear_key = join_key(&prefix, &key_name);

                match raw {
                    Value::Mapping(inner) => {
                        if inner.contains_key(&Value::from("c-l-a-s-s")) {
                            self.stage_leaf(inner, &linear_key, offline, last_input, out)
                                .await?;
                        } else {
                            self.walk(raw, linear_key, offline, last_input, out).await?;
                        }
                    }
                    Value::Sequence(items) => {
                        let scalars: Option<Vec<ScalarValue>> =
                            items.iter().map(scalar_of).collect();
                        match scalars {
                            Some(values) => {
                                out.push(MaterializedInput::scalars(linear_key, values));
                            }
                            None => {
                                for (index, item) in items.iter().enumerate() {
                                    let nested_key = format!("{linear_key}.{index}");
                                    self.walk(item, nested_key, offline, last_input, out)
                                        .await?;
                                }
                            }
                        }
                    }
                    other => {
                        if let Some(value) = scalar_of(other) {
                            out.push(MaterializedInput::scalars(linear_key, vec![value]));
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn stage_leaf(
        &self,
        spec_map: &serde_yaml::Mapping,
        linear_key: &str,
        offline: bool,
        last_input: &mut usize,
        out: &mut Vec<MaterializedInput>,
    ) -> Result<()> {
        let spec: RawInputSpec = serde_yaml::from_value(Value::Mapping(spec_map.clone()))
            .with_context(|| format!("decode input spec at {linear_key}"))?;

        let kind = match spec.class.as_str() {
            "File" => ContentKind::File,
            "Directory" => ContentKind::Directory,
            other => {
                return Err(ConfigError::UnrecognizedInputClass {
                    class: other.to_string(),
                    linear_key: linear_key.to_string(),
                }
                .into());
            }
        };

        let path_tokens: Vec<&str> = linear_key.split('.').collect();

        // autoFill leaves resolve against the outputs directory and are
        // recorded without fetching anything.
        if spec.auto_fill {
            let auto_filled = match kind {
                ContentKind::Directory if spec.auto_prefix => {
                    let mut dir = self.outputs_dir.to_path_buf();
                    for token in &path_tokens {
                        dir.push(token);
                    }
                    dir
                }
                ContentKind::Directory => self.outputs_dir.to_path_buf(),
                _ => {
                    let mut file = self.outputs_dir.to_path_buf();
                    for token in &path_tokens {
                        file.push(token);
                    }
                    if let Some(parent) = file.parent() {
                        if parent != self.outputs_dir {
                            fs::ensure_dir(parent).await?;
                        }
                    }
                    file
                }
            };
            out.push(MaterializedInput::scalars(
                linear_key,
                vec![ScalarValue::Str(auto_filled.to_string_lossy().into_owned())],
            ));
            return Ok(());
        }

        let Some(remote_files) = &spec.url else {
            // No URL: an empty File placeholder inside the inputs tree, or
            // the inputs directory itself for a Directory.
            let (dest, kind) = match kind {
                ContentKind::File => {
                    let mut dest = self.inputs_dir.to_path_buf();
                    for token in &path_tokens {
                        dest.push(token);
                    }
                    if let Some(parent) = dest.parent() {
                        fs::ensure_dir(parent).await?;
                    }
                    fs::atomic_write(&dest, b"").await?;
                    (dest, ContentKind::File)
                }
                _ => (self.inputs_dir.to_path_buf(), ContentKind::Directory),
            };
            out.push(MaterializedInput {
                name: linear_key.to_string(),
                values: vec![InputValue::Content(MaterializedContent {
                    pretty_filename: dest
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    local_path: dest,
                    licensed_uri: LicensedUri::new("data:,"),
                    kind,
                    metadata_array: vec![],
                })],
                secondary_inputs: None,
            });
            return Ok(());
        };

        // A context that is named but not configured is fatal before any
        // fetch happens.
        let context_name = spec.security_context.as_deref();
        if let Some(name) = context_name {
            if !self.credentials.contains_key(name) {
                return Err(ConfigError::UnknownSecurityContext {
                    name: name.to_string(),
                    needed_by: linear_key.to_string(),
                }
                .into());
            }
        }

        let mut pretty_relname = path_tokens.last().map(|token| token.to_string());
        match &spec.preferred_name {
            Some(Value::String(name)) => pretty_relname = Some(name.clone()),
            Some(Value::Bool(false)) => pretty_relname = None,
            _ => {}
        }

        let mut relative_dir = if path_tokens.len() > 1 {
            Some(path_tokens[..path_tokens.len() - 1].join("/"))
        } else {
            None
        };
        match &spec.relative_dir {
            Some(Value::String(dir)) => relative_dir = Some(dir.clone()),
            Some(Value::Bool(false)) => relative_dir = None,
            _ => {}
        }

        let mut input_dest_dir = self.inputs_dir.to_path_buf();
        if let Some(rel) = &relative_dir {
            let candidate = self.inputs_dir.join(rel);
            if fs::is_within(self.inputs_dir, &candidate).await? {
                input_dest_dir = candidate;
            } else {
                debug!(%rel, "relative-dir escapes the inputs jail, ignored");
            }
        }
        fs::ensure_dir(&input_dest_dir).await?;

        let cacheable = if spec.cache { !self.paranoid } else { false };
        let glob_explode = match kind {
            ContentKind::Directory => spec.glob_explode.as_deref(),
            _ => None,
        };

        let mut values = Vec::new();
        for remote in flatten_uris(remote_files) {
            *last_input += 1;
            let staged = self
                .fetch_remote_file(
                    &remote,
                    context_name,
                    offline,
                    cacheable,
                    &input_dest_dir,
                    glob_explode,
                    &format!("{last_input}_"),
                    false,
                    pretty_relname.as_deref(),
                )
                .await?;
            values.extend(staged.into_iter().map(InputValue::Content));
        }

        let secondary_inputs = match &spec.secondary_urls {
            Some(secondary) => {
                let mut staged_secondary = Vec::new();
                for remote in flatten_uris(secondary) {
                    // The last primary's sequence prefix covers all of its
                    // secondaries.
                    let staged = self
                        .fetch_remote_file(
                            &remote,
                            context_name,
                            offline,
                            cacheable,
                            &input_dest_dir,
                            glob_explode,
                            &format!("{last_input}_"),
                            false,
                            None,
                        )
                        .await?;
                    staged_secondary.extend(staged);
                }
                Some(staged_secondary)
            }
            None => None,
        };

        out.push(MaterializedInput {
            name: linear_key.to_string(),
            values,
            secondary_inputs,
        });
        Ok(())
    }

    /// Fetch one remote URI and plant it (or its exploded entries) inside
    /// the inputs tree. With `harden` the sequence-prefixed name is used
    /// unconditionally instead of only on collision.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_remote_file(
        &self,
        remote: &Value,
        context_name: Option<&str>,
        offline: bool,
        cacheable: bool,
        input_dest_dir: &Path,
        glob_explode: Option<&str>,
        prefix: &str,
        harden: bool,
        pretty_relname: Option<&str>,
    ) -> Result<Vec<MaterializedContent>> {
        let licensed = self.build_licensed_uri(remote, context_name)?;

        let fetched = if cacheable {
            self.cache
                .fetch(&licensed, CacheType::Input, offline)
                .await?
        } else {
            self.cache
                .fetch_to(&licensed, input_dest_dir, offline)
                .await?
        };

        let mut pretty_relname = pretty_relname
            .map(str::to_string)
            .unwrap_or_else(|| pretty_name_from_uri(&licensed.uri));

        let mut pretty_local = input_dest_dir.join(&pretty_relname);

        // Jail check: a crafted name must not hijack anything outside the
        // inputs tree. Offenders collapse to their hardened basename.
        if !fs::is_within(self.inputs_dir, &pretty_local).await? {
            pretty_relname = Path::new(&pretty_relname)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{prefix}content"));
            pretty_local = input_dest_dir.join(&pretty_relname);
        }

        // Name hardening: an existing link to different content, or any
        // existing file, pushes this input to a sequence-prefixed name.
        let mut harden = harden;
        if !harden {
            match tokio::fs::symlink_metadata(&pretty_local).await {
                Ok(meta) if meta.is_symlink() => {
                    let old_target = tokio::fs::read_link(&pretty_local)
                        .await
                        .with_context(|| format!("read link {pretty_local:?}"))?;
                    harden = old_target != fetched.local_path;
                }
                Ok(_) => harden = true,
                Err(_) => {}
            }
        }
        if harden {
            pretty_relname = format!("{prefix}{pretty_relname}");
            pretty_local = input_dest_dir.join(&pretty_relname);
        }

        if !tokio::fs::try_exists(&pretty_local).await.unwrap_or(false) {
            if let Err(err) = tokio::fs::symlink(&fetched.local_path, &pretty_local).await {
                debug!(?pretty_local, "symlink failed, copying instead: {err}");
                fs::link_or_copy(&fetched.local_path, &pretty_local, false).await?;
            }
        }

        let clean_uri = LicensedUri {
            uri: licensed.uri.clone(),
            licences: fetched.licences.clone(),
            attributions: licensed.attributions.clone(),
            sec_context: None,
        };

        if let Some(pattern) = glob_explode {
            return explode_directory(&pretty_local, pattern, &clean_uri, &fetched.metadata_chain);
        }

        Ok(vec![MaterializedContent {
            local_path: pretty_local,
            licensed_uri: clean_uri,
            pretty_filename: pretty_relname,
            kind: fetched.kind,
            metadata_array: fetched.metadata_chain.clone(),
        }])
    }

    /// Normalize a URI leaf (string or licensed-URI object) and attach its
    /// credentials.
    fn build_licensed_uri(&self, remote: &Value, context_name: Option<&str>) -> Result<LicensedUri> {
        let (uri, licences, attributions, own_context) = match remote {
            Value::String(uri) => (uri.clone(), Vec::new(), Vec::new(), None),
            Value::Mapping(map) => {
                let uri = map
                    .get(&Value::from("uri"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| eyre!("licensed URI object without a uri field"))?
                    .to_string();
                let licences = map
                    .get(&Value::from("licences"))
                    .and_then(Value::as_sequence)
                    .map(|seq| {
                        seq.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let attributions = map
                    .get(&Value::from("attributions"))
                    .and_then(Value::as_sequence)
                    .map(|seq| {
                        seq.iter()
                            .filter_map(|attribution| {
                                serde_yaml::from_value::<Attribution>(attribution.clone()).ok()
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let own_context = map
                    .get(&Value::from("security-context"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (uri, licences, attributions, own_context)
            }
            other => return Err(eyre!("unsupported remote URI value: {other:?}")),
        };

        // A context named on the URI object supersedes the one on the
        // parent input.
        let effective_context = own_context.as_deref().or(context_name);
        let sec_context = match effective_context {
            Some(name) => Some(
                self.credentials
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownSecurityContext {
                        name: name.to_string(),
                        needed_by: uri.clone(),
                    })?,
            ),
            None => None,
        };

        Ok(LicensedUri {
            uri,
            licences,
            attributions,
            sec_context,
        })
    }

    /// Stage pre-existing local paths as inputs, as if they had been
    /// declared with `file:` URIs. Injected inputs always get the
    /// sequence-prefixed name: engines misbehave when two process inputs
    /// share a basename.
    pub async fn inject_inputs(
        &self,
        paths: &[PathBuf],
        offline: bool,
        mut last_input: usize,
    ) -> Result<(Vec<MaterializedContent>, usize)> {
        let mut staged = Vec::new();
        for path in paths {
            last_input += 1;
            let absolute = tokio::fs::canonicalize(path)
                .await
                .with_context(|| format!("canonicalize {path:?}"))?;
            let uri = Url::from_file_path(&absolute)
                .map_err(|_| eyre!("cannot express {absolute:?} as a file URI"))?;
            let remote = Value::String(uri.to_string());
            let mut contents = self
                .fetch_remote_file(
                    &remote,
                    None,
                    offline,
                    !self.paranoid,
                    self.inputs_dir,
                    None,
                    &format!("{last_input}_"),
                    true,
                    None,
                )
                .await?;
            staged.append(&mut contents);
        }
        Ok((staged, last_input))
    }
}

/// Expand a materialized directory into one content entry per glob match,
/// deriving a URL for each entry by percent-encoding its path segments onto
/// the original URI.
fn explode_directory(
    directory: &Path,
    pattern: &str,
    base_uri: &LicensedUri,
    metadata: &[crate::types::UriMetadata],
) -> Result<Vec<MaterializedContent>> {
    let full_pattern = format!("{}/{pattern}", directory.display());
    let mut contents = Vec::new();

    for entry in glob::glob(&full_pattern).with_context(|| format!("bad glob {pattern:?}"))? {
        let entry = entry.context("walk glob match")?;
        let rel = entry
            .strip_prefix(directory)
            .context("glob match outside its directory")?
            .to_path_buf();

        let exploded_uri = explode_uri(&base_uri.uri, &rel);
        let kind = if entry.is_dir() {
            ContentKind::Directory
        } else {
            ContentKind::File
        };

        contents.push(MaterializedContent {
            local_path: entry,
            licensed_uri: LicensedUri {
                uri: exploded_uri,
                licences: base_uri.licences.clone(),
                attributions: base_uri.attributions.clone(),
                sec_context: None,
            },
            pretty_filename: rel.to_string_lossy().into_owned(),
            kind,
            metadata_array: metadata.to_vec(),
        });
    }
    Ok(contents)
}

fn explode_uri(base: &str, rel: &Path) -> String {
    let encoded: Vec<String> = rel
        .components()
        .map(|component| {
            urlencoding::encode(&component.as_os_str().to_string_lossy()).into_owned()
        })
        .collect();

    match Url::parse(base) {
        Ok(mut url) => {
            let mut path = url.path().to_string();
            if !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&encoded.join("/"));
            url.set_path(&path);
            url.to_string()
        }
        Err(_) => format!("{base}/{}", encoded.join("/")),
    }
}

/// The last path segment of a URI, percent-decoded, as the natural local
/// filename.
fn pretty_name_from_uri(uri: &str) -> String {
    let name = Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.path_segments().and_then(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .next_back()
                    .map(str::to_string)
            })
        })
        .unwrap_or_default();
    if name.is_empty() {
        "content".to_string()
    } else {
        urlencoding::decode(&name)
            .map(|decoded| decoded.into_owned())
            .unwrap_or(name)
    }
}

fn flatten_uris(value: &Value) -> Vec<Value> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::Sequence(_) => flatten_uris(item),
                other => vec![other.clone()],
            })
            .collect(),
        other => vec![other.clone()],
    }
}

fn scalar_of(value: &Value) -> Option<ScalarValue> {
    match value {
        Value::Bool(b) => Some(ScalarValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ScalarValue::Int(i))
            } else {
                n.as_f64().map(ScalarValue::Float)
            }
        }
        Value::String(s) => Some(ScalarValue::Str(s.clone())),
        _ => None,
    }
}

fn mapping_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetcherRegistry;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn table(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_substitute_when_resolvable() {
        let table = table(&[("x", "abc")]);
        pretty_assert_eq!(
            expand_placeholders("https://host/{x}.txt", &table),
            "https://host/abc.txt"
        );
    }

    #[test]
    fn unresolvable_placeholder_keeps_original() {
        let table = table(&[("x", "abc")]);
        pretty_assert_eq!(
            expand_placeholders("https://host/{y}.txt", &table),
            "https://host/{y}.txt"
        );
    }

    #[test]
    fn format_params_touches_spec_fields() {
        let params: Value = serde_yaml::from_str(
            r#"
genome:
  c-l-a-s-s: File
  url: "https://host/{assembly}.fa"
  preferred-name: "{assembly}.fa"
nested:
  label: "run-{assembly}"
"#,
        )
        .unwrap();
        let formatted = format_params(&params, &table(&[("assembly", "GRCh38")])).unwrap();
        let rendered = serde_yaml::to_string(&formatted).unwrap();
        assert!(rendered.contains("https://host/GRCh38.fa"));
        assert!(rendered.contains("GRCh38.fa"));
        assert!(rendered.contains("run-GRCh38"));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let params: Value = serde_yaml::from_str("bad:\n  c-l-a-s-s: Tarball\n  url: x\n").unwrap();
        let err = format_params(&params, &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnrecognizedInputClass { .. })
        ));
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        cache: CacheHandler,
        inputs_dir: PathBuf,
        outputs_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let inputs_dir = temp.path().join("inputs");
        let outputs_dir = temp.path().join("outputs");
        std::fs::create_dir_all(&inputs_dir).unwrap();
        std::fs::create_dir_all(&outputs_dir).unwrap();
        let cache = CacheHandler::new(
            temp.path().join("cache"),
            FetcherRegistry::with_defaults(reqwest::Client::new()),
        );
        Fixture {
            _temp: temp,
            cache,
            inputs_dir,
            outputs_dir,
        }
    }

    #[tokio::test]
    async fn auto_fill_directory_with_prefix() {
        let fixture = fixture();
        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            false,
        );

        let params: Value = serde_yaml::from_str(
            "run:\n  outdir:\n    c-l-a-s-s: Directory\n    autoFill: true\n    autoPrefix: true\n",
        )
        .unwrap();
        let (inputs, _) = stager.materialize(&params, false).await.unwrap();

        pretty_assert_eq!(inputs.len(), 1);
        pretty_assert_eq!(inputs[0].name, "run.outdir");
        let expected = fixture.outputs_dir.join("run/outdir");
        pretty_assert_eq!(
            inputs[0].values[0],
            InputValue::Scalar(ScalarValue::Str(expected.to_string_lossy().into_owned()))
        );
    }

    #[tokio::test]
    async fn scalars_pass_through() {
        let fixture = fixture();
        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            false,
        );

        let params: Value =
            serde_yaml::from_str("threads: 8\nflags:\n  - -v\n  - --fast\n").unwrap();
        let (inputs, _) = stager.materialize(&params, false).await.unwrap();

        let by_name: BTreeMap<_, _> = inputs.iter().map(|i| (i.name.clone(), i)).collect();
        pretty_assert_eq!(
            by_name["threads"].values,
            vec![InputValue::Scalar(ScalarValue::Int(8))]
        );
        pretty_assert_eq!(by_name["flags"].values.len(), 2);
    }

    #[tokio::test]
    async fn name_hardening_separates_conflicting_inputs() {
        let fixture = fixture();
        let source_a = fixture._temp.path().join("a.txt");
        let source_b = fixture._temp.path().join("b.txt");
        tokio::fs::write(&source_a, b"aaa").await.unwrap();
        tokio::fs::write(&source_b, b"bbb").await.unwrap();

        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            false,
        );

        let params: Value = serde_yaml::from_str(&format!(
            "first:\n  c-l-a-s-s: File\n  url: \"{}\"\n  preferred-name: shared.txt\nsecond:\n  c-l-a-s-s: File\n  url: \"{}\"\n  preferred-name: shared.txt\n",
            Url::from_file_path(&source_a).unwrap(),
            Url::from_file_path(&source_b).unwrap(),
        ))
        .unwrap();

        let (inputs, _) = stager.materialize(&params, false).await.unwrap();
        let paths: Vec<&PathBuf> = inputs
            .iter()
            .flat_map(|input| input.values.iter())
            .filter_map(|value| match value {
                InputValue::Content(content) => Some(&content.local_path),
                _ => None,
            })
            .collect();
        pretty_assert_eq!(paths.len(), 2);
        assert_ne!(paths[0], paths[1], "conflicting names must be hardened");
        for path in paths {
            assert!(
                fs::is_within(&fixture.inputs_dir, path).await.unwrap(),
                "{path:?} escapes the inputs jail"
            );
        }
    }

    #[tokio::test]
    async fn missing_security_context_is_fatal() {
        let fixture = fixture();
        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            false,
        );

        let params: Value = serde_yaml::from_str(
            "secret:\n  c-l-a-s-s: File\n  url: https://example.org/x\n  security-context: prod\n",
        )
        .unwrap();
        let err = stager.materialize(&params, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownSecurityContext { .. })
        ));
    }

    #[tokio::test]
    async fn paranoid_mode_never_links_into_the_cache() {
        let fixture = fixture();
        let source = fixture._temp.path().join("data.txt");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            true,
        );

        let params: Value = serde_yaml::from_str(&format!(
            "data:\n  c-l-a-s-s: File\n  url: \"{}\"\n",
            Url::from_file_path(&source).unwrap()
        ))
        .unwrap();
        let (inputs, _) = stager.materialize(&params, false).await.unwrap();

        let InputValue::Content(content) = &inputs[0].values[0] else {
            panic!("expected staged content");
        };
        let resolved = tokio::fs::canonicalize(&content.local_path).await.unwrap();
        assert!(
            !resolved.starts_with(fixture.cache.cache_dir()),
            "paranoid inputs must not resolve into the shared cache"
        );
        assert!(fs::is_within(&fixture.inputs_dir, &content.local_path)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn glob_explode_emits_one_entry_per_match() {
        let fixture = fixture();
        let source_dir = fixture._temp.path().join("bundle");
        tokio::fs::create_dir_all(source_dir.join("inner"))
            .await
            .unwrap();
        tokio::fs::write(source_dir.join("one.vcf"), b"1").await.unwrap();
        tokio::fs::write(source_dir.join("inner/two.vcf"), b"2")
            .await
            .unwrap();
        tokio::fs::write(source_dir.join("skip.txt"), b"x").await.unwrap();

        let credentials = SecurityContextTable::new();
        let stager = InputStager::new(
            &fixture.cache,
            &fixture.inputs_dir,
            &fixture.outputs_dir,
            &credentials,
            false,
        );

        let params: Value = serde_yaml::from_str(&format!(
            "calls:\n  c-l-a-s-s: Directory\n  url: \"{}\"\n  globExplode: \"**/*.vcf\"\n",
            Url::from_file_path(&source_dir).unwrap()
        ))
        .unwrap();
        let (inputs, _) = stager.materialize(&params, false).await.unwrap();

        pretty_assert_eq!(inputs[0].values.len(), 2);
        for value in &inputs[0].values {
            let InputValue::Content(content) = value else {
                panic!("expected content values");
            };
            assert!(content.licensed_uri.uri.ends_with(".vcf"));
        }
    }
}
