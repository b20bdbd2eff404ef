//! Git repository fetcher.
//!
//! Clones through the `git` CLI, checks out a branch, tag or commit, and
//! records the effective checkout (always a commit hash). Also hosts the
//! pattern-based recognizer that derives a [`RemoteRepo`] from GitHub,
//! GitLab and generic git URIs.

use std::path::Path;

use async_trait::async_trait;
use color_eyre::{Result, eyre::Context};
use lazy_regex::regex_captures;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, instrument};
use url::Url;

use crate::process::{self, Limits};
use crate::types::{ContentKind, LicensedUri, RemoteRepo, UriMetadata};

use super::{FetchOutcome, FetchedPayload, SchemeFetcher};

/// Try to recognize a repository reference inside an absolute URI.
///
/// Understands the usual GitHub and GitLab web URLs (including `tree`,
/// `blob` and `raw` views and `raw.githubusercontent.com`), `git+http(s)`
/// wrappers, and bare `.git` URLs. A URL fragment is taken as the tag.
pub fn guess_repo_params(raw: &str) -> Option<RemoteRepo> {
    let trimmed = raw.strip_prefix("git+").unwrap_or(raw);
    let url = Url::parse(trimmed).ok()?;
    let fragment_tag = url.fragment().map(str::to_string);

    // Generic git references (git+ wrappers, git/ssh schemes, bare .git
    // paths) need no host-specific handling, and may not even have a host.
    let is_gitty = raw.starts_with("git+")
        || url.scheme() == "git"
        || url.scheme() == "ssh"
        || url.path().ends_with(".git");

    let Some(host) = url.host_str() else {
        if is_gitty {
            let mut clean = url.clone();
            clean.set_fragment(None);
            return Some(RemoteRepo {
                repo_url: clean.to_string(),
                tag: fragment_tag,
                rel_path: None,
            });
        }
        return None;
    };
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    if host == "raw.githubusercontent.com" {
        // raw.githubusercontent.com/{owner}/{repo}/{tag}/{rel...}
        if segments.len() >= 3 {
            let rel = join_rel(&segments[3..]);
            return Some(RemoteRepo {
                repo_url: format!("https://github.com/{}/{}.git", segments[0], segments[1]),
                tag: Some(segments[2].to_string()),
                rel_path: rel,
            });
        }
        return None;
    }

    if host == "github.com" {
        if segments.len() < 2 {
            return None;
        }
        let owner = segments[0];
        let repo = segments[1].trim_end_matches(".git");
        let repo_url = format!("https://github.com/{owner}/{repo}.git");
        return Some(match segments.get(2).copied() {
            // github.com/{owner}/{repo}/(tree|blob)/{tag}/{rel...}
            Some("tree") | Some("blob") if segments.len() >= 4 => RemoteRepo {
                repo_url,
                tag: Some(segments[3].to_string()),
                rel_path: join_rel(&segments[4..]),
            },
            _ => RemoteRepo {
                repo_url,
                tag: fragment_tag,
                rel_path: None,
            },
        });
    }

    if host.contains("gitlab") {
        if segments.len() < 2 {
            return None;
        }
        // gitlab.example.org/{group}/{repo}/-/(tree|blob|raw)/{tag}/{rel...}
        if let Some(dash) = segments.iter().position(|s| *s == "-") {
            let (group_repo, view) = segments.split_at(dash);
            let repo_url = format!(
                "{}://{}/{}.git",
                url.scheme(),
                host,
                group_repo.join("/").trim_end_matches(".git")
            );
            if view.len() >= 3 && matches!(view[1], "tree" | "blob" | "raw") {
                return Some(RemoteRepo {
                    repo_url,
                    tag: Some(view[2].to_string()),
                    rel_path: join_rel(&view[3..]),
                });
            }
            return Some(RemoteRepo {
                repo_url,
                tag: fragment_tag,
                rel_path: None,
            });
        }
        let repo_url = format!(
            "{}://{}/{}.git",
            url.scheme(),
            host,
            segments.join("/").trim_end_matches(".git")
        );
        return Some(RemoteRepo {
            repo_url,
            tag: fragment_tag,
            rel_path: None,
        });
    }

    // Generic: explicit git schemes or a path that names a .git repository.
    if is_gitty {
        let mut clean = url.clone();
        clean.set_fragment(None);
        return Some(RemoteRepo {
            repo_url: clean.to_string(),
            tag: fragment_tag,
            rel_path: None,
        });
    }

    None
}

fn join_rel(parts: &[&str]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Clone `repo` into `dest` and check out its tag. Returns the effective
/// checkout, which is always a commit hash. When `dest` already holds a
/// clone it is reused as-is (the cache handler decides when that happens).
#[instrument(skip(limits))]
pub async fn materialize_repo(repo: &RemoteRepo, dest: &Path, limits: Limits) -> Result<String> {
    let already_cloned = tokio::fs::try_exists(dest.join(".git"))
        .await
        .unwrap_or(false);

    if !already_cloned {
        let mut clone = Command::new("git");
        clone.args(["clone", "--recurse-submodules", &repo.repo_url]);
        clone.arg(dest);
        process::run_checked(clone, "git clone", limits)
            .await
            .with_context(|| format!("clone {}", repo.repo_url))?;

        if let Some(tag) = &repo.tag {
            let mut checkout = Command::new("git");
            checkout.arg("-C").arg(dest);
            checkout.args(["checkout", "--recurse-submodules", tag]);
            process::run_checked(checkout, "git checkout", limits)
                .await
                .with_context(|| format!("checkout {tag:?} of {}", repo.repo_url))?;
        }
    } else {
        debug!(?dest, "reusing existing clone");
    }

    let mut rev_parse = Command::new("git");
    rev_parse.arg("-C").arg(dest);
    rev_parse.args(["rev-parse", "HEAD"]);
    process::run_capture(rev_parse, "git rev-parse", limits)
        .await
        .context("resolve effective checkout")
}

/// The default branch advertised by a remote, when it can be determined.
pub async fn default_branch(repo_url: &str, limits: Limits) -> Result<Option<String>> {
    let mut ls_remote = Command::new("git");
    ls_remote.args(["ls-remote", "--symref", repo_url, "HEAD"]);
    let output = process::run_capture(ls_remote, "git ls-remote", limits).await?;
    for line in output.lines() {
        if let Some((_, branch)) = regex_captures!(r"^ref:\s+refs/heads/(\S+)\s+HEAD", line) {
            return Ok(Some(branch.to_string()));
        }
    }
    Ok(None)
}

/// Scheme fetcher wrapping [`materialize_repo`]. The canonical form is
/// `git+https://host/repo.git#tag`; the clone root is materialized at the
/// destination as a directory.
#[derive(Default)]
pub struct GitFetcher {
    limits: Limits,
}

#[async_trait]
impl SchemeFetcher for GitFetcher {
    fn schemes(&self) -> &[&'static str] {
        &["git", "git+https", "git+http", "git+ssh"]
    }

    #[instrument(skip(self), fields(uri = %uri.uri))]
    async fn fetch(&self, uri: &LicensedUri, dest: &Path) -> Result<FetchOutcome> {
        let repo = guess_repo_params(&uri.uri).ok_or_else(|| {
            crate::error::ResolverError::UnsupportedGitHost {
                uri: uri.uri.clone(),
            }
        })?;

        let effective_checkout = materialize_repo(&repo, dest, self.limits).await?;

        let metadata = UriMetadata::new(
            uri.uri.clone(),
            json!({
                "repo_url": repo.repo_url,
                "tag": repo.tag,
                "rel_path": repo.rel_path,
                "effective_checkout": effective_checkout,
            }),
        );

        Ok(FetchOutcome::Materialized(FetchedPayload {
            kind: ContentKind::Directory,
            metadata,
            licences: uri.licences.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    #[test_case(
        "https://github.com/org/repo.git",
        "https://github.com/org/repo.git",
        None,
        None;
        "bare github clone url"
    )]
    #[test_case(
        "https://github.com/org/repo/tree/v1.2/workflows/align",
        "https://github.com/org/repo.git",
        Some("v1.2"),
        Some("workflows/align");
        "github tree view"
    )]
    #[test_case(
        "https://raw.githubusercontent.com/org/repo/main/main.nf",
        "https://github.com/org/repo.git",
        Some("main"),
        Some("main.nf");
        "raw githubusercontent"
    )]
    #[test_case(
        "https://gitlab.example.org/group/repo/-/tree/develop/wf",
        "https://gitlab.example.org/group/repo.git",
        Some("develop"),
        Some("wf");
        "gitlab tree view"
    )]
    #[test]
    fn recognizes_repo_urls(
        input: &str,
        repo_url: &str,
        tag: Option<&str>,
        rel_path: Option<&str>,
    ) {
        let repo = guess_repo_params(input).expect("should recognize");
        pretty_assert_eq!(repo.repo_url, repo_url);
        pretty_assert_eq!(repo.tag.as_deref(), tag);
        pretty_assert_eq!(repo.rel_path.as_deref(), rel_path);
    }

    #[test]
    fn fragment_becomes_tag() {
        let repo = guess_repo_params("git+https://example.org/wf.git#v2").unwrap();
        pretty_assert_eq!(repo.repo_url, "https://example.org/wf.git");
        pretty_assert_eq!(repo.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn plain_https_is_not_a_repo() {
        assert!(guess_repo_params("https://example.org/data/file.txt").is_none());
    }
}
