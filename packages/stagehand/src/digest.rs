//! Content fingerprints.
//!
//! Digests are NIH-style: `nih:sha-256;{base64url}` over the raw content.
//! Directory digests fold the digests of every contained file, visited in
//! sorted relative order, so two trees with identical contents produce the
//! same signature regardless of filesystem enumeration order.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use color_eyre::{Result, eyre::Context};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::task::spawn_blocking;
use tracing::instrument;
use walkdir::WalkDir;

use crate::types::{
    ContentKind, GeneratedContent, GeneratedDirectoryContent, LicensedUri, OutputValue,
};

/// Prefix of every digest produced by this module.
pub const NIH_PREFIX: &str = "nih:sha-256;";

fn finish(hasher: Sha256) -> String {
    format!("{NIH_PREFIX}{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Digest an in-memory buffer.
pub fn digest_buffer(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    finish(hasher)
}

/// Digest the contents of a file.
#[instrument]
pub async fn digest_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?} for digest"))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("read {path:?}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(finish(hasher))
}

/// Digest a directory tree by folding the digests of its files in sorted
/// relative order.
#[instrument]
pub async fn digest_directory(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    spawn_blocking(move || digest_directory_blocking(&path))
        .await
        .context("join task")?
}

fn digest_directory_blocking(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {path:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .context("strip walk prefix")?;
        let content = std::fs::read(entry.path())
            .with_context(|| format!("read {:?}", entry.path()))?;
        let mut file_hasher = Sha256::new();
        file_hasher.update(&content);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(file_hasher.finalize());
        hasher.update(b"\n");
    }
    Ok(finish(hasher))
}

/// Hex cache key for a canonical URI.
pub fn cache_key(uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uri.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build a [`GeneratedContent`] for a file, with its signature computed.
pub async fn generated_file_content(
    path: &Path,
    uri: Option<LicensedUri>,
    preferred_filename: Option<String>,
) -> Result<GeneratedContent> {
    let signature = digest_file(path).await?;
    Ok(GeneratedContent {
        local: path.to_path_buf(),
        uri,
        signature: Some(signature),
        preferred_filename,
    })
}

/// Build a [`GeneratedDirectoryContent`] for a directory, with per-entry
/// signatures and an aggregate signature for the directory itself.
pub async fn generated_directory_content(
    path: &Path,
    uri: Option<LicensedUri>,
    preferred_filename: Option<String>,
) -> Result<GeneratedDirectoryContent> {
    let signature = digest_directory(path).await?;
    let mut values = Vec::new();

    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("read directory {path:?}"))?;
    let mut children: Vec<(PathBuf, ContentKind)> = Vec::new();
    while let Some(entry) = entries.next_entry().await.context("next directory entry")? {
        let file_type = entry.file_type().await.context("stat directory entry")?;
        let kind = if file_type.is_dir() {
            ContentKind::Directory
        } else {
            ContentKind::File
        };
        children.push((entry.path(), kind));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));

    for (child, kind) in children {
        match kind {
            ContentKind::Directory => {
                let nested = Box::pin(generated_directory_content(&child, None, None)).await?;
                values.push(OutputValue::Directory(nested));
            }
            _ => {
                values.push(OutputValue::File(
                    generated_file_content(&child, None, None).await?,
                ));
            }
        }
    }

    Ok(GeneratedDirectoryContent {
        local: path.to_path_buf(),
        uri,
        signature: Some(signature),
        preferred_filename,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn buffer_digest_is_stable() {
        let digest = digest_buffer(b"hello world");
        assert!(digest.starts_with(NIH_PREFIX));
        pretty_assert_eq!(digest, digest_buffer(b"hello world"));
        assert_ne!(digest, digest_buffer(b"hello worlds"));
    }

    #[tokio::test]
    async fn file_and_buffer_digests_agree() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("sample.txt");
        tokio::fs::write(&path, b"sample content").await.unwrap();
        pretty_assert_eq!(
            digest_file(&path).await.unwrap(),
            digest_buffer(b"sample content")
        );
    }

    #[tokio::test]
    async fn directory_digest_ignores_enumeration_order() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        for dir in [&a, &b] {
            tokio::fs::create_dir_all(dir.join("sub")).await.unwrap();
        }
        // Create in different orders; contents are identical.
        tokio::fs::write(a.join("x.txt"), b"one").await.unwrap();
        tokio::fs::write(a.join("sub/y.txt"), b"two").await.unwrap();
        tokio::fs::write(b.join("sub/y.txt"), b"two").await.unwrap();
        tokio::fs::write(b.join("x.txt"), b"one").await.unwrap();

        pretty_assert_eq!(
            digest_directory(&a).await.unwrap(),
            digest_directory(&b).await.unwrap()
        );
    }

    #[tokio::test]
    async fn directory_content_carries_entries() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("out");
        tokio::fs::create_dir_all(dir.join("nested")).await.unwrap();
        tokio::fs::write(dir.join("result.txt"), b"42").await.unwrap();
        tokio::fs::write(dir.join("nested/inner.txt"), b"43")
            .await
            .unwrap();

        let content = generated_directory_content(&dir, None, None).await.unwrap();
        assert!(content.signature.is_some());
        pretty_assert_eq!(content.values.len(), 2);
    }
}
