//! Turns stored media references into something a destination can fetch.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

use crate::config;
use crate::db::MediaAttachment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMedia {
    /// Public URL or local filesystem path.
    pub location: String,
    pub mime_type: Option<String>,
    pub alt_text: Option<String>,
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, media: &MediaAttachment) -> Result<ResolvedMedia>;
}

/// Resolves storage keys against a local media root, or against a public base
/// URL when one is configured.
#[derive(Debug, Clone)]
pub struct LocalMediaResolver {
    root: PathBuf,
    public_base: Option<Url>,
}

impl LocalMediaResolver {
    pub fn new(root: impl Into<PathBuf>, public_base: Option<Url>) -> Self {
        Self {
            root: root.into(),
            public_base,
        }
    }

    pub fn from_config(cfg: &config::Media) -> Result<Self> {
        let public_base = cfg
            .public_base_url
            .as_deref()
            .map(|base| {
                // Url::join drops the last segment unless the base ends in '/'.
                let normalized = if base.ends_with('/') {
                    base.to_string()
                } else {
                    format!("{}/", base)
                };
                Url::parse(&normalized).context("invalid media.public_base_url")
            })
            .transpose()?;
        Ok(Self::new(&cfg.root_dir, public_base))
    }
}

/// Reject keys that could escape the media root.
fn checked_key(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    if key.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(anyhow!("invalid media storage key {:?}", key));
    }
    Ok(path)
}

#[async_trait]
impl MediaResolver for LocalMediaResolver {
    async fn resolve(&self, media: &MediaAttachment) -> Result<ResolvedMedia> {
        let key = checked_key(&media.storage_key)?;
        let location = match &self.public_base {
            Some(base) => base
                .join(&media.storage_key)
                .with_context(|| format!("cannot build url for {}", media.storage_key))?
                .to_string(),
            None => {
                let path = self.root.join(key);
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(anyhow!("media file missing: {}", path.display()));
                }
                path.to_string_lossy().into_owned()
            }
        };
        Ok(ResolvedMedia {
            location,
            mime_type: media.mime_type.clone(),
            alt_text: media.alt_text.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(key: &str) -> MediaAttachment {
        MediaAttachment {
            id: 1,
            storage_key: key.into(),
            mime_type: Some("image/jpeg".into()),
            alt_text: Some("a cat".into()),
            position: 0,
        }
    }

    #[tokio::test]
    async fn resolves_against_public_base() {
        let cfg = config::Media {
            root_dir: "/unused".into(),
            public_base_url: Some("https://cdn.example.com/media".into()),
        };
        let resolver = LocalMediaResolver::from_config(&cfg).unwrap();
        let resolved = resolver.resolve(&attachment("u1/cat.jpg")).await.unwrap();
        assert_eq!(resolved.location, "https://cdn.example.com/media/u1/cat.jpg");
        assert_eq!(resolved.alt_text.as_deref(), Some("a cat"));
    }

    #[tokio::test]
    async fn resolves_local_files_and_reports_missing() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("cat.jpg"), b"jpeg").unwrap();
        let resolver = LocalMediaResolver::new(td.path(), None);

        let resolved = resolver.resolve(&attachment("cat.jpg")).await.unwrap();
        assert_eq!(resolved.location, td.path().join("cat.jpg").to_string_lossy());

        assert!(resolver.resolve(&attachment("dog.jpg")).await.is_err());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let resolver = LocalMediaResolver::new("/srv/media", None);
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(resolver.resolve(&attachment(key)).await.is_err(), "{}", key);
        }
    }
}
