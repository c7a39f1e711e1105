//! Where a resource's exports come from
//!
//! The harvester publishes one TSV per table under
//! `{base}/resources/{path}/publish/{file}`. Operators can also point the
//! pipeline at a local directory holding the same files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::config::PublishConfig;
use super::resource::Resource;
use crate::error::PublishError;

/// Source of export files for one resource
#[async_trait]
pub trait ResourceRepo: Send + Sync {
    async fn exists(&self, file: &str) -> Result<bool>;

    /// Copy `file` to `dest`. Returns the number of bytes written, or `None`
    /// when the repository has no such file (`dest` is then not created).
    async fn download(&self, file: &str, dest: &Path) -> Result<Option<u64>>;

    /// Human-readable location of `file`, for log messages.
    fn describe(&self, file: &str) -> String;
}

/// Harvester repository over HTTP
pub struct HarvestRepo {
    client: Client,
    base_url: String,
    resource_path: String,
}

impl HarvestRepo {
    pub fn new(base_url: &str, resource_path: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .user_agent("publishing-worker/1.0")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            resource_path: resource_path.to_string(),
        })
    }

    fn url(&self, file: &str) -> String {
        format!("{}/resources/{}/publish/{}", self.base_url, self.resource_path, file)
    }
}

#[async_trait]
impl ResourceRepo for HarvestRepo {
    async fn exists(&self, file: &str) -> Result<bool> {
        let url = self.url(file);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", url))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(PublishError::Repo(format!("HEAD {} returned {}", url, status)).into()),
        }
    }

    async fn download(&self, file: &str, dest: &Path) -> Result<Option<u64>> {
        let url = self.url(file);
        debug!(url = %url, dest = %dest.display(), "Downloading export");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if !status.is_success() => {
                Err(PublishError::Repo(format!("GET {} returned {}", url, status)).into())
            },
            _ => {
                let mut out = tokio::fs::File::create(dest)
                    .await
                    .with_context(|| format!("Failed to create {}", dest.display()))?;

                let mut stream = response.bytes_stream();
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.with_context(|| format!("Failed to read body of {}", url))?;
                    out.write_all(&chunk)
                        .await
                        .with_context(|| format!("Failed to write {}", dest.display()))?;
                    written += chunk.len() as u64;
                }
                out.flush()
                    .await
                    .with_context(|| format!("Failed to write {}", dest.display()))?;

                Ok(Some(written))
            },
        }
    }

    fn describe(&self, file: &str) -> String {
        self.url(file)
    }
}

/// Exports sitting in a local directory
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ResourceRepo for LocalRepo {
    async fn exists(&self, file: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.root.join(file)).await?)
    }

    async fn download(&self, file: &str, dest: &Path) -> Result<Option<u64>> {
        match tokio::fs::copy(self.root.join(file), dest).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to copy {}", self.describe(file))),
        }
    }

    fn describe(&self, file: &str) -> String {
        self.root.join(file).display().to_string()
    }
}

/// The harvester repository of `resource`, as configured.
pub fn harvest_repo_for(config: &PublishConfig, resource: &Resource) -> Result<HarvestRepo> {
    let base_url = config
        .harvest_url
        .as_deref()
        .ok_or_else(|| PublishError::Repo("PUBLISH_HARVEST_URL is not set".to_string()))?;
    HarvestRepo::new(base_url, &resource.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_harvest_repo_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/fish/publish/nodes.tsv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1\t\\N\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fish_nodes.tsv");
        let repo = HarvestRepo::new(&server.uri(), "fish").unwrap();

        assert_eq!(repo.download("nodes.tsv", &dest).await.unwrap(), Some(5));
        assert_eq!(std::fs::read(&dest).unwrap(), b"1\t\\N\n");
    }

    #[tokio::test]
    async fn test_harvest_repo_missing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fish_media.tsv");
        let repo = HarvestRepo::new(&server.uri(), "fish").unwrap();
        assert!(repo.download("media.tsv", &dest).await.unwrap().is_none());
        assert!(!dest.exists());
        assert!(!repo.exists("media.tsv").await.unwrap());
    }

    #[tokio::test]
    async fn test_harvest_repo_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let repo = HarvestRepo::new(&server.uri(), "fish").unwrap();
        assert!(repo.download("nodes.tsv", &dir.path().join("n.tsv")).await.is_err());
    }

    #[test]
    fn test_harvest_repo_describe() {
        let repo = HarvestRepo::new("http://harvest.local/", "fish").unwrap();
        assert_eq!(
            repo.describe("nodes.tsv"),
            "http://harvest.local/resources/fish/publish/nodes.tsv"
        );
    }

    #[tokio::test]
    async fn test_local_repo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nodes.tsv"), "1\n").unwrap();

        let staging = tempfile::tempdir().unwrap();
        let dest = staging.path().join("fish_nodes.tsv");

        let repo = LocalRepo::new(dir.path());
        assert!(repo.exists("nodes.tsv").await.unwrap());
        assert!(!repo.exists("media.tsv").await.unwrap());
        assert_eq!(repo.download("nodes.tsv", &dest).await.unwrap(), Some(2));
        assert_eq!(std::fs::read(&dest).unwrap(), b"1\n");
        assert!(repo
            .download("media.tsv", &staging.path().join("fish_media.tsv"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_harvest_repo_requires_url() {
        let resource = Resource {
            id: 1,
            name: "Fish".to_string(),
            path: "fish".to_string(),
            classification: false,
        };
        assert!(harvest_repo_for(&PublishConfig::default(), &resource).is_err());

        let config = PublishConfig {
            harvest_url: Some("http://harvest.local".to_string()),
            ..PublishConfig::default()
        };
        let repo = harvest_repo_for(&config, &resource).unwrap();
        assert_eq!(
            repo.describe("nodes.tsv"),
            "http://harvest.local/resources/fish/publish/nodes.tsv"
        );
    }
}
