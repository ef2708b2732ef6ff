use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::models::{EntryKind, SandboxError, SandboxResult};

/// One node of a project's persisted file tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub children: Vec<TreeNode>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Durable storage for project files. Paths are relative to the project root
/// and use `/` separators.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn read(&self, project_id: &str, path: &str) -> SandboxResult<Vec<u8>>;
    async fn write(&self, project_id: &str, path: &str, content: &[u8]) -> SandboxResult<()>;
    async fn create_folder(&self, project_id: &str, path: &str) -> SandboxResult<()>;
    async fn delete(&self, project_id: &str, path: &str) -> SandboxResult<()>;
    async fn list_tree(&self, project_id: &str) -> SandboxResult<Vec<TreeNode>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TreeResponse {
    Root(TreeNode),
    Nodes(Vec<TreeNode>),
}

#[derive(Serialize)]
struct FolderRequest<'a> {
    path: &'a str,
}

/// REST client for the storage service.
///
/// `GET  projects/{id}/tree`
/// `GET  projects/{id}/files?path=` / `PUT projects/{id}/files?path=`
/// `POST projects/{id}/folders` with `{"path": ...}`
/// `DELETE projects/{id}/items?path=`
pub struct HttpProjectStore {
    client: Client,
    base: Url,
}

impl HttpProjectStore {
    pub fn new(base_url: &str, timeout: Duration) -> SandboxResult<Self> {
        // Url::join drops the last segment unless the base ends with '/'
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .map_err(|e| SandboxError::Transport(format!("invalid store url {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, project_id: &str, resource: &str, path: Option<&str>) -> SandboxResult<Url> {
        let mut url = self
            .base
            .join(&format!("projects/{}/{}", project_id, resource))
            .map_err(|e| SandboxError::Transport(e.to_string()))?;
        if let Some(path) = path {
            url.query_pairs_mut().append_pair("path", path);
        }
        Ok(url)
    }

    async fn check(response: reqwest::Response, what: &str) -> SandboxResult<reqwest::Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(SandboxError::NotFound(what.to_string())),
            status => {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(SandboxError::Transport(format!(
                    "{} failed ({}): {}",
                    what, status, error_text
                )))
            }
        }
    }
}

fn transport(e: reqwest::Error) -> SandboxError {
    SandboxError::Transport(e.to_string())
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn read(&self, project_id: &str, path: &str) -> SandboxResult<Vec<u8>> {
        let url = self.endpoint(project_id, "files", Some(path))?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        let response = Self::check(response, &format!("read {}", path)).await?;
        let body = response.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }

    async fn write(&self, project_id: &str, path: &str, content: &[u8]) -> SandboxResult<()> {
        let url = self.endpoint(project_id, "files", Some(path))?;
        debug!("Uploading {} ({} bytes) for project {}", path, content.len(), project_id);
        let response = self
            .client
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await
            .map_err(transport)?;
        Self::check(response, &format!("write {}", path)).await?;
        Ok(())
    }

    async fn create_folder(&self, project_id: &str, path: &str) -> SandboxResult<()> {
        let url = self.endpoint(project_id, "folders", None)?;
        let response = self
            .client
            .post(url)
            .json(&FolderRequest { path })
            .send()
            .await
            .map_err(transport)?;
        Self::check(response, &format!("create folder {}", path)).await?;
        Ok(())
    }

    async fn delete(&self, project_id: &str, path: &str) -> SandboxResult<()> {
        let url = self.endpoint(project_id, "items", Some(path))?;
        let response = self.client.delete(url).send().await.map_err(transport)?;
        match Self::check(response, &format!("delete {}", path)).await {
            // Already gone is the outcome we wanted
            Err(SandboxError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn list_tree(&self, project_id: &str) -> SandboxResult<Vec<TreeNode>> {
        let url = self.endpoint(project_id, "tree", None)?;
        let response = self.client.get(url).send().await.map_err(transport)?;
        let response = Self::check(response, "list tree").await?;
        let tree = response
            .json::<TreeResponse>()
            .await
            .map_err(transport)?;
        Ok(match tree {
            TreeResponse::Root(root) => root.children,
            TreeResponse::Nodes(nodes) => nodes,
        })
    }
}
