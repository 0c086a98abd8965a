//! ComfyUI HTTP endpoints used by the bot.
//!
//! | Method | Path                 | Used for                          |
//! |--------|----------------------|-----------------------------------|
//! | POST   | `/prompt`            | submit a workflow                 |
//! | POST   | `/queue`             | delete a pending prompt           |
//! | POST   | `/interrupt`         | stop the running prompt           |
//! | GET    | `/history/{id}`      | output manifest of a prompt       |
//! | GET    | `/view`              | download an output image          |

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::history::OutputImage;

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Network, DNS or TLS failure, or an undecodable body.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI answered with a non-2xx status.
    #[error("ComfyUI API error ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Position in ComfyUI's execution queue.
    pub number: i64,
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// HTTP client for one ComfyUI server.
pub struct ComfyUIApi {
    client: reqwest::Client,
    base_url: String,
}

impl ComfyUIApi {
    /// * `base_url` - e.g. `http://127.0.0.1:8188`.
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Share an existing connection pool.
    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Queue `workflow` for execution. Progress events for it are sent
    /// to the WebSocket connection opened with the same `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = json!({ "prompt": workflow, "client_id": client_id });
        let response = self.client.post(self.endpoint("/prompt")).json(&body).send().await?;
        decode(response).await
    }

    /// Drop a prompt that is still waiting in ComfyUI's queue. A running
    /// prompt is unaffected; see [`interrupt`](Self::interrupt).
    pub async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = json!({ "delete": [prompt_id] });
        let response = self.client.post(self.endpoint("/queue")).json(&body).send().await?;
        successful(response).await.map(drop)
    }

    /// Stop whatever prompt is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self.client.post(self.endpoint("/interrupt")).send().await?;
        successful(response).await.map(drop)
    }

    /// History entry of `prompt_id`, keyed by the prompt id.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/history/{prompt_id}")))
            .send()
            .await?;
        decode(response).await
    }

    /// Raw bytes of an output image.
    pub async fn view_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(self.endpoint("/view"))
            .query(&view_query(image))
            .send()
            .await?;
        let response = successful(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Query of `GET /view`. Empty subfolders and unknown types are left out.
fn view_query(image: &OutputImage) -> Vec<(&'static str, &str)> {
    let mut query = vec![("filename", image.filename.as_str())];
    if !image.subfolder.is_empty() {
        query.push(("subfolder", image.subfolder.as_str()));
    }
    if let Some(kind) = &image.kind {
        query.push(("type", kind.as_str()));
    }
    query
}

async fn successful(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ComfyUIApiError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ComfyUIApiError> {
    Ok(successful(response).await?.json::<T>().await?)
}
