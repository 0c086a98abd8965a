//! The rendering engine seam.
//!
//! [`RenderingEngine`] is the submit / stream / fetch protocol the
//! pipeline needs from ComfyUI. [`ComfyUIEngine`] implements it over the
//! REST and WebSocket clients; tests substitute scripted fakes.

use async_trait::async_trait;
use comfybot_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use comfybot_comfyui::client::{ComfyUIClient, ComfyUIClientError};
use comfybot_comfyui::history::OutputImage;
use comfybot_comfyui::messages::StreamEvent;
use futures::stream::{BoxStream, StreamExt};

/// Lazy sequence of engine events for one client id. Not restartable.
pub type EventStream = BoxStream<'static, Result<StreamEvent, EngineError>>;

/// Errors from talking to the rendering engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Stream(#[from] ComfyUIClientError),
}

#[async_trait]
pub trait RenderingEngine: Send + Sync {
    /// Open the event channel scoped to `client_id`.
    ///
    /// Must be called before [`submit`](Self::submit) so no event for
    /// the new prompt is missed.
    async fn open_events(&self, client_id: &str) -> Result<EventStream, EngineError>;

    /// Queue a prepared workflow, returning the engine's prompt id.
    async fn submit(&self, workflow: &serde_json::Value, client_id: &str)
        -> Result<String, EngineError>;

    /// Stop whatever prompt is currently executing.
    async fn interrupt(&self) -> Result<(), EngineError>;

    /// Remove a prompt that has not started yet.
    async fn dequeue(&self, prompt_id: &str) -> Result<(), EngineError>;

    /// Output manifest for a finished prompt.
    async fn fetch_history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineError>;

    /// Raw bytes of one output image.
    async fn fetch_image(&self, image: &OutputImage) -> Result<Vec<u8>, EngineError>;
}

/// [`RenderingEngine`] backed by a live ComfyUI server.
pub struct ComfyUIEngine {
    api: ComfyUIApi,
    client: ComfyUIClient,
}

impl ComfyUIEngine {
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `ws_url`  - WebSocket endpoint, e.g. `ws://host:8188/ws`.
    pub fn new(http: reqwest::Client, api_url: String, ws_url: String) -> Self {
        Self {
            api: ComfyUIApi::with_client(http, api_url),
            client: ComfyUIClient::new(ws_url),
        }
    }
}

#[async_trait]
impl RenderingEngine for ComfyUIEngine {
    async fn open_events(&self, client_id: &str) -> Result<EventStream, EngineError> {
        let connection = self.client.connect(client_id).await?;
        Ok(connection
            .into_events()
            .map(|event| event.map_err(EngineError::from))
            .boxed())
    }

    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<String, EngineError> {
        let response = self.api.submit_workflow(workflow, client_id).await?;
        tracing::debug!(
            prompt_id = %response.prompt_id,
            number = response.number,
            "Workflow queued on ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn interrupt(&self) -> Result<(), EngineError> {
        Ok(self.api.interrupt().await?)
    }

    async fn dequeue(&self, prompt_id: &str) -> Result<(), EngineError> {
        Ok(self.api.delete_from_queue(prompt_id).await?)
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<serde_json::Value, EngineError> {
        Ok(self.api.get_history(prompt_id).await?)
    }

    async fn fetch_image(&self, image: &OutputImage) -> Result<Vec<u8>, EngineError> {
        Ok(self.api.view_image(image).await?)
    }
}
