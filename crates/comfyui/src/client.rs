//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket URL of a single ComfyUI
//! instance. Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] scoped to one client id, then turn it into a
//! stream of [`StreamEvent`]s with [`ComfyUIConnection::into_events`].

use futures::stream::{BoxStream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use crate::messages::{parse_frame, StreamEvent};

/// Configuration handle for a ComfyUI instance's event endpoint.
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake. ComfyUI only
    /// delivers progress for prompts submitted with this same id.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// Create a new client targeting a specific ComfyUI instance.
    ///
    /// * `ws_url` - WebSocket endpoint, e.g. `ws://host:8188/ws`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// `client_id` is appended as a query parameter so that ComfyUI can
    /// address messages back to this specific client.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Consume the connection as a lazy, non-restartable event stream.
    ///
    /// Text frames of unmodelled types and control frames are skipped.
    /// The stream ends when the server closes the socket.
    pub fn into_events(self) -> BoxStream<'static, Result<StreamEvent, ComfyUIClientError>> {
        let client_id = self.client_id;
        self.ws_stream
            .take_while(|frame| futures::future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(move |frame| {
                let event = match frame {
                    Ok(Message::Text(text)) => match parse_frame(&text) {
                        Ok(Some(msg)) => Some(Ok(StreamEvent::Message(msg))),
                        Ok(None) => {
                            tracing::debug!(client_id = %client_id, "Skipping unrecognised ComfyUI message: {text}");
                            None
                        }
                        Err(e) => Some(Err(ComfyUIClientError::Protocol(format!(
                            "Malformed ComfyUI message: {e}"
                        )))),
                    },
                    Ok(Message::Binary(data)) => Some(Ok(StreamEvent::Binary(data))),
                    Ok(_) => None,
                    Err(e) => Some(Err(ComfyUIClientError::Protocol(e.to_string()))),
                };
                futures::future::ready(event)
            })
            .boxed()
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
