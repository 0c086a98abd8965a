use comfybot_comfyui::workflow::WorkflowError;

use crate::engine::EngineError;
use crate::enhance::EnhanceError;
use crate::media::MediaError;
use crate::transport::TransportError;

/// Anything that can abort a job inside the generation pipeline.
///
/// Caught once at the pipeline boundary and reported to the user as a
/// generic failure.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Enhance(#[from] EnhanceError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),

    /// The engine's event stream or output did not follow the protocol.
    #[error("Engine protocol error: {0}")]
    EngineProtocol(String),
}
