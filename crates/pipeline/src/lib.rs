//! Job execution for the chat bot.
//!
//! [`pipeline::GenerationPipeline`] drives one queued job from prompt
//! templating through ComfyUI submission, progress streaming and result
//! delivery. The engine, chat transport and prompt enhancer are reached
//! through the [`engine::RenderingEngine`], [`transport::ChatTransport`]
//! and [`enhance::PromptEnhancer`] traits so the pipeline can be driven
//! by in-memory fakes in tests.

pub mod engine;
pub mod enhance;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod transport;
pub mod worker;
