use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfybot::config::Config;
use comfybot::handlers::{bot_commands, Bot};
use comfybot::poller;
use comfybot::telegram::{TelegramApi, TelegramTransport};
use comfybot_comfyui::workflow::WorkflowTemplate;
use comfybot_core::queue::UserQueueManager;
use comfybot_pipeline::engine::ComfyUIEngine;
use comfybot_pipeline::enhance::ServiceRegistry;
use comfybot_pipeline::media::MediaDir;
use comfybot_pipeline::pipeline::{GenerationPipeline, PipelineSettings};

/// How long running queue workers get to finish after shutdown starts.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- Tracing ---
    let default_filter = if config.logger.debug {
        "comfybot=debug"
    } else {
        "comfybot=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let image_config = &config.image_generation;
    tracing::info!(
        server_url = %image_config.server_url,
        workflow = %image_config.workflow_path.display(),
        "Loaded configuration",
    );

    // --- Rendering engine ---
    let http = reqwest::Client::new();
    let engine = Arc::new(ComfyUIEngine::new(
        http.clone(),
        image_config.server_url.clone(),
        image_config.websocket_url.clone(),
    ));
    let workflow = WorkflowTemplate::load(&image_config.workflow_path)
        .context("Failed to load workflow template")?;
    let media = match &image_config.media_dir {
        Some(dir) => MediaDir::new(dir),
        None => MediaDir::in_system_temp(),
    }
    .context("Failed to create media directory")?;
    tracing::info!(media_dir = %media.root().display(), "Media directory ready");

    // --- Telegram ---
    let transport = Arc::new(TelegramTransport::new(TelegramApi::new(
        http.clone(),
        &config.telegram.api_url,
        &config.telegram.token,
    )));

    // --- Pipeline ---
    let settings = PipelineSettings {
        models: image_config.model_files(),
        save_images: image_config.save_images,
        preview_every_n_steps: image_config.update_preview_every_n_steps,
    };
    let mut pipeline = GenerationPipeline::new(engine, transport.clone(), workflow, settings, media);
    if let Some(pe) = &config.prompt_enhancement {
        let enhancer = ServiceRegistry::builtin()
            .create(pe)
            .context("Failed to create prompt enhancement service")?;
        tracing::info!(service = %pe.service, types = pe.types.len(), "Prompt enhancement enabled");
        pipeline = pipeline.with_enhancer(enhancer);
    }

    let bot = Bot::new(
        Arc::new(UserQueueManager::new()),
        Arc::new(pipeline),
        transport.clone(),
        config.modes()?,
        &config.enhance_types(),
    );

    if let Err(e) = transport.api().set_my_commands(&bot_commands()).await {
        tracing::warn!(error = %e, "Failed to register bot commands");
    }

    // --- Polling ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    poller::run(
        transport.api(),
        &bot,
        config.telegram.poll_timeout_secs,
        cancel,
    )
    .await;

    // --- Post-shutdown cleanup ---
    bot.workers().close();
    let running = bot.workers().len();
    if running > 0 {
        tracing::info!(running, "Waiting for queue workers to finish");
        if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, bot.workers().wait())
            .await
            .is_err()
        {
            tracing::warn!("Queue workers still running, exiting anyway");
        }
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
