//! Per-user queue worker.
//!
//! One worker task runs per non-empty user queue. It is started by
//! whoever observed the queue going from empty to non-empty
//! ([`Enqueued::start_worker`](comfybot_core::queue::Enqueued)) and exits
//! once [`UserQueueManager::advance`] reports the queue drained.

use std::sync::Arc;

use comfybot_core::queue::UserQueueManager;
use comfybot_core::types::UserId;

use crate::pipeline::GenerationPipeline;

/// Process the user's queue head-first until it is empty.
pub async fn process_user_queue(
    queues: Arc<UserQueueManager>,
    pipeline: Arc<GenerationPipeline>,
    user_id: UserId,
) {
    let mut next = queues.head(user_id).await;
    while let Some(record) = next {
        tracing::info!(
            user_id,
            job_id = record.id(),
            "Processing user queue",
        );
        let outcome = pipeline.run(&record).await;
        tracing::info!(user_id, job_id = record.id(), ?outcome, "Job finished");
        next = queues.advance(user_id).await;
    }
    tracing::debug!(user_id, "User queue drained");
}

