//! Per-user queue worker tests.

mod common;

use assert_matches::assert_matches;
use comfybot_pipeline::worker::process_user_queue;

use common::*;

/// A batch request renders one image per record and leaves the queue empty.
#[tokio::test]
async fn worker_drains_batch() {
    let harness = Harness::new(FakeEngine::new(successful_run()));
    let records = harness.enqueue("a red fox 3x").await;
    assert_eq!(records.len(), 3);

    tokio::spawn(process_user_queue(harness.queues.clone(), harness.pipeline.clone(), USER))
        .await
        .unwrap();

    assert_eq!(harness.engine.submitted().len(), 3);
    assert!(harness.queues.status(USER).await.is_empty());
    assert!(harness.queues.head(USER).await.is_none());
    assert_eq!(harness.leftover_files(), 0);
}

/// `cancel_all` drops the pending records and the cancelled head is
/// retired without reaching the engine.
#[tokio::test]
async fn cancel_all_before_start_submits_nothing() {
    let harness = Harness::new(FakeEngine::new(successful_run()));
    harness.enqueue("a red fox 3x").await;

    assert!(harness.queues.cancel_all(USER).await);
    assert_eq!(harness.queues.status(USER).await.len(), 1);

    process_user_queue(harness.queues.clone(), harness.pipeline.clone(), USER).await;

    assert!(harness.engine.calls().is_empty());
    assert!(harness.queues.status(USER).await.is_empty());
}

/// A failing job does not stop the jobs behind it.
#[tokio::test]
async fn failed_job_does_not_block_queue() {
    let harness = Harness::new(FakeEngine::new(successful_run()).failing_submits(1));
    harness.enqueue("a red fox 2x").await;

    process_user_queue(harness.queues.clone(), harness.pipeline.clone(), USER).await;

    assert_eq!(harness.engine.submitted().len(), 2);
    let captions = harness.transport.captions();
    assert_matches!(
        captions.iter().find(|c| c.starts_with("An error occurred")),
        Some(_)
    );
    let (final_caption, _, _) = harness.transport.media_edits().pop().unwrap();
    assert!(final_caption.starts_with("Final image generated with settings:"));
}

/// The worker exits immediately when there is nothing to do.
#[tokio::test]
async fn worker_on_empty_queue_returns() {
    let harness = Harness::new(FakeEngine::new(successful_run()));

    process_user_queue(harness.queues.clone(), harness.pipeline.clone(), USER).await;

    assert!(harness.engine.calls().is_empty());
}
