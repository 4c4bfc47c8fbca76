use std::{sync::Arc, time::Duration};

use crate::support::{
    helpers::{assert_is_contiguous, build_indexer, init_tracing, test_config, wait_until},
    mock_source::{MockSource, VALIDATORS},
    modules::Recorder,
};
use anyhow::Result;
use protoindex::{MemoryRepository, Module};
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_covers_range_exactly_once() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(40));
    let repo = Arc::new(MemoryRepository::new());
    let recorder = Arc::new(Recorder::new("recorder"));

    let config = test_config(4, 1).end_height(20).parse_new_blocks(false);
    let mut indexer = build_indexer(
        config,
        source.clone(),
        repo.clone(),
        vec![recorder.clone() as Arc<dyn Module>],
    )?;
    indexer.start().await?;

    wait_until("20 stored heights", WAIT, || repo.heights().len() == 20).await?;
    wait_until("20 dispatched blocks", WAIT, || recorder.blocks().len() == 20).await?;
    // nothing beyond the configured end shows up
    sleep(Duration::from_millis(100)).await;
    indexer.stop().await?;

    let heights = repo.heights();
    assert_eq!(heights, (1..=20).collect::<Vec<_>>());
    assert_is_contiguous(&heights);
    assert_eq!(repo.block_inserts(), 20);
    assert_eq!(recorder.blocks(), (1..=20).collect::<Vec<_>>());
    assert_eq!(indexer.last_indexed_height(), Some(20));
    for height in 1..=20 {
        assert_eq!(source.block_calls(height), 1, "height {height} fetched once");
    }

    let signatures = repo.commit_signatures_at(9);
    assert_eq!(signatures.len(), VALIDATORS.len());
    assert_eq!(repo.row_counts().validators, VALIDATORS.len());
    assert_eq!(source.shutdowns(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_height_is_requeued_once_and_converges() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(5));
    source.fail_block(3, 1);
    let repo = Arc::new(MemoryRepository::new());

    let config = test_config(2, 1).end_height(5).parse_new_blocks(false);
    let mut indexer = build_indexer(config, source.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;

    wait_until("heights 1 to 5 stored", WAIT, || repo.heights().len() == 5).await?;
    indexer.stop().await?;

    assert_eq!(repo.heights(), vec![1, 2, 3, 4, 5]);
    let snapshot = indexer.telemetry().snapshot();
    assert_eq!(snapshot.requeued_heights, 1);
    assert_eq!(snapshot.failed_attempts, 1);
    assert_eq!(snapshot.dropped_heights, 0);
    assert_eq!(snapshot.indexed_heights, 5);
    assert_eq!(source.block_calls(3), 2);
    for height in [1, 2, 4, 5] {
        assert_eq!(source.block_calls(height), 1);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_skips_stored_heights() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(15));
    let repo = Arc::new(MemoryRepository::new());

    let first = test_config(3, 1).end_height(10).parse_new_blocks(false);
    let mut indexer = build_indexer(first, source.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;
    wait_until("first ten heights", WAIT, || repo.heights().len() == 10).await?;
    indexer.stop().await?;

    let second = test_config(3, 1).parse_new_blocks(false);
    let mut indexer = build_indexer(second, source.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;
    wait_until("all fifteen heights", WAIT, || repo.heights().len() == 15).await?;
    indexer.stop().await?;

    assert_eq!(repo.heights(), (1..=15).collect::<Vec<_>>());
    assert_eq!(repo.block_inserts(), 15);
    for height in 1..=15 {
        assert_eq!(source.block_calls(height), 1, "height {height} refetched");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_follows_a_moving_head() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(4));
    let repo = Arc::new(MemoryRepository::new());

    let config = test_config(2, 1).parse_new_blocks(false);
    let mut indexer = build_indexer(config, source.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;
    wait_until("initial head indexed", WAIT, || repo.heights().len() == 4).await?;

    source.set_head(9);
    wait_until("advanced head indexed", WAIT, || repo.heights().len() == 9).await?;
    indexer.stop().await?;

    assert_eq!(repo.heights(), (1..=9).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_blocks_are_indexed_without_refetching() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(6).with_txs_per_block(2));
    let repo = Arc::new(MemoryRepository::new());
    let recorder = Arc::new(Recorder::new("recorder"));

    let config = test_config(2, 1).parse_old_blocks(false);
    let mut indexer = build_indexer(
        config,
        source.clone(),
        repo.clone(),
        vec![recorder.clone() as Arc<dyn Module>],
    )?;
    indexer.start().await?;

    wait_until("live subscription", WAIT, || source.subscriptions() == 1).await?;
    source.publish(7).await?;
    source.publish(8).await?;
    wait_until("live heights stored", WAIT, || repo.heights() == vec![7, 8]).await?;
    wait_until("live heights dispatched", WAIT, || recorder.blocks() == vec![7, 8]).await?;
    indexer.stop().await?;

    assert_eq!(source.block_calls(7), 0);
    assert_eq!(source.block_calls(8), 0);
    assert!(repo.tx("TX7-1").is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_cap_drops_a_persistently_failing_height() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(3));
    source.fail_block(2, usize::MAX);
    let repo = Arc::new(MemoryRepository::new());

    let config = test_config(1, 1)
        .end_height(3)
        .parse_new_blocks(false)
        .max_attempts(3);
    let mut indexer = build_indexer(config, source.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;

    let telemetry = indexer.telemetry();
    wait_until("height 2 dropped", WAIT, || {
        telemetry.snapshot().dropped_heights == 1
    })
    .await?;
    wait_until("remaining heights stored", WAIT, || repo.heights().len() == 2).await?;
    indexer.stop().await?;

    assert_eq!(repo.heights(), vec![1, 3]);
    assert_eq!(source.block_calls(2), 3);
    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.failed_attempts, 3);
    assert_eq!(snapshot.requeued_heights, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_source_fails_start() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(3));
    source.set_offline(true);
    let repo = Arc::new(MemoryRepository::new());

    let mut indexer = build_indexer(test_config(1, 1), source, repo.clone(), Vec::new())?;
    let err = indexer.start().await.expect_err("start must fail");
    assert!(format!("{err:#}").contains("source is unreachable"));
    assert!(!indexer.is_running());
    assert!(repo.heights().is_empty());
    Ok(())
}
