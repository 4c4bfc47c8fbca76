use std::{sync::Arc, time::Duration};

use crate::support::{
    helpers::{build_indexer, init_tracing, test_config, wait_until},
    mock_source::MockSource,
    modules::Recorder,
};
use anyhow::Result;
use protoindex::{MemoryRepository, Module, ReplayReport, ReplayRequest};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_replay_reprocesses_stored_heights() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(10));
    let repo = Arc::new(MemoryRepository::new());
    let recorder = Arc::new(Recorder::new("recorder"));

    let config = test_config(2, 1).end_height(10).parse_new_blocks(false);
    let mut indexer = build_indexer(
        config,
        source.clone(),
        repo.clone(),
        vec![recorder.clone() as Arc<dyn Module>],
    )?;
    indexer.start().await?;
    wait_until("ten heights", WAIT, || recorder.blocks().len() == 10).await?;
    indexer.stop().await?;

    let report = indexer.replay(ReplayRequest::force(4, 6)).await?;
    assert_eq!(
        report,
        ReplayReport {
            start: 4,
            end: 6,
            indexed: 3
        }
    );

    // stored rows are left alone, modules see the heights again
    assert_eq!(repo.block_inserts(), 10);
    assert_eq!(
        recorder.blocks(),
        vec![1, 2, 3, 4, 4, 5, 5, 6, 6, 7, 8, 9, 10]
    );
    for height in 4..=6 {
        assert_eq!(source.block_calls(height), 2);
    }
    assert_eq!(source.block_calls(7), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_replay_fills_gaps_only() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(8));
    let repo = Arc::new(MemoryRepository::new());

    let mut first = build_indexer(
        test_config(2, 1).end_height(3).parse_new_blocks(false),
        source.clone(),
        repo.clone(),
        Vec::new(),
    )?;
    first.start().await?;
    wait_until("first heights", WAIT, || repo.heights().len() == 3).await?;
    first.stop().await?;

    let mut second = build_indexer(
        test_config(2, 6).end_height(8).parse_new_blocks(false),
        source.clone(),
        repo.clone(),
        Vec::new(),
    )?;
    second.start().await?;
    wait_until("later heights", WAIT, || repo.heights().len() == 6).await?;
    second.stop().await?;
    assert_eq!(repo.heights(), vec![1, 2, 3, 6, 7, 8]);

    let mut replayer = build_indexer(test_config(2, 1), source.clone(), repo.clone(), Vec::new())?;
    let report = replayer.replay(ReplayRequest::missing(1, None)).await?;
    replayer.close().await?;

    assert_eq!(report.end, 8);
    assert_eq!(report.indexed, 2);
    assert_eq!(repo.heights(), (1..=8).collect::<Vec<_>>());
    for height in 1..=8 {
        assert_eq!(source.block_calls(height), 1, "height {height} fetched once");
    }
    Ok(())
}

#[tokio::test]
async fn replay_rejects_inverted_and_zero_ranges() -> Result<()> {
    let mut indexer = build_indexer(
        test_config(1, 1),
        Arc::new(MockSource::new(10)),
        Arc::new(MemoryRepository::new()),
        Vec::new(),
    )?;

    let err = indexer
        .replay(ReplayRequest::force(7, 3))
        .await
        .expect_err("inverted range");
    assert!(err.to_string().contains("below start height"));

    let err = indexer
        .replay(ReplayRequest::missing(0, Some(3)))
        .await
        .expect_err("zero start");
    assert!(err.to_string().contains("at least 1"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_is_refused_while_running() -> Result<()> {
    init_tracing();
    let source = Arc::new(MockSource::new(3));
    let mut indexer = build_indexer(
        test_config(1, 1),
        source,
        Arc::new(MemoryRepository::new()),
        Vec::new(),
    )?;
    indexer.start().await?;

    let err = indexer
        .replay(ReplayRequest::force(1, 2))
        .await
        .expect_err("replay while running");
    assert!(err.to_string().contains("while the indexer is running"));

    indexer.stop().await?;
    Ok(())
}
