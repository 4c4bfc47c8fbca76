use std::{sync::Arc, time::Duration};

use crate::support::{
    helpers::{build_indexer, init_tracing, test_config, wait_until},
    mock_rpc::{tx_hash, MockNode, MockRpcServer},
};
use anyhow::{Context, Result};
use protoindex::{
    CircuitState, CometRpcClient, MemoryRepository, RpcClientOptions, RpcError, Source,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> RpcClientOptions {
    RpcClientOptions {
        request_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        poll_interval: Duration::from_millis(50),
        ..RpcClientOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_status_blocks_and_paginated_validators() -> Result<()> {
    init_tracing();
    let node = MockNode::new(12, 0, 150);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = CometRpcClient::with_options(server.url(), fast_options())?;

    let status = client.status().await?;
    assert_eq!(status.network, "mock-1");
    assert_eq!(status.latest_height, 12);
    assert!(!status.catching_up);

    let block = client.fetch_block(7).await?;
    assert_eq!(block.height, 7);
    assert_eq!(block.hash, "BLOCK7");
    assert_eq!(block.proposer_address, "VAL000");
    assert_eq!(block.last_commit.height, 6);
    assert_eq!(block.last_commit.signatures.len(), 2);

    let validators = client.fetch_validators(7).await?;
    assert_eq!(validators.height, 7);
    assert_eq!(validators.validators.len(), 150);
    assert_eq!(validators.validators[0].consensus_address, "VAL000");
    assert_eq!(validators.validators[0].voting_power, 1000);
    assert_eq!(validators.validators[0].consensus_pubkey, "pk0");
    assert_eq!(node.calls("validators"), 2, "two pages of 100");

    // only the signing validator is joined; the absent vote is dropped
    let signatures = block.commit_signatures(&validators)?;
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].height, 6);
    assert_eq!(signatures[0].voting_power, 1000);

    let genesis = client.fetch_genesis().await?;
    assert_eq!(genesis.chain_id, "mock-1");
    assert_eq!(genesis.initial_height, 1);
    assert!(genesis.app_state.get("auth").is_some());

    let metrics = client.metrics();
    assert_eq!(metrics.total_errors, 0);
    assert_eq!(metrics.breaker_state, CircuitState::Closed);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transactions_follow_block_order() -> Result<()> {
    init_tracing();
    let node = MockNode::new(5, 3, 1);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = CometRpcClient::with_options(server.url(), fast_options())?;

    let block = client.fetch_block(4).await?;
    assert_eq!(block.txs.len(), 3);
    let txs = client.fetch_txs(&block).await?;

    let hashes: Vec<&str> = txs.iter().map(|tx| tx.hash.as_str()).collect();
    assert_eq!(hashes, vec!["HASH-4-0", "HASH-4-1", "HASH-4-2"]);
    assert_eq!(
        txs.iter().map(|tx| tx.success).collect::<Vec<_>>(),
        vec![true, false, true]
    );
    assert_eq!(txs[1].memo, "memo-4-1");
    assert_eq!(txs[1].raw_log, "log-1");
    assert_eq!(txs[1].gas_wanted, 200_000);
    assert_eq!(txs[1].gas_used, 1000);
    assert_eq!(txs[0].messages.len(), 1);
    assert_eq!(txs[0].messages[0].type_url(), "/cosmos.bank.v1beta1.MsgSend");
    assert!(txs.iter().all(|tx| tx.height == 4));

    let mut empty = client.fetch_block(5).await?;
    empty.txs.clear();
    let calls_before = node.calls("tx_search");
    assert!(client.fetch_txs(&empty).await?.is_empty());
    assert_eq!(node.calls("tx_search"), calls_before, "empty blocks skip tx_search");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn height_above_head_is_not_retried() -> Result<()> {
    init_tracing();
    let node = MockNode::new(5, 0, 1);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = CometRpcClient::with_options(server.url(), fast_options())?;

    let err = client.fetch_block(9).await.expect_err("height 9 is ahead of the node");
    match err.downcast_ref::<RpcError>() {
        Some(RpcError::HeightUnavailable { height }) => assert_eq!(*height, 9),
        other => panic!("expected HeightUnavailable, got {other:?}"),
    }
    assert_eq!(node.calls("block"), 1);

    let metrics = client.metrics();
    assert_eq!(metrics.heights_unavailable, 1);
    assert_eq!(metrics.total_errors, 0);
    assert_eq!(metrics.breaker_state, CircuitState::Closed);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_errors_are_retried() -> Result<()> {
    init_tracing();
    let node = MockNode::new(5, 0, 1);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = CometRpcClient::with_options(server.url(), fast_options())?;

    node.fail_next(2);
    let status = client.status().await?;
    assert_eq!(status.latest_height, 5);

    let metrics = client.metrics();
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.total_errors, 2);
    assert_eq!(metrics.breaker_state, CircuitState::Closed);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn basic_auth_is_sent_on_every_request() -> Result<()> {
    init_tracing();
    let node = MockNode::with_basic_auth(3, "indexer", "secret");
    let server = MockRpcServer::start(node.clone()).await?;

    let anonymous = CometRpcClient::with_options(
        server.url(),
        RpcClientOptions {
            max_attempts: 1,
            ..fast_options()
        },
    )?;
    assert!(anonymous.status().await.is_err());

    let client = CometRpcClient::with_options(
        server.url(),
        fast_options().with_basic_auth("indexer", "secret"),
    )?;
    assert_eq!(client.status().await?.latest_height, 3);
    assert_eq!(client.latest_height().await?, 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_subscription_streams_new_blocks_until_shutdown() -> Result<()> {
    init_tracing();
    let node = MockNode::new(5, 0, 1);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = CometRpcClient::with_options(server.url(), fast_options())?;

    let mut stream = client.subscribe_new_blocks().await?;
    node.set_head(7);

    let first = timeout(WAIT, stream.recv())
        .await
        .context("block 6 not delivered")?
        .context("stream closed early")?;
    let second = timeout(WAIT, stream.recv())
        .await
        .context("block 7 not delivered")?
        .context("stream closed early")?;
    assert_eq!((first.height, second.height), (6, 7));

    Source::shutdown(&client).await?;
    let closed = timeout(WAIT, stream.recv())
        .await
        .context("stream did not close after shutdown")?;
    assert!(closed.is_none());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indexer_runs_against_rpc_node() -> Result<()> {
    init_tracing();
    let node = MockNode::new(6, 2, 3);
    let server = MockRpcServer::start(node.clone()).await?;
    let client = Arc::new(CometRpcClient::with_options(server.url(), fast_options())?);
    let repo = Arc::new(MemoryRepository::new());

    let config = test_config(3, 1)
        .end_height(6)
        .parse_new_blocks(false)
        .module("messages");
    let mut indexer = build_indexer(config, client.clone(), repo.clone(), Vec::new())?;
    indexer.start().await?;
    wait_until("six heights over rpc", WAIT, || repo.heights().len() == 6).await?;
    indexer.stop().await?;

    assert_eq!(repo.heights(), (1..=6).collect::<Vec<_>>());
    let counts = repo.row_counts();
    assert_eq!(counts.txs, 12);
    assert_eq!(counts.messages, 12);
    assert_eq!(counts.validators, 3);

    let failed = repo.tx(&tx_hash(4, 1)).context("tx 4-1 stored")?;
    assert!(!failed.success);
    assert_eq!(failed.memo, "memo-4-1");
    assert_eq!(repo.messages_at(4).len(), 2);
    assert_eq!(
        repo.messages_at(4)[0].involved_accounts,
        vec!["cosmos1sender4".to_owned(), "cosmos1receiver".to_owned()]
    );

    let signatures = repo.commit_signatures_at(3);
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].validator_address, "VAL000");

    let telemetry = indexer.telemetry().snapshot();
    assert_eq!(telemetry.rpc_errors, 0);
    assert_eq!(telemetry.indexed_heights, 6);

    server.shutdown().await;
    Ok(())
}
