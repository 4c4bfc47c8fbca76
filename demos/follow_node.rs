use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use protoindex::{
    Block, BlockModule, CometRpcClient, IndexerConfig, MemoryRepository, Module, ModuleFuture,
    ModuleRegistry, PruningConfig, RpcClientOptions, Runner, Transaction, ValidatorSet,
};

const DEFAULT_RPC_URL: &str = "http://localhost:26657";
const DEFAULT_START_HEIGHT: u64 = 1;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MODULES: &str = "messages";
const DEFAULT_LOG_DIRECTIVE: &str = "info";
const DEFAULT_PRUNING_INTERVAL: u64 = 100;
const DEFAULT_PRUNING_KEEP_RECENT: u64 = 1_000;

/// Follows a CometBFT node into an in-memory store and prints a summary on Ctrl-C.
#[tokio::main]
async fn main() -> Result<()> {
    init_demo_tracing();

    let args = DemoArgs::from_env()?;
    let mut options = RpcClientOptions::default();
    if let Some((user, password)) = args.basic_auth.clone() {
        options = options.with_basic_auth(user, password);
    }
    let client = Arc::new(CometRpcClient::with_options(&args.rpc_url, options)?);
    let status = client
        .status()
        .await
        .with_context(|| format!("node at {} is unreachable", args.rpc_url))?;
    println!(
        "Following {} ({}) from height {} with {} workers; node head is {}",
        status.network, args.rpc_url, args.start_height, args.workers, status.latest_height
    );

    let counter = Arc::new(BlockCounter::default());
    let mut registry = ModuleRegistry::with_defaults();
    registry.register_instance(counter.clone())?;

    let mut builder = IndexerConfig::builder()
        .workers(args.workers)
        .start_height(args.start_height)
        .fast_sync(args.fast_sync)
        .parse_genesis(args.parse_genesis)
        .modules(args.modules.iter().cloned())
        .module(BlockCounter::NAME);
    if args.modules.iter().any(|name| name == "pruning") {
        builder = builder.pruning(PruningConfig::new(
            DEFAULT_PRUNING_INTERVAL,
            DEFAULT_PRUNING_KEEP_RECENT,
        )?);
    }

    let repository = Arc::new(MemoryRepository::new());
    let mut runner = Runner::new(builder.build()?, client.clone(), repository.clone(), &registry)?;
    let started = Instant::now();
    let outcome = runner.run_until_ctrl_c().await;

    let telemetry = runner.indexer().telemetry().snapshot();
    let rows = repository.row_counts();
    let seconds = started.elapsed().as_secs_f64();
    let indexed = counter.blocks.load(Ordering::Relaxed);
    println!(
        "Indexed {indexed} blocks in {seconds:.2}s ({:.2} blk/s): {} txs, {} messages, {} requeued, {} module errors",
        if seconds > 0.0 { indexed as f64 / seconds } else { 0.0 },
        rows.txs,
        rows.messages,
        telemetry.requeued_heights,
        telemetry.module_errors,
    );
    let rpc = client.metrics();
    println!(
        "RPC: {} requests, {:.2}% errors, {:.1}ms average latency, breaker {:?}",
        rpc.total_requests,
        rpc.error_rate * 100.0,
        rpc.average_latency_ms,
        rpc.breaker_state
    );

    outcome
}

fn init_demo_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    protoindex::init_tracing();
}

#[derive(Default)]
struct BlockCounter {
    blocks: AtomicU64,
}

impl BlockCounter {
    const NAME: &'static str = "block_counter";
}

impl Module for BlockCounter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_block(&self) -> Option<&dyn BlockModule> {
        Some(self)
    }
}

impl BlockModule for BlockCounter {
    fn handle_block<'a>(
        &'a self,
        block: &'a Block,
        txs: &'a [Transaction],
        _validators: &'a ValidatorSet,
    ) -> ModuleFuture<'a> {
        Box::pin(async move {
            let total = self.blocks.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(height = block.height, txs = txs.len(), total, "block indexed");
            Ok(())
        })
    }
}

struct DemoArgs {
    rpc_url: String,
    basic_auth: Option<(String, String)>,
    start_height: u64,
    workers: usize,
    fast_sync: bool,
    parse_genesis: bool,
    modules: Vec<String>,
}

impl DemoArgs {
    fn from_env() -> Result<Self> {
        let rpc_url = read_env_or_default("PROTOINDEX_RPC_URL", DEFAULT_RPC_URL);
        let basic_auth = match (
            env::var("PROTOINDEX_RPC_USER"),
            env::var("PROTOINDEX_RPC_PASSWORD"),
        ) {
            (Ok(user), Ok(password)) if !user.trim().is_empty() => Some((user, password)),
            _ => None,
        };
        let start_height = parse_env_with_default("PROTOINDEX_START_HEIGHT", DEFAULT_START_HEIGHT)?;
        let workers = parse_env_with_default("PROTOINDEX_WORKERS", DEFAULT_WORKERS)?;
        let fast_sync = parse_env_with_default("PROTOINDEX_FAST_SYNC", false)?;
        let parse_genesis = parse_env_with_default("PROTOINDEX_PARSE_GENESIS", false)?;
        let modules = read_env_or_default("PROTOINDEX_MODULES", DEFAULT_MODULES)
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();

        ensure!(start_height > 0, "PROTOINDEX_START_HEIGHT must be at least 1");
        ensure!(workers > 0, "PROTOINDEX_WORKERS must be greater than 0");

        Ok(Self {
            rpc_url,
            basic_auth,
            start_height,
            workers,
            fast_sync,
            parse_genesis,
            modules,
        })
    }
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
