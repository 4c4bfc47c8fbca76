pub mod enqueuer;
pub mod fastsync;
pub mod indexer;
pub mod modules;
pub mod queue;
pub mod repository;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod worker;

pub use enqueuer::{BackfillEnqueuer, BackfillStrategy, BackfillTarget, Enqueuer, LiveEnqueuer};
pub use fastsync::{fast_sync, FastSyncReport};
pub use indexer::{Indexer, ReplayReport, ReplayRequest};
pub use modules::{
    AdditionalOperationsModule, AsyncOperationsModule, AuthzMessageModule, BlockModule,
    FastSyncModule, GenesisModule, MessageModule, Module, ModuleContext, ModuleError,
    ModuleFactory, ModuleFuture, ModuleRegistry, ModuleStage, Modules, PeriodicOperationsModule,
    TransactionModule,
};
pub use queue::{HeightQueue, QueueClosed, WorkItem};
pub use repository::memory::MemoryRepository;
pub use repository::{PruningRepository, Repository};
pub use rpc::circuit_breaker::{CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker};
pub use rpc::{CometRpcClient, RpcClientOptions, RpcError};
pub use runtime::config::{
    IndexerConfig, IndexerConfigBuilder, IndexerConfigParams, PruningConfig,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::Scheduler;
pub use source::{NewBlockStream, Source};
pub use types::{
    Block, Commit, CommitSig, CommitSignature, GenesisDoc, Message, MessageRecord, Transaction,
    UnknownSigner, Validator, ValidatorSet, MSG_EXEC_TYPE_URL,
};
pub use worker::{Worker, WorkerPool};
