// Pipeline runtime - typed stages composed into concurrent transfer
// pipelines with bounded queues, plus the worker-pool executor

pub mod bytes_fifo;
pub mod executor;
pub mod pipelines;
pub mod rate_limiter;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod tar;

pub use executor::PipelineExecutor;
pub use pipelines::TransferConfig;
pub use runner::Pipeline;
