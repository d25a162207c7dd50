pub mod artifact;
pub mod cache;
pub mod cancel;
pub mod compiler;
pub mod config;
pub mod distributor;
pub mod executor;
pub mod oracle;
pub mod reducer;
pub mod setup;

pub use artifact::{Artifact, ArtifactKind};
pub use cache::{CacheError, ResultCache};
pub use cancel::CancelToken;
pub use compiler::{CompileError, CompileVariant, Compiler};
pub use config::{ConfigError, Overrides, RunConfig, Settings};
pub use distributor::{
    PipelineError, RunSummary, Worker, check_program, classify, discover, run_all,
};
pub use executor::{ExecError, ResourceLimitedExecutor, ToolCommand, ToolOutcome};
pub use oracle::{Classification, Oracle, OracleError};
pub use reducer::{Dispatcher, ReduceError};
pub use setup::{SetupError, fetch_missing_roots};
