use crate::artifact::{Artifact, file_name_lossy};
use crate::cache::{CacheError, ResultCache};
use crate::cancel::CancelToken;
use crate::compiler::{CompileError, Compiler};
use crate::config::RunConfig;
use crate::executor::{ExecError, ResourceLimitedExecutor};
use crate::oracle::{Classification, Oracle, OracleError};
use crate::reducer::{Dispatcher, ReduceError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("not a C, C++ or LLVM IR program: {0:?}")]
    NotAProgram(PathBuf),
    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("interrupted")]
    Interrupted,
}

impl PipelineError {
    fn is_interrupt(&self) -> bool {
        matches!(
            self,
            PipelineError::Interrupted
                | PipelineError::Compile(CompileError::Exec(ExecError::Interrupted(_)))
                | PipelineError::Oracle(OracleError::Exec(ExecError::Interrupted(_)))
                | PipelineError::Oracle(OracleError::Assemble(CompileError::Exec(
                    ExecError::Interrupted(_)
                )))
                | PipelineError::Reduce(ReduceError::Exec(ExecError::Interrupted(_)))
                | PipelineError::Reduce(ReduceError::Compile(CompileError::Exec(
                    ExecError::Interrupted(_)
                )))
        )
    }

    /// Collapses every flavour of interrupt into [`PipelineError::Interrupted`].
    fn normalize(self) -> Self {
        if self.is_interrupt() {
            PipelineError::Interrupted
        } else {
            self
        }
    }
}

/// Tally of classifications over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub interesting: usize,
    pub uninteresting: usize,
    pub uncompilable: usize,
    pub cache_hits: usize,
    pub reduce_failures: usize,
}

impl RunSummary {
    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Interesting => self.interesting += 1,
            Classification::Uninteresting => self.uninteresting += 1,
            Classification::Uncompilable => self.uncompilable += 1,
        }
    }

    pub fn merge(self, other: RunSummary) -> RunSummary {
        RunSummary {
            interesting: self.interesting + other.interesting,
            uninteresting: self.uninteresting + other.uninteresting,
            uncompilable: self.uncompilable + other.uncompilable,
            cache_hits: self.cache_hits + other.cache_hits,
            reduce_failures: self.reduce_failures + other.reduce_failures,
        }
    }

    pub fn total(&self) -> usize {
        self.interesting + self.uninteresting + self.uncompilable
    }

    pub fn found_interesting(&self) -> bool {
        self.interesting > 0
    }
}

/// Logs a classification in the run's progress format.
pub fn show_result(name: &str, classification: Classification, checked: usize) {
    match classification {
        Classification::Interesting => info!("{name}: interesting! ---------"),
        Classification::Uninteresting => {
            info!("{name}: uninteresting. (checked {checked} assertions)")
        }
        Classification::Uncompilable => info!("{name}: uncompilable."),
    }
}

/// Lazily walks `roots` and yields every recognized program beneath them.
pub fn discover(roots: &[PathBuf]) -> impl Iterator<Item = Artifact> + Send + use<> {
    roots
        .to_vec()
        .into_iter()
        .flat_map(|root| WalkDir::new(root).follow_links(false))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| Artifact::from_path(entry.into_path()))
}

/// Runs the per-artifact pipeline: cache, compile, classify, reduce.
pub struct Worker<'a> {
    config: &'a RunConfig,
    executor: &'a ResourceLimitedExecutor,
    cache: ResultCache,
}

impl<'a> Worker<'a> {
    pub fn new(
        config: &'a RunConfig,
        executor: &'a ResourceLimitedExecutor,
        cache: ResultCache,
    ) -> Self {
        Self {
            config,
            executor,
            cache,
        }
    }

    /// Classifies every variant of `artifact`, reusing cached verdicts.
    pub fn check_variants(&self, artifact: &Artifact) -> Result<RunSummary, PipelineError> {
        let compiler = Compiler::new(self.config, self.executor, self.cache.ir_dir());
        let mut summary = RunSummary::default();

        for flags in compiler.flag_sets(artifact) {
            if self.executor.cancel_token().is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            let plan = compiler.plan(artifact, &flags)?;
            let name = file_name_lossy(&plan.ir_path);

            if let Some(cached) = self.cache.lookup(&plan.key) {
                debug!("Cache hit for {}", plan.key);
                summary.cache_hits += 1;
                self.report(&name, cached, &mut summary);
                continue;
            }

            let variant = compiler.build(artifact, plan)?;
            if !variant.success {
                self.cache.store(&variant.key, Classification::Uncompilable)?;
                self.report(&name, Classification::Uncompilable, &mut summary);
                continue;
            }

            let verdict = Oracle::new(self.config, self.executor).classify(&variant.ir_path)?;
            self.report(&name, verdict, &mut summary);
            match verdict {
                Classification::Interesting => {
                    match Dispatcher::new(self.config, self.executor).dispatch(artifact, &variant)
                    {
                        Ok(reduced) => info!("Reduced {name} to {}", reduced.display()),
                        Err(e @ ReduceError::MinimizerFailed { .. }) => {
                            error!("{e}");
                            summary.reduce_failures += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Classification::Uninteresting | Classification::Uncompilable => {
                    self.cache.store(&variant.key, verdict)?;
                    // Only compiled variants live in the cache; IR inputs are the user's files.
                    if artifact.is_source() && !self.config.debug {
                        crate::cache::remove_if_exists(&variant.ir_path)?;
                    }
                }
            }
        }
        Ok(summary)
    }

    fn report(&self, name: &str, classification: Classification, summary: &mut RunSummary) {
        show_result(name, classification, self.config.assertions.len());
        summary.record(classification);
    }
}

/// Fans `artifacts` out over a pool of `config.processes` workers.
///
/// A fatal error in any worker stops the run; a failed minimizer does not.
pub fn run_all<I>(
    config: &RunConfig,
    artifacts: I,
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError>
where
    I: Iterator<Item = Artifact> + Send,
{
    let cache = ResultCache::open(&config.cache_root)?;
    let executor = ResourceLimitedExecutor::new(config.memory_limit, cancel.clone());
    let worker = Worker::new(config, &executor, cache);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.processes)
        .thread_name(|i| format!("pareduce-worker-{i}"))
        .build()?;

    info!(
        "Scanning {} search root(s) with {} worker(s), {} solver thread(s) each",
        config.search_roots.len(),
        config.processes,
        config.jobs()
    );

    let stop = cancel.clone();
    let result = pool.install(|| {
        artifacts
            .take_while(move |_| !stop.is_cancelled())
            .par_bridge()
            .map(|artifact| worker.check_variants(&artifact).map_err(PipelineError::normalize))
            .try_reduce(RunSummary::default, |a, b| Ok(a.merge(b)))
    });

    if cancel.is_cancelled() {
        return Err(PipelineError::Interrupted);
    }
    let summary = result?;
    info!(
        "Checked {} variant(s): {} interesting, {} uninteresting, {} uncompilable ({} cached)",
        summary.total(),
        summary.interesting,
        summary.uninteresting,
        summary.uncompilable,
        summary.cache_hits
    );
    Ok(summary)
}

/// Runs the full pipeline, reduction included, on a single program.
pub fn check_program(
    config: &RunConfig,
    path: &Path,
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError> {
    let artifact =
        Artifact::from_path(path).ok_or_else(|| PipelineError::NotAProgram(path.to_path_buf()))?;
    let cache = ResultCache::open(&config.cache_root)?;
    let executor = ResourceLimitedExecutor::new(config.memory_limit, cancel.clone());
    Worker::new(config, &executor, cache)
        .check_variants(&artifact)
        .map_err(PipelineError::normalize)
}

/// Classifies a single program without touching the cache or reducing it.
///
/// This is the one entry point shared by library callers and the
/// `--no-reduce` mode the minimizers invoke. Sources are compiled into a
/// throwaway directory, and the program is interesting as soon as any
/// variant is.
pub fn classify(
    path: &Path,
    config: &RunConfig,
    cancel: &CancelToken,
) -> Result<Classification, PipelineError> {
    let artifact =
        Artifact::from_path(path).ok_or_else(|| PipelineError::NotAProgram(path.to_path_buf()))?;
    let executor = ResourceLimitedExecutor::new(config.memory_limit, cancel.clone());
    let scratch = tempfile::Builder::new()
        .prefix("pareduce-test")
        .tempdir()
        .map_err(PipelineError::Scratch)?;
    let variants = Compiler::new(config, &executor, scratch.path())
        .compile_variants(&artifact)
        .map_err(|e| PipelineError::from(e).normalize())?;
    let oracle = Oracle::new(config, &executor);

    let mut compiled_any = false;
    for variant in variants {
        if !variant.success {
            show_result(&variant.name(), Classification::Uncompilable, 0);
            continue;
        }
        compiled_any = true;
        let verdict = oracle
            .classify(&variant.ir_path)
            .map_err(|e| PipelineError::from(e).normalize())?;
        show_result(&variant.name(), verdict, config.assertions.len());
        if verdict == Classification::Interesting {
            return Ok(verdict);
        }
    }
    Ok(if compiled_any {
        Classification::Uninteresting
    } else {
        Classification::Uncompilable
    })
}
