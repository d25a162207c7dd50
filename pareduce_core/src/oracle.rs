use crate::artifact::file_name_lossy;
use crate::compiler::{self, CompileError};
use crate::config::{EngineMode, RunConfig};
use crate::executor::{ExecError, ProcessOutput, ResourceLimitedExecutor, ToolCommand, ToolOutcome};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

/// How much tool output is kept in a crash sentinel.
const SENTINEL_OUTPUT_TAIL: usize = 16 * 1024;

/// The verdict for one IR variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Interesting,
    Uninteresting,
    Uncompilable,
}

impl Classification {
    /// Exit status under the minimizers' interestingness-test contract:
    /// zero keeps reducing.
    pub fn exit_code(self) -> i32 {
        match self {
            Classification::Interesting => 0,
            Classification::Uninteresting | Classification::Uncompilable => 1,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Interesting => "interesting",
            Classification::Uninteresting => "uninteresting",
            Classification::Uncompilable => "uncompilable",
        })
    }
}

/// Setup-level defects. Tool crashes and timeouts are never reported through
/// this type; they are folded into a [`Classification`].
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("could not prepare bitcode: {0}")]
    Assemble(#[from] CompileError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("missing assertion relation {relation} in {results_dir:?}")]
    MissingAssertion {
        relation: String,
        results_dir: PathBuf,
    },
    #[error("failed to decompress {path:?}: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create scratch workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("failed to write crash sentinel {path:?}: {source}")]
    Sentinel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The oracle's progress through one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleState {
    Start,
    Assembled,
    FactsGenerated,
    Analyzed,
    Classified(Classification),
}

/// The external stage a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FactGeneration,
    Analysis,
}

impl Stage {
    fn sentinel_extension(self) -> &'static str {
        match self {
            Stage::FactGeneration => "factgen-crash",
            Stage::Analysis => "analysis-crash",
        }
    }
}

/// Outcome of one external stage, with the tool's output kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Succeeded,
    Crashed(ProcessOutput),
    TimedOut,
}

impl From<ToolOutcome> for StageResult {
    fn from(outcome: ToolOutcome) -> Self {
        match outcome {
            ToolOutcome::Completed(_) => StageResult::Succeeded,
            ToolOutcome::Failed(output) => StageResult::Crashed(output),
            ToolOutcome::TimedOut => StageResult::TimedOut,
        }
    }
}

/// What the assertion relations of a finished analysis contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionScan {
    AllEmpty,
    Violated { relation: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    Halt(Classification),
}

/// A fact generator that fails on well-formed IR is not what the minimizer
/// is hunting, so both crash and timeout end as uninteresting.
pub fn after_fact_generation(result: &StageResult) -> Transition {
    match result {
        StageResult::Succeeded => Transition::Continue,
        StageResult::Crashed(_) | StageResult::TimedOut => {
            Transition::Halt(Classification::Uninteresting)
        }
    }
}

/// An analysis-engine crash is exactly the kind of bug being searched for;
/// a timeout is not.
pub fn after_analysis(result: &StageResult) -> Transition {
    match result {
        StageResult::Succeeded => Transition::Continue,
        StageResult::Crashed(_) => Transition::Halt(Classification::Interesting),
        StageResult::TimedOut => Transition::Halt(Classification::Uninteresting),
    }
}

pub fn from_assertions(scan: &AssertionScan) -> Classification {
    match scan {
        AssertionScan::AllEmpty => Classification::Uninteresting,
        AssertionScan::Violated { .. } => Classification::Interesting,
    }
}

/// Scratch space owned by a single oracle call: the assembled bitcode plus
/// the facts and results directories.
///
/// Removed on drop unless `retain` is set (debug mode), in which case it is
/// left in place for inspection.
pub struct ScratchWorkspace {
    dir: Option<TempDir>,
    root: PathBuf,
    facts: PathBuf,
    results: PathBuf,
    retain: bool,
}

impl ScratchWorkspace {
    pub fn create(name: &str, retain: bool) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(name)
            .suffix(".scratch")
            .tempdir()?;
        let root = dir.path().to_path_buf();
        let facts = root.join("facts");
        let results = root.join("results");
        std::fs::create_dir(&facts)?;
        std::fs::create_dir(&results)?;
        Ok(Self {
            dir: Some(dir),
            root,
            facts,
            results,
            retain,
        })
    }

    /// Where textual IR is assembled, so the input's neighbours are never touched.
    pub fn bitcode_dir(&self) -> &Path {
        &self.root
    }

    pub fn facts_dir(&self) -> &Path {
        &self.facts
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        if !self.retain {
            return;
        }
        if let Some(dir) = self.dir.take() {
            let kept = dir.keep();
            debug!("Keeping scratch directory {}", kept.display());
        }
    }
}

#[derive(Serialize)]
struct CrashSentinel<'a> {
    stage: &'a str,
    tool: String,
    artifact: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    output_tail: String,
}

/// Records that `tool` crashed on `artifact`, beside the artifact itself.
pub fn write_crash_sentinel(
    artifact: &Path,
    stage: Stage,
    tool: &Path,
    output: &ProcessOutput,
) -> Result<PathBuf, OracleError> {
    let path = artifact.with_extension(stage.sentinel_extension());
    let sentinel = CrashSentinel {
        stage: stage.sentinel_extension(),
        tool: tool.display().to_string(),
        artifact: artifact.display().to_string(),
        exit_code: output.exit_code,
        signal: output.signal,
        output_tail: output.output_tail(SENTINEL_OUTPUT_TAIL),
    };
    let body = serde_json::to_vec_pretty(&sentinel)
        .map_err(|e| OracleError::Sentinel {
            path: path.clone(),
            source: e.into(),
        })?;
    std::fs::write(&path, body).map_err(|source| OracleError::Sentinel {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Checks every allow-listed relation in `results_dir`.
///
/// All relation files must be present before any is read: a missing one
/// means the analysis invocation itself is broken, which is fatal rather
/// than a verdict. Only the first decompressed byte of each relation is
/// read, and the first non-empty relation short-circuits the scan.
pub fn scan_assertions(
    assertions: &[String],
    results_dir: &Path,
) -> Result<AssertionScan, OracleError> {
    if let Some(missing) = assertions
        .iter()
        .find(|relation| !results_dir.join(relation).is_file())
    {
        return Err(OracleError::MissingAssertion {
            relation: missing.clone(),
            results_dir: results_dir.to_path_buf(),
        });
    }

    for relation in assertions {
        let path = results_dir.join(relation);
        let mut first = [0u8; 1];
        let read = File::open(&path)
            .and_then(|f| GzDecoder::new(f).read(&mut first))
            .map_err(|source| OracleError::Decompress {
                path: path.clone(),
                source,
            })?;
        if read > 0 {
            debug!("Interesting! Assertion failed: {}", path.display());
            return Ok(AssertionScan::Violated {
                relation: relation.clone(),
            });
        }
    }
    Ok(AssertionScan::AllEmpty)
}

/// The interestingness oracle: assemble, generate facts, analyze, inspect.
///
/// Deterministic for identical tools, configuration and input, up to
/// timeout jitter under heavy load.
pub struct Oracle<'a> {
    config: &'a RunConfig,
    executor: &'a ResourceLimitedExecutor,
}

impl<'a> Oracle<'a> {
    pub fn new(config: &'a RunConfig, executor: &'a ResourceLimitedExecutor) -> Self {
        Self { config, executor }
    }

    /// Classifies the IR at `ir_path`. Crash sentinels are written beside
    /// `ir_path`; everything else stays in a scratch workspace.
    pub fn classify(&self, ir_path: &Path) -> Result<Classification, OracleError> {
        let mut state = OracleState::Start;
        debug!("{}: {state:?}", ir_path.display());

        let workspace = ScratchWorkspace::create(&file_name_lossy(ir_path), self.config.debug)
            .map_err(OracleError::Workspace)?;
        let bitcode =
            compiler::assemble(self.config, self.executor, ir_path, workspace.bitcode_dir())?;
        state = OracleState::Assembled;
        debug!("{}: {state:?}", bitcode.display());

        let factgen = self.run_fact_generator(&bitcode, &workspace)?;
        if let Transition::Halt(verdict) = after_fact_generation(&factgen) {
            match &factgen {
                StageResult::Crashed(output) => {
                    warn!("{}", output.output_tail(SENTINEL_OUTPUT_TAIL));
                    warn!("Fact generator crash!");
                    write_crash_sentinel(
                        ir_path,
                        Stage::FactGeneration,
                        &self.config.tools.factgen,
                        output,
                    )?;
                }
                _ => warn!("Fact generator timeout!"),
            }
            return Ok(self.finish(ir_path, verdict));
        }
        state = OracleState::FactsGenerated;
        debug!("{}: {state:?}", ir_path.display());

        let analysis = self.run_analysis(&workspace)?;
        if let Transition::Halt(verdict) = after_analysis(&analysis) {
            match &analysis {
                StageResult::Crashed(output) => {
                    warn!("{}", output.output_tail(SENTINEL_OUTPUT_TAIL));
                    warn!("Analysis crash!!");
                    write_crash_sentinel(ir_path, Stage::Analysis, &self.analysis_tool(), output)?;
                }
                _ => warn!("Analysis timeout!"),
            }
            return Ok(self.finish(ir_path, verdict));
        }
        state = OracleState::Analyzed;
        debug!("{}: {state:?}", ir_path.display());

        let scan = scan_assertions(&self.config.assertions, workspace.results_dir())?;
        let verdict = from_assertions(&scan);
        if verdict == Classification::Uninteresting {
            debug!("Not interesting.");
        }
        Ok(self.finish(ir_path, verdict))
    }

    fn finish(&self, ir_path: &Path, verdict: Classification) -> Classification {
        debug!(
            "{}: {:?}",
            ir_path.display(),
            OracleState::Classified(verdict)
        );
        verdict
    }

    fn run_fact_generator(
        &self,
        bitcode: &Path,
        workspace: &ScratchWorkspace,
    ) -> Result<StageResult, OracleError> {
        let tool = ToolCommand::new(&self.config.tools.factgen)
            .arg("--out-dir")
            .arg(workspace.facts_dir())
            .arg("--context-sensitivity")
            .arg(&self.config.context_sensitivity)
            .arg(bitcode);
        let outcome = self
            .executor
            .run(&tool, Some(self.config.analysis_timeout))?;
        Ok(outcome.into())
    }

    fn analysis_tool(&self) -> PathBuf {
        match self.config.engine {
            EngineMode::Compiled => self.config.analysis.clone(),
            EngineMode::Interpreted => self.config.tools.souffle.clone(),
        }
    }

    fn run_analysis(&self, workspace: &ScratchWorkspace) -> Result<StageResult, OracleError> {
        let jobs = self.config.jobs().to_string();
        let tool = match self.config.engine {
            EngineMode::Compiled => ToolCommand::new(&self.config.analysis).args(["-j", &jobs]),
            EngineMode::Interpreted => {
                let interpreter = &self.config.interpreter;
                let mut tool = ToolCommand::new(&self.config.tools.souffle)
                    .args(["-j", &jobs, "-L"])
                    .arg(&interpreter.library_dir)
                    .args(["-lFunctors", "-PSIPS:max-bound"])
                    .arg(&interpreter.project);
                if let Some(dir) = interpreter.project.parent() {
                    tool = tool.current_dir(dir);
                }
                tool
            }
        };
        let tool = tool
            .arg("-F")
            .arg(workspace.facts_dir())
            .arg("-D")
            .arg(workspace.results_dir());
        let outcome = self
            .executor
            .run(&tool, Some(self.config.analysis_timeout))?;
        Ok(outcome.into())
    }
}
