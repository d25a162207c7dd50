use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "pareduce.toml";
pub const DEFAULT_MEMORY_LIMIT: u64 = 500 * 1024 * 1024;
pub const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_CONTEXT_SENSITIVITY: &str = "1-callsite";

pub const DEFAULT_ASSERTIONS: &[&str] = &[
    "assert_reachable_direct_calls_have_callees.csv.gz",
    "assert_subset_aliases_are_unification_aliases.csv.gz",
    "assert_subset_callgraph_edge_implies_unification_callgraph_edge.csv.gz",
    "assert_subset_reachable_ctx_implies_unification_reachable_ctx.csv.gz",
    "assert_subset_var_points_to_inhabited_implies_unification.csv.gz",
    "assert_unification_var_points_to_unique.csv.gz",
    "assert_unique_repr.csv.gz",
    "assert_var_points_to_implies_reachable.csv.gz",
];

const DEFAULT_PROJECT: &str = "llvm/PointerAnalysis/datalog/debug.project";

const DEFAULT_SEARCH_ROOTS: &[&str] = &["llvm-project/clang/test/Sema", "gcc.c-torture/execute"];

const DEFAULT_REPOSITORIES: &[(&str, &str)] = &[
    ("AnghaBench", "https://github.com/brenocfg/AnghaBench"),
    ("gcc", "https://github.com/gcc-mirror/gcc"),
    ("llvm-project", "https://github.com/llvm/llvm-project"),
    ("sv-benchmarks", "https://github.com/sosy-lab/sv-benchmarks"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("the number of cores and processes must both be at least 1")]
    ZeroWorkers,
    #[error("the number of processes ({processes}) should be less than the number of cores ({cores})")]
    ProcessesExceedCores { cores: usize, processes: usize },
    #[error("the number of processes ({processes}) should divide the number of cores ({cores})")]
    ProcessesDoNotDivideCores { cores: usize, processes: usize },
    #[error("at least one optimization flag set must be configured")]
    NoOptLevels,
    #[error("the assertion allow-list is empty")]
    NoAssertions,
    #[error("could not determine the path of the running executable: {0}")]
    SelfExe(#[source] std::io::Error),
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    pub clang: Option<PathBuf>,
    pub clangxx: Option<PathBuf>,
    pub llvm_as: Option<PathBuf>,
    pub llvm_dis: Option<PathBuf>,
    pub llvm_reduce: Option<PathBuf>,
    pub creduce: Option<PathBuf>,
    pub souffle: Option<PathBuf>,
    pub git: Option<PathBuf>,
    pub factgen: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    pub compile_secs: Option<u64>,
    pub analysis_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    /// `0` disables the ceiling.
    pub memory_bytes: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CompilerSettings {
    pub opt_levels: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AnalysisSettings {
    pub assertions: Option<Vec<String>>,
    pub context_sensitivity: Option<String>,
    pub project: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    pub roots: Option<Vec<PathBuf>>,
    pub repositories: Option<BTreeMap<String, String>>,
}

/// Optional on-disk settings. Every section may be omitted; anything left
/// unset falls back to the built-in defaults in [`RunConfig::bootstrap`].
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub compiler: CompilerSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub search: SearchSettings,
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values supplied on the command line. `None`/`false` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub debug: bool,
    pub cores: Option<usize>,
    pub processes: Option<usize>,
    pub build_root: Option<PathBuf>,
    pub analysis: Option<PathBuf>,
    pub interpreter: bool,
    pub test_only: bool,
    pub directories: Vec<PathBuf>,
    pub cache_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub context_sensitivity: Option<String>,
    pub project: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub self_exe: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Compiled,
    Interpreted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub clang: PathBuf,
    pub clangxx: PathBuf,
    pub llvm_as: PathBuf,
    pub llvm_dis: PathBuf,
    pub llvm_reduce: PathBuf,
    pub creduce: PathBuf,
    pub souffle: PathBuf,
    pub git: PathBuf,
    pub factgen: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSettings {
    /// Datalog project passed to the interpreter; its directory is the working dir.
    pub project: PathBuf,
    /// Directory holding the functor library (`-L`).
    pub library_dir: PathBuf,
}

/// Immutable run configuration, built once at startup and passed by
/// reference to every stage.
///
/// Every path-like value is absolute, so the configuration means the same
/// thing from whatever directory a minimizer runs its test in. Bare command
/// names such as `clang` are kept for `PATH` lookup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub debug: bool,
    pub cores: usize,
    pub processes: usize,
    pub test_only: bool,
    pub engine: EngineMode,
    pub build_root: PathBuf,
    pub analysis: PathBuf,
    pub output_root: PathBuf,
    pub cache_root: PathBuf,
    pub search_roots: Vec<PathBuf>,
    pub repositories: BTreeMap<String, String>,
    pub context_sensitivity: String,
    pub tools: ToolPaths,
    pub interpreter: InterpreterSettings,
    pub compile_timeout: Duration,
    pub analysis_timeout: Duration,
    pub memory_limit: Option<u64>,
    pub opt_levels: Vec<Vec<String>>,
    pub extra_compile_args: Vec<String>,
    pub assertions: Vec<String>,
    pub self_exe: PathBuf,
    pub config_file: Option<PathBuf>,
}

pub fn default_cores() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

pub fn default_build_root() -> PathBuf {
    PathBuf::from(".out/build")
}

pub fn default_analysis() -> PathBuf {
    PathBuf::from("pointer-analysis")
}

pub fn default_cache_root() -> PathBuf {
    std::env::temp_dir().join("pareduce-cache")
}

fn default_opt_levels() -> Vec<Vec<String>> {
    vec![vec!["-O0".to_string()], vec!["-O2".to_string()]]
}

impl RunConfig {
    pub fn bootstrap(overrides: Overrides, settings: Settings) -> Result<Self, ConfigError> {
        let cores = overrides.cores.unwrap_or_else(default_cores);
        let processes = overrides.processes.unwrap_or(cores);
        check_workers(cores, processes)?;

        // Command-line paths are relative to the startup directory, settings
        // paths to the directory of the file they were read from.
        let startup_dir = Path::new("");
        let settings_dir = overrides
            .config_file
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(startup_dir)
            .to_path_buf();

        let build_root = absolute(&overrides.build_root.unwrap_or_else(default_build_root));
        let tools = resolve_tools(settings.tools, &build_root, &settings_dir);

        let opt_levels = settings
            .compiler
            .opt_levels
            .unwrap_or_else(default_opt_levels);
        if opt_levels.is_empty() {
            return Err(ConfigError::NoOptLevels);
        }

        let assertions = settings
            .analysis
            .assertions
            .unwrap_or_else(|| DEFAULT_ASSERTIONS.iter().map(|s| s.to_string()).collect());
        if assertions.is_empty() {
            return Err(ConfigError::NoAssertions);
        }

        let search_roots = if !overrides.directories.is_empty() {
            overrides.directories
        } else {
            settings
                .search
                .roots
                .unwrap_or_else(|| DEFAULT_SEARCH_ROOTS.iter().map(PathBuf::from).collect())
        };
        let repositories = settings.search.repositories.unwrap_or_else(|| {
            DEFAULT_REPOSITORIES
                .iter()
                .map(|(dir, url)| (dir.to_string(), url.to_string()))
                .collect()
        });

        let interpreter = InterpreterSettings {
            project: match (overrides.project, settings.analysis.project) {
                (Some(path), _) => anchor(&path, startup_dir),
                (None, Some(path)) => anchor(&path, &settings_dir),
                (None, None) => anchor(Path::new(DEFAULT_PROJECT), startup_dir),
            },
            library_dir: match (overrides.library_dir, settings.analysis.library_dir) {
                (Some(path), _) => anchor(&path, startup_dir),
                (None, Some(path)) => anchor(&path, &settings_dir),
                (None, None) => build_root.join("llvm"),
            },
        };

        let memory_limit = match settings.limits.memory_bytes {
            Some(0) => None,
            Some(bytes) => Some(bytes),
            None => Some(DEFAULT_MEMORY_LIMIT),
        };

        let self_exe = match overrides.self_exe {
            Some(path) => path,
            None => std::env::current_exe().map_err(ConfigError::SelfExe)?,
        };

        Ok(Self {
            debug: overrides.debug,
            cores,
            processes,
            test_only: overrides.test_only,
            engine: if overrides.interpreter {
                EngineMode::Interpreted
            } else {
                EngineMode::Compiled
            },
            analysis: anchor_tool(
                overrides.analysis.unwrap_or_else(default_analysis),
                startup_dir,
            ),
            output_root: absolute(&overrides.output_root.unwrap_or_else(|| PathBuf::from("."))),
            cache_root: absolute(&overrides.cache_root.unwrap_or_else(default_cache_root)),
            search_roots,
            repositories,
            context_sensitivity: overrides
                .context_sensitivity
                .or(settings.analysis.context_sensitivity)
                .unwrap_or_else(|| DEFAULT_CONTEXT_SENSITIVITY.to_string()),
            tools,
            interpreter,
            compile_timeout: Duration::from_secs(
                settings
                    .timeouts
                    .compile_secs
                    .unwrap_or(DEFAULT_COMPILE_TIMEOUT_SECS),
            ),
            analysis_timeout: Duration::from_secs(
                settings
                    .timeouts
                    .analysis_secs
                    .unwrap_or(DEFAULT_ANALYSIS_TIMEOUT_SECS),
            ),
            memory_limit,
            opt_levels,
            extra_compile_args: settings.compiler.extra_args,
            assertions,
            self_exe,
            config_file: overrides.config_file.as_deref().map(absolute),
            build_root,
        })
    }

    /// Solver threads per analysis run.
    pub fn jobs(&self) -> usize {
        self.cores / self.processes
    }

    /// Arguments that make a recursive `--no-reduce` invocation see the same
    /// configuration as this run.
    pub fn passthrough_args(&self) -> Vec<String> {
        let mut args = vec![
            "--build-root".to_string(),
            self.build_root.display().to_string(),
            "--analysis".to_string(),
            self.analysis.display().to_string(),
            "--cache-dir".to_string(),
            self.cache_root.display().to_string(),
            "--context-sensitivity".to_string(),
            self.context_sensitivity.clone(),
            "--cores".to_string(),
            self.jobs().to_string(),
            "--processes".to_string(),
            "1".to_string(),
        ];
        if let Some(file) = &self.config_file {
            args.push("--config".to_string());
            args.push(file.display().to_string());
        }
        if self.engine == EngineMode::Interpreted {
            args.extend([
                "--interpreter".to_string(),
                "--project".to_string(),
                self.interpreter.project.display().to_string(),
                "--library-dir".to_string(),
                self.interpreter.library_dir.display().to_string(),
            ]);
        }
        args
    }
}

fn check_workers(cores: usize, processes: usize) -> Result<(), ConfigError> {
    if cores == 0 || processes == 0 {
        return Err(ConfigError::ZeroWorkers);
    }
    if cores < processes {
        return Err(ConfigError::ProcessesExceedCores { cores, processes });
    }
    if cores % processes != 0 {
        return Err(ConfigError::ProcessesDoNotDivideCores { cores, processes });
    }
    Ok(())
}

fn resolve_tools(settings: ToolSettings, build_root: &Path, settings_dir: &Path) -> ToolPaths {
    let tool = |configured: Option<PathBuf>, default: &str| {
        configured.map_or_else(|| PathBuf::from(default), |p| anchor_tool(p, settings_dir))
    };
    ToolPaths {
        clang: tool(settings.clang, "clang"),
        clangxx: tool(settings.clangxx, "clang++"),
        llvm_as: tool(settings.llvm_as, "llvm-as"),
        llvm_dis: tool(settings.llvm_dis, "llvm-dis"),
        llvm_reduce: tool(settings.llvm_reduce, "llvm-reduce"),
        creduce: tool(settings.creduce, "creduce"),
        souffle: tool(settings.souffle, "souffle"),
        git: tool(settings.git, "git"),
        factgen: settings.factgen.map_or_else(
            || build_root.join("llvm/PointerAnalysis/PointerAnalysis/factgen-exe"),
            |p| anchor_tool(p, settings_dir),
        ),
    }
}

/// Minimizers run the recursive test from their own working directory, so
/// relative paths handed to them must be made absolute first.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolves `path` against `base`; an empty `base` means the current directory.
fn anchor(path: &Path, base: &Path) -> PathBuf {
    absolute(&base.join(path))
}

/// Like [`anchor`], except that a bare command name stays as it is.
fn anchor_tool(path: PathBuf, base: &Path) -> PathBuf {
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => path,
        _ => anchor(&path, base),
    }
}
