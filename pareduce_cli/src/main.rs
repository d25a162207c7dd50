use pareduce_core::cache::ResultCache;
use pareduce_core::cancel::CancelToken;
use pareduce_core::config::{ConfigError, DEFAULT_CONFIG_FILE, Overrides, RunConfig, Settings};
use pareduce_core::distributor::{PipelineError, check_program, classify, discover, run_all};
use pareduce_core::executor::ResourceLimitedExecutor;
use pareduce_core::setup::fetch_missing_roots;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_NOT_INTERESTING: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Find programs that break the pointer analysis and reduce them.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Program to check; without one, every program under the search roots is scanned.
    program: Option<PathBuf>,
    /// Debug logging; keep scratch directories and compiled bitcode.
    #[clap(short, long)]
    debug: bool,
    #[clap(short, long)]
    cores: Option<usize>,
    /// Concurrent programs; must divide --cores.
    #[clap(short, long)]
    processes: Option<usize>,
    #[clap(short, long, value_parser)]
    build_root: Option<PathBuf>,
    /// Clear the cache before doing anything else.
    #[clap(short, long)]
    reset: bool,
    /// Search root to scan instead of the configured ones (repeatable).
    #[clap(long = "directory", value_parser)]
    directories: Vec<PathBuf>,
    /// Compiled analysis executable.
    #[clap(short, long, value_parser)]
    analysis: Option<PathBuf>,
    /// Only classify PROGRAM; exit 0 iff it is interesting.
    #[clap(short, long, requires = "program")]
    no_reduce: bool,
    /// Run the analysis with the Datalog interpreter.
    #[clap(short, long)]
    interpreter: bool,
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    #[clap(long, value_parser)]
    cache_dir: Option<PathBuf>,
    #[clap(long, value_parser)]
    output_dir: Option<PathBuf>,
    #[clap(long)]
    context_sensitivity: Option<String>,
    /// Datalog project run by the interpreter.
    #[clap(long, value_parser)]
    project: Option<PathBuf>,
    /// Directory holding the interpreter's functor library.
    #[clap(long, value_parser)]
    library_dir: Option<PathBuf>,
    /// Clone missing benchmark repositories before scanning.
    #[clap(long)]
    fetch: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<(Settings, Option<PathBuf>), ConfigError> {
    match &cli.config {
        Some(path) => {
            debug!("Loading configuration from {path:?}");
            Ok((Settings::load_from_file(path)?, Some(path.clone())))
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                debug!("Loading default configuration from {default_path:?}");
                Ok((Settings::load_from_file(&default_path)?, Some(default_path)))
            } else {
                Ok((Settings::default(), None))
            }
        }
    }
}

fn bootstrap(cli: &Cli) -> Result<RunConfig, ConfigError> {
    let (settings, config_file) = load_settings(cli)?;
    let overrides = Overrides {
        debug: cli.debug,
        cores: cli.cores,
        processes: cli.processes,
        build_root: cli.build_root.clone(),
        analysis: cli.analysis.clone(),
        interpreter: cli.interpreter,
        test_only: cli.no_reduce,
        directories: cli.directories.clone(),
        cache_root: cli.cache_dir.clone(),
        output_root: cli.output_dir.clone(),
        context_sensitivity: cli.context_sensitivity.clone(),
        project: cli.project.clone(),
        library_dir: cli.library_dir.clone(),
        config_file,
        self_exe: None,
    };
    RunConfig::bootstrap(overrides, settings)
}

fn run(cli: Cli, config: RunConfig, cancel: CancelToken) -> anyhow::Result<ExitCode> {
    if cli.reset {
        info!("Resetting cache at {}", config.cache_root.display());
        ResultCache::open(&config.cache_root)?.reset()?;
    }

    if config.test_only {
        let program = cli
            .program
            .context("--no-reduce needs a program to classify")?;
        let verdict = classify(&program, &config, &cancel)?;
        return Ok(ExitCode::from(verdict.exit_code() as u8));
    }

    let summary = match &cli.program {
        Some(program) => check_program(&config, program, &cancel)?,
        None => {
            if cli.fetch {
                let executor = ResourceLimitedExecutor::new(None, cancel.clone());
                for dir in fetch_missing_roots(&config, &executor)? {
                    info!("Fetched {}", dir.display());
                }
            }
            run_all(&config, discover(&config.search_roots), &cancel)?
        }
    };
    if summary.reduce_failures > 0 {
        warn!("{} reduction(s) failed", summary.reduce_failures);
    }

    Ok(if summary.found_interesting() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_NOT_INTERESTING)
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = match bootstrap(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", anyhow::Error::from(e));
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    debug!("Effective configuration: {config:#?}");

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Could not install interrupt handler: {e}");
    }

    let interrupted = cancel.clone();
    match run(cli, config, cancel) {
        Ok(code) => code,
        Err(e) => {
            if interrupted.is_cancelled()
                || matches!(
                    e.downcast_ref::<PipelineError>(),
                    Some(PipelineError::Interrupted)
                )
            {
                warn!("Interrupted, stopping");
                return ExitCode::from(EXIT_INTERRUPTED);
            }
            error!("{e:#}");
            ExitCode::from(EXIT_NOT_INTERESTING)
        }
    }
}
