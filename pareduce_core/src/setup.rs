use crate::config::RunConfig;
use crate::executor::{ExecError, ResourceLimitedExecutor, ToolCommand, ToolOutcome};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("cloning {url} failed: {detail}")]
    CloneFailed { url: String, detail: String },
    #[error("search root {0:?} does not exist after cloning its repository")]
    StillMissing(PathBuf),
}

/// Repository (directory, URL) that provides `root`, if any is configured.
pub fn repository_for<'c>(config: &'c RunConfig, root: &Path) -> Option<(&'c str, &'c str)> {
    config
        .repositories
        .iter()
        .find(|(dir, _)| root.starts_with(dir.as_str()))
        .map(|(dir, url)| (dir.as_str(), url.as_str()))
}

/// Clones the benchmark repository behind every missing search root.
///
/// Roots that no configured repository covers are left alone; discovery
/// will warn about them. Returns the directories that were cloned.
pub fn fetch_missing_roots(
    config: &RunConfig,
    executor: &ResourceLimitedExecutor,
) -> Result<Vec<PathBuf>, SetupError> {
    let mut cloned = Vec::new();
    for root in &config.search_roots {
        if root.exists() {
            continue;
        }
        let Some((dir, url)) = repository_for(config, root) else {
            warn!("No repository known for missing search root {}", root.display());
            continue;
        };
        let target = PathBuf::from(dir);
        if !target.exists() {
            info!("Cloning {url} into {}", target.display());
            let tool = ToolCommand::new(&config.tools.git)
                .args(["clone", "--depth=1", "--branch=master", url])
                .arg(&target);
            match executor.run(&tool, None)? {
                ToolOutcome::Completed(_) => cloned.push(target),
                ToolOutcome::Failed(output) => {
                    return Err(SetupError::CloneFailed {
                        url: url.to_string(),
                        detail: format!("{}\n{}", output.describe(), output.output_tail(2048)),
                    });
                }
                ToolOutcome::TimedOut => {
                    return Err(SetupError::CloneFailed {
                        url: url.to_string(),
                        detail: "timed out".to_string(),
                    });
                }
            }
        }
        if !root.exists() {
            return Err(SetupError::StillMissing(root.clone()));
        }
    }
    Ok(cloned)
}
