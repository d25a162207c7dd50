use crate::artifact::{Artifact, file_name_lossy};
use crate::compiler::{self, CompileError, CompileVariant};
use crate::config::{RunConfig, absolute};
use crate::executor::{
    ExecError, ResourceLimitedExecutor, ToolCommand, ToolOutcome, write_script,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReduceError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("minimizer `{tool}` failed on {input:?}: {detail}")]
    MinimizerFailed {
        tool: String,
        input: PathBuf,
        detail: String,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ReduceError + '_ {
    move |source| ReduceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Which external minimizer handles an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `llvm-reduce` over the interesting IR.
    IrLevel,
    /// `creduce` over the original source.
    SourceLevel,
}

impl Backend {
    pub fn for_artifact(artifact: &Artifact) -> Self {
        if artifact.is_source() {
            Backend::SourceLevel
        } else {
            Backend::IrLevel
        }
    }
}

/// Preserves interesting artifacts and hands them to a minimizer, which
/// calls back into this program with `--no-reduce` to test candidates.
pub struct Dispatcher<'a> {
    config: &'a RunConfig,
    executor: &'a ResourceLimitedExecutor,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a RunConfig, executor: &'a ResourceLimitedExecutor) -> Self {
        Self { config, executor }
    }

    /// Copies the interesting IR to `interesting-<name>` in the output root,
    /// with a textual companion when the IR is bitcode.
    pub fn preserve(&self, variant: &CompileVariant) -> Result<PathBuf, ReduceError> {
        let output_root = &self.config.output_root;
        fs::create_dir_all(output_root).map_err(io_err(output_root))?;
        let kept = output_root.join(format!("interesting-{}", variant.name()));
        fs::copy(&variant.ir_path, &kept).map_err(io_err(&kept))?;
        match compiler::disassemble(self.config, self.executor, &kept) {
            Ok(text) => debug!("Preserved {} and {}", kept.display(), text.display()),
            Err(CompileError::Exec(ExecError::Interrupted(tool))) => {
                return Err(ExecError::Interrupted(tool).into());
            }
            Err(e) => warn!("Could not disassemble {}: {e}", kept.display()),
        }
        Ok(kept)
    }

    /// Preserves `variant` and runs the minimizer matching `artifact`'s kind.
    /// Returns the reduced output, which is left untouched if it already exists.
    pub fn dispatch(
        &self,
        artifact: &Artifact,
        variant: &CompileVariant,
    ) -> Result<PathBuf, ReduceError> {
        self.preserve(variant)?;
        match Backend::for_artifact(artifact) {
            Backend::IrLevel => self.reduce_ir(&variant.ir_path),
            Backend::SourceLevel => self.reduce_source(artifact),
        }
    }

    fn reduce_ir(&self, ir: &Path) -> Result<PathBuf, ReduceError> {
        let stem = ir
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "program".to_string());
        let output_root = absolute(&self.config.output_root);
        let reduced = output_root.join(format!("reduced-{stem}.ll"));
        if reduced.exists() {
            info!("{} already reduced, skipping", reduced.display());
            return Ok(reduced);
        }

        let mut tool = ToolCommand::new(&self.config.tools.llvm_reduce)
            .arg(format!("--test={}", self.config.self_exe.display()))
            .arg("--test-arg=--no-reduce");
        for arg in self.config.passthrough_args() {
            tool = tool.arg(format!("--test-arg={arg}"));
        }
        let tool = tool
            .arg("-o")
            .arg(&reduced)
            .arg(absolute(ir))
            .current_dir(&output_root);

        info!("Reducing {} with llvm-reduce", ir.display());
        self.run_minimizer(&tool, ir)?;
        compiler::assemble(self.config, self.executor, &reduced, &output_root)?;
        Ok(reduced)
    }

    fn reduce_source(&self, artifact: &Artifact) -> Result<PathBuf, ReduceError> {
        let output_root = absolute(&self.config.output_root);
        let name = source_reduced_name(artifact);
        let copy = output_root.join(&name);
        if copy.exists() {
            info!("{} already reduced, skipping", copy.display());
            return Ok(copy);
        }
        fs::copy(artifact.path(), &copy).map_err(io_err(&copy))?;

        // creduce passes no arguments to its test, so the whole invocation
        // is baked into a wrapper script.
        let wrapper_dir = tempfile::Builder::new()
            .prefix("pareduce-creduce")
            .tempdir()
            .map_err(io_err(&output_root))?;
        let wrapper = wrapper_dir.path().join("interesting.sh");
        write_script(&wrapper, &wrapper_body(self.config, &name)).map_err(io_err(&wrapper))?;

        let tool = ToolCommand::new(&self.config.tools.creduce)
            .arg(&wrapper)
            .arg(&name)
            .current_dir(&output_root);

        info!("Reducing {} with creduce", artifact);
        if let Err(e) = self.run_minimizer(&tool, artifact.path()) {
            // Leave no partially reduced copy that a rerun would mistake for a result.
            let _ = fs::remove_file(&copy);
            return Err(e);
        }
        Ok(copy)
    }

    fn run_minimizer(&self, tool: &ToolCommand, input: &Path) -> Result<(), ReduceError> {
        match self.executor.run(tool, None)? {
            ToolOutcome::Completed(_) => Ok(()),
            ToolOutcome::Failed(output) => Err(ReduceError::MinimizerFailed {
                tool: tool.program.display().to_string(),
                input: input.to_path_buf(),
                detail: format!("{}\n{}", output.describe(), output.output_tail(2048)),
            }),
            ToolOutcome::TimedOut => Err(ReduceError::MinimizerFailed {
                tool: tool.program.display().to_string(),
                input: input.to_path_buf(),
                detail: "timed out".to_string(),
            }),
        }
    }
}

fn wrapper_body(config: &RunConfig, name: &str) -> String {
    let mut words = vec![
        shell_quote(&config.self_exe.display().to_string()),
        "--no-reduce".to_string(),
    ];
    words.extend(config.passthrough_args().iter().map(|a| shell_quote(a)));
    words.push(shell_quote(name));
    format!("exec {}", words.join(" "))
}

fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Name of the file the source-level minimizer reduces in place.
pub fn source_reduced_name(artifact: &Artifact) -> String {
    format!("source-reduced-{}", file_name_lossy(artifact.path()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::{Overrides, Settings};
    use tempfile::{TempDir, tempdir};

    // Records its arguments, then writes a reduced module to the path after `-o`.
    const FAKE_LLVM_REDUCE: &str = r#"
dir=$(dirname "$0")
echo "$@" > "$dir/llvm-reduce.args"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
  esac
  shift
done
echo "; reduced" > "$out"
"#;

    // Runs the interestingness script once from the working dir, like the real
    // tool does from its own scratch copy, then shrinks the file.
    const FAKE_CREDUCE: &str = r#"
dir=$(dirname "$0")
pwd > "$dir/creduce.cwd"
cat "$1" > "$dir/creduce.script"
echo "int main(void) { return 0; }" > "$2"
"#;

    const FAILING_TOOL: &str = "echo 'no progress' >&2; exit 1";

    const FAKE_LLVM_AS: &str = r#"printf 'BC\300\336' > "$3""#;
    const FAKE_LLVM_DIS: &str = r#"echo "; ModuleID = '$1'" > "$3""#;

    struct Fixture {
        dir: TempDir,
        config: RunConfig,
        executor: ResourceLimitedExecutor,
    }

    impl Fixture {
        fn new(llvm_reduce: &str, creduce: &str) -> Self {
            let dir = tempdir().unwrap();
            let bin = dir.path().join("bin");
            fs::create_dir(&bin).unwrap();
            write_script(&bin.join("llvm-reduce"), llvm_reduce).unwrap();
            write_script(&bin.join("creduce"), creduce).unwrap();
            write_script(&bin.join("llvm-as"), FAKE_LLVM_AS).unwrap();
            write_script(&bin.join("llvm-dis"), FAKE_LLVM_DIS).unwrap();

            let mut settings = Settings::default();
            settings.tools.llvm_reduce = Some(bin.join("llvm-reduce"));
            settings.tools.creduce = Some(bin.join("creduce"));
            settings.tools.llvm_as = Some(bin.join("llvm-as"));
            settings.tools.llvm_dis = Some(bin.join("llvm-dis"));
            let overrides = Overrides {
                cores: Some(4),
                processes: Some(2),
                output_root: Some(dir.path().join("out")),
                self_exe: Some(PathBuf::from("/usr/local/bin/pareduce")),
                ..Default::default()
            };
            let config = RunConfig::bootstrap(overrides, settings).unwrap();
            Self {
                dir,
                config,
                executor: ResourceLimitedExecutor::new(None, CancelToken::new()),
            }
        }

        fn dispatcher(&self) -> Dispatcher<'_> {
            Dispatcher::new(&self.config, &self.executor)
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.dir.path().join(rel)).unwrap()
        }

        fn ir_variant(&self) -> (Artifact, CompileVariant) {
            let bc = self.dir.path().join("m.bc");
            fs::write(&bc, b"BC\xC0\xDE").unwrap();
            let artifact = Artifact::from_path(&bc).unwrap();
            let variant = CompileVariant {
                ir_path: bc,
                flags: Vec::new(),
                key: "m.bc.0123".to_string(),
                success: true,
            };
            (artifact, variant)
        }

        fn source_variant(&self) -> (Artifact, CompileVariant) {
            let src = self.dir.path().join("prog.c");
            fs::write(&src, "int main(void) { int *p = 0; return *p; }\n").unwrap();
            let ir = self.dir.path().join("prog.-O0.abcd.bc");
            fs::write(&ir, b"BC\xC0\xDE").unwrap();
            let variant = CompileVariant {
                ir_path: ir,
                flags: vec!["-O0".to_string()],
                key: "prog.-O0.abcd".to_string(),
                success: true,
            };
            (Artifact::from_path(src).unwrap(), variant)
        }
    }

    #[test]
    fn backend_follows_artifact_kind() {
        let c = Artifact::from_path("x.c").unwrap();
        let cxx = Artifact::from_path("x.C").unwrap();
        let ll = Artifact::from_path("x.ll").unwrap();
        assert_eq!(Backend::for_artifact(&c), Backend::SourceLevel);
        assert_eq!(Backend::for_artifact(&cxx), Backend::SourceLevel);
        assert_eq!(Backend::for_artifact(&ll), Backend::IrLevel);
    }

    #[test]
    fn ir_reduction_invokes_llvm_reduce_with_passthrough() {
        let fx = Fixture::new(FAKE_LLVM_REDUCE, FAILING_TOOL);
        let (artifact, variant) = fx.ir_variant();
        let reduced = fx.dispatcher().dispatch(&artifact, &variant).unwrap();

        let out = fx.dir.path().join("out");
        assert_eq!(reduced, out.join("reduced-m.ll"));
        assert!(out.join("interesting-m.bc").exists());
        assert!(out.join("interesting-m.ll").exists());
        assert!(out.join("reduced-m.bc").exists());

        let args = fx.read("bin/llvm-reduce.args");
        assert!(args.starts_with("--test=/usr/local/bin/pareduce --test-arg=--no-reduce"));
        assert!(args.contains("--test-arg=--processes --test-arg=1"));
        assert!(args.contains("--test-arg=--cores --test-arg=2"));
        assert!(args.trim_end().ends_with("m.bc"));
    }

    #[test]
    fn existing_reduction_is_not_redone() {
        let fx = Fixture::new(FAILING_TOOL, FAILING_TOOL);
        let (artifact, variant) = fx.ir_variant();
        let out = fx.dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("reduced-m.ll"), "; done\n").unwrap();
        let reduced = fx.dispatcher().dispatch(&artifact, &variant).unwrap();
        assert_eq!(fs::read_to_string(reduced).unwrap(), "; done\n");
    }

    #[test]
    fn source_reduction_uses_wrapper_script() {
        let fx = Fixture::new(FAILING_TOOL, FAKE_CREDUCE);
        let (artifact, variant) = fx.source_variant();
        let reduced = fx.dispatcher().dispatch(&artifact, &variant).unwrap();

        let out = fx.dir.path().join("out");
        assert_eq!(reduced, out.join("source-reduced-prog.c"));
        assert_eq!(
            fs::read_to_string(&reduced).unwrap(),
            "int main(void) { return 0; }\n"
        );
        assert!(out.join("interesting-prog.-O0.abcd.bc").exists());
        // The original is never modified.
        assert!(fx.read("prog.c").contains("*p"));

        assert_eq!(fx.read("bin/creduce.cwd").trim(), out.to_string_lossy());
        let script = fx.read("bin/creduce.script");
        assert!(script.starts_with("#!/bin/sh\nexec '/usr/local/bin/pareduce' --no-reduce "));
        assert!(script.trim_end().ends_with("'source-reduced-prog.c'"));
        assert_eq!(source_reduced_name(&artifact), "source-reduced-prog.c");
    }

    #[test]
    fn minimizer_failure_is_reported() {
        let fx = Fixture::new(FAILING_TOOL, FAILING_TOOL);
        let (artifact, variant) = fx.source_variant();
        let err = fx.dispatcher().dispatch(&artifact, &variant).unwrap_err();
        match err {
            ReduceError::MinimizerFailed { detail, .. } => {
                assert!(detail.contains("no progress"))
            }
            other => panic!("Expected MinimizerFailed, got {other:?}"),
        }
        assert!(!fx.dir.path().join("out/source-reduced-prog.c").exists());
    }

    #[test]
    fn shell_quoting_survives_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
