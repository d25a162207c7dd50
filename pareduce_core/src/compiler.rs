use crate::artifact::{Artifact, ArtifactKind, looks_like_bitcode};
use crate::config::RunConfig;
use crate::executor::{ExecError, ResourceLimitedExecutor, ToolCommand, ToolOutcome};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("`{tool}` succeeded but {path:?} does not look like LLVM bitcode")]
    NotBitcode { tool: String, path: PathBuf },
    #[error("`{tool}` failed on {path:?}: {detail}")]
    ToolFailed {
        tool: String,
        path: PathBuf,
        detail: String,
    },
    #[error("`{tool}` timed out on {path:?}")]
    ToolTimedOut { tool: String, path: PathBuf },
    #[error("expected an IR file, got {0:?}")]
    NotIr(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where a variant's IR lives and the cache key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPlan {
    pub ir_path: PathBuf,
    pub flags: Vec<String>,
    pub key: String,
}

/// One compiled (or identity) IR variant of an artifact.
///
/// Once produced, a variant is reused by path without re-verifying its
/// contents; the key's digest is what ties it to the source bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileVariant {
    pub ir_path: PathBuf,
    pub flags: Vec<String>,
    pub key: String,
    pub success: bool,
}

impl CompileVariant {
    pub fn name(&self) -> String {
        crate::artifact::file_name_lossy(&self.ir_path)
    }
}

/// Turns sources into IR variants, memoized under `out_dir`.
pub struct Compiler<'a> {
    config: &'a RunConfig,
    executor: &'a ResourceLimitedExecutor,
    out_dir: PathBuf,
}

impl<'a> Compiler<'a> {
    pub fn new(
        config: &'a RunConfig,
        executor: &'a ResourceLimitedExecutor,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            executor,
            out_dir: out_dir.into(),
        }
    }

    /// Flag sets to build `artifact` with: every configured level for
    /// sources, a single empty set for IR.
    pub fn flag_sets(&self, artifact: &Artifact) -> Vec<Vec<String>> {
        if artifact.is_source() {
            self.config.opt_levels.clone()
        } else {
            vec![Vec::new()]
        }
    }

    /// Computes the deterministic IR path and cache key without compiling.
    pub fn plan(&self, artifact: &Artifact, flags: &[String]) -> Result<VariantPlan, CompileError> {
        let bytes = fs::read(artifact.path()).map_err(|source| CompileError::Io {
            path: artifact.path().to_path_buf(),
            source,
        })?;
        let stem = file_stem(artifact.path());

        if !artifact.is_source() {
            let ext = artifact
                .path()
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            let digest = md5::compute(&bytes);
            return Ok(VariantPlan {
                ir_path: artifact.path().to_path_buf(),
                flags: Vec::new(),
                key: format!("{stem}.{ext}.{}", short_digest(digest)),
            });
        }

        let mut ctx = md5::Context::new();
        ctx.consume(&bytes);
        for flag in flags.iter().chain(&self.config.extra_compile_args) {
            ctx.consume([0u8]);
            ctx.consume(flag.as_bytes());
        }
        let key = format!(
            "{stem}.{}.{}",
            sanitize(&flags.join(".")),
            short_digest(ctx.compute())
        );
        Ok(VariantPlan {
            ir_path: self.out_dir.join(format!("{key}.bc")),
            flags: flags.to_vec(),
            key,
        })
    }

    /// Compiles `artifact` with `flags`. IR artifacts pass through unchanged.
    ///
    /// A compiler crash or timeout is not an error: it comes back as
    /// `success == false` and the caller classifies the variant as uncompilable.
    pub fn compile(&self, artifact: &Artifact, flags: &[String]) -> Result<CompileVariant, CompileError> {
        let plan = self.plan(artifact, flags)?;
        self.build(artifact, plan)
    }

    /// Runs the compiler for an already computed plan.
    pub fn build(&self, artifact: &Artifact, plan: VariantPlan) -> Result<CompileVariant, CompileError> {
        let VariantPlan {
            ir_path,
            flags,
            key,
        } = plan;
        if !artifact.is_source() || ir_path.exists() {
            if artifact.is_source() {
                debug!("Reusing compiled {}", ir_path.display());
            }
            return Ok(CompileVariant {
                ir_path,
                flags,
                key,
                success: true,
            });
        }

        fs::create_dir_all(&self.out_dir).map_err(|source| CompileError::Io {
            path: self.out_dir.clone(),
            source,
        })?;
        // Compile next to the final path and rename, so an interrupted or
        // concurrent build never leaves a truncated file that looks like a hit.
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{key}."))
            .suffix(".bc")
            .tempfile_in(&self.out_dir)
            .map_err(|source| CompileError::Io {
                path: self.out_dir.clone(),
                source,
            })?;

        let compiler = match artifact.kind() {
            ArtifactKind::CxxSource => &self.config.tools.clangxx,
            _ => &self.config.tools.clang,
        };
        let tool = ToolCommand::new(compiler)
            .args([
                "-fno-rtti",
                "-fno-discard-value-names",
                "-emit-llvm",
                "-o",
            ])
            .arg(staging.path())
            .arg("-c")
            .arg(artifact.path())
            .args(&flags)
            .args(&self.config.extra_compile_args);

        let success = match self.executor.run(&tool, Some(self.config.compile_timeout))? {
            ToolOutcome::Completed(_) => {
                if !looks_like_bitcode(staging.path()) {
                    return Err(CompileError::NotBitcode {
                        tool: compiler.display().to_string(),
                        path: staging.path().to_path_buf(),
                    });
                }
                staging
                    .persist(&ir_path)
                    .map_err(|e| CompileError::Io {
                        path: ir_path.clone(),
                        source: e.error,
                    })?;
                true
            }
            ToolOutcome::Failed(output) => {
                debug!(
                    "Compiling {} with {:?} failed: {}\n{}",
                    artifact,
                    flags,
                    output.describe(),
                    output.output_tail(2048)
                );
                false
            }
            ToolOutcome::TimedOut => {
                debug!("Compiling {artifact} with {flags:?} timed out");
                false
            }
        };

        Ok(CompileVariant {
            ir_path,
            flags,
            key,
            success,
        })
    }

    /// One variant per configured flag set for sources; the identity variant for IR.
    pub fn compile_variants(&self, artifact: &Artifact) -> Result<Vec<CompileVariant>, CompileError> {
        self.flag_sets(artifact)
            .iter()
            .map(|flags| self.compile(artifact, flags))
            .collect()
    }
}

/// Assembles textual IR into `<stem>.bc` under `out_dir`; bitcode is
/// returned as is. Either way the result must carry the bitcode magic.
pub fn assemble(
    config: &RunConfig,
    executor: &ResourceLimitedExecutor,
    path: &Path,
    out_dir: &Path,
) -> Result<PathBuf, CompileError> {
    let out = match ArtifactKind::from_path(path) {
        Some(ArtifactKind::BinaryIr) => path.to_path_buf(),
        Some(ArtifactKind::TextIr) => {
            fs::create_dir_all(out_dir).map_err(|source| CompileError::Io {
                path: out_dir.to_path_buf(),
                source,
            })?;
            let out = out_dir.join(format!("{}.bc", file_stem(path)));
            run_llvm_tool(config, executor, &config.tools.llvm_as, path, &out)?;
            out
        }
        _ => return Err(CompileError::NotIr(path.to_path_buf())),
    };
    if !looks_like_bitcode(&out) {
        return Err(CompileError::NotBitcode {
            tool: config.tools.llvm_as.display().to_string(),
            path: out,
        });
    }
    Ok(out)
}

/// Disassembles bitcode into textual IR beside it; textual IR is returned as is.
pub fn disassemble(
    config: &RunConfig,
    executor: &ResourceLimitedExecutor,
    path: &Path,
) -> Result<PathBuf, CompileError> {
    match ArtifactKind::from_path(path) {
        Some(ArtifactKind::TextIr) => Ok(path.to_path_buf()),
        Some(ArtifactKind::BinaryIr) => {
            let out = path.with_extension("ll");
            run_llvm_tool(config, executor, &config.tools.llvm_dis, path, &out)?;
            if !out.exists() {
                return Err(CompileError::ToolFailed {
                    tool: config.tools.llvm_dis.display().to_string(),
                    path: path.to_path_buf(),
                    detail: format!("no output at {}", out.display()),
                });
            }
            Ok(out)
        }
        _ => Err(CompileError::NotIr(path.to_path_buf())),
    }
}

fn run_llvm_tool(
    config: &RunConfig,
    executor: &ResourceLimitedExecutor,
    tool_path: &Path,
    input: &Path,
    out: &Path,
) -> Result<(), CompileError> {
    let tool = ToolCommand::new(tool_path).arg(input).arg("-o").arg(out);
    match executor.run(&tool, Some(config.compile_timeout))? {
        ToolOutcome::Completed(_) => Ok(()),
        ToolOutcome::Failed(output) => Err(CompileError::ToolFailed {
            tool: tool_path.display().to_string(),
            path: input.to_path_buf(),
            detail: format!("{}: {}", output.describe(), output.output_tail(1024)),
        }),
        ToolOutcome::TimedOut => Err(CompileError::ToolTimedOut {
            tool: tool_path.display().to_string(),
            path: input.to_path_buf(),
        }),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string())
}

fn short_digest(digest: md5::Digest) -> String {
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Keeps flag text readable in file names while dropping path separators.
fn sanitize(flags: &str) -> String {
    flags
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '=' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::{Overrides, RunConfig, Settings};
    use crate::executor::write_script;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    // Fake clang: writes bitcode magic to the path after `-o`, fails for
    // sources containing FAIL, hangs for sources containing HANG, and counts
    // its invocations in `calls`.
    const FAKE_CLANG: &str = r#"
dir=$(dirname "$0")
echo x >> "$dir/calls"
out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    -c) src="$2"; shift ;;
  esac
  shift
done
if grep -q FAIL "$src"; then echo "error: nope" >&2; exit 1; fi
if grep -q HANG "$src"; then sleep 5; fi
printf 'BC\300\336' > "$out"
"#;

    const FAKE_LLVM_AS: &str = r#"
printf 'BC\300\336' > "$3"
"#;

    const FAKE_LLVM_DIS: &str = r#"
echo "; ModuleID = '$1'" > "$3"
"#;

    struct Fixture {
        dir: TempDir,
        config: RunConfig,
        executor: ResourceLimitedExecutor,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let bin = dir.path().join("bin");
            fs::create_dir(&bin).unwrap();
            write_script(&bin.join("clang"), FAKE_CLANG).unwrap();
            write_script(&bin.join("llvm-as"), FAKE_LLVM_AS).unwrap();
            write_script(&bin.join("llvm-dis"), FAKE_LLVM_DIS).unwrap();

            let mut settings = Settings::default();
            settings.tools.clang = Some(bin.join("clang"));
            settings.tools.clangxx = Some(bin.join("clang"));
            settings.tools.llvm_as = Some(bin.join("llvm-as"));
            settings.tools.llvm_dis = Some(bin.join("llvm-dis"));
            settings.timeouts.compile_secs = Some(1);
            let overrides = Overrides {
                cores: Some(1),
                processes: Some(1),
                self_exe: Some(PathBuf::from("/bin/false")),
                ..Default::default()
            };
            let config = RunConfig::bootstrap(overrides, settings).unwrap();
            let executor = ResourceLimitedExecutor::new(None, CancelToken::new());
            Self {
                dir,
                config,
                executor,
            }
        }

        fn compiler(&self) -> Compiler<'_> {
            Compiler::new(&self.config, &self.executor, self.dir.path().join("out"))
        }

        fn calls(&self) -> usize {
            fs::read_to_string(self.dir.path().join("bin/calls"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn source(&self, name: &str, body: &str) -> Artifact {
            let path = self.dir.path().join(name);
            fs::write(&path, body).unwrap();
            Artifact::from_path(path).unwrap()
        }
    }

    #[test]
    fn ir_artifacts_are_identity_variants() {
        let fx = Fixture::new();
        let bc = fx.dir.path().join("m.bc");
        fs::write(&bc, b"BC\xC0\xDE").unwrap();
        let artifact = Artifact::from_path(&bc).unwrap();
        let variants = fx.compiler().compile_variants(&artifact).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].ir_path, bc);
        assert!(variants[0].success);
        assert!(variants[0].key.starts_with("m.bc."));
        assert_eq!(fx.calls(), 0);
    }

    #[test]
    fn sources_get_one_variant_per_flag_set() {
        let fx = Fixture::new();
        let artifact = fx.source("prog.c", "int main(void) { return 0; }\n");
        let variants = fx.compiler().compile_variants(&artifact).unwrap();
        assert_eq!(variants.len(), 2);
        assert!(variants.iter().all(|v| v.success && looks_like_bitcode(&v.ir_path)));
        assert!(variants[0].key.starts_with("prog.-O0."));
        assert!(variants[1].key.starts_with("prog.-O2."));
        assert_ne!(variants[0].ir_path, variants[1].ir_path);
        assert_eq!(fx.calls(), 2);
    }

    #[test]
    fn existing_output_is_trusted() {
        let fx = Fixture::new();
        let artifact = fx.source("prog.c", "int x;\n");
        let compiler = fx.compiler();
        compiler.compile_variants(&artifact).unwrap();
        compiler.compile_variants(&artifact).unwrap();
        assert_eq!(fx.calls(), 2, "second round should be all cache hits");
    }

    #[test]
    fn key_tracks_source_content() {
        let fx = Fixture::new();
        let compiler = fx.compiler();
        let flags = vec!["-O0".to_string()];
        let first = compiler
            .plan(&fx.source("prog.c", "int a;\n"), &flags)
            .unwrap();
        let again = compiler
            .plan(&fx.source("prog.c", "int a;\n"), &flags)
            .unwrap();
        let edited = compiler
            .plan(&fx.source("prog.c", "int b;\n"), &flags)
            .unwrap();
        assert_eq!(first, again);
        assert_ne!(first.key, edited.key);
    }

    #[test]
    fn compiler_failure_is_unsuccessful_variant() {
        let fx = Fixture::new();
        let artifact = fx.source("bad.c", "FAIL\n");
        let variants = fx.compiler().compile_variants(&artifact).unwrap();
        assert_eq!(variants.len(), 2);
        for v in &variants {
            assert!(!v.success);
            assert!(!v.ir_path.exists());
        }
        // No staging files left behind.
        let leftovers = fs::read_dir(fx.dir.path().join("out")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn compiler_timeout_is_unsuccessful_variant() {
        let mut fx = Fixture::new();
        fx.config.compile_timeout = Duration::from_millis(200);
        let artifact = fx.source("slow.c", "HANG\n");
        let variant = fx
            .compiler()
            .compile(&artifact, &["-O0".to_string()])
            .unwrap();
        assert!(!variant.success);
    }

    #[test]
    fn assemble_and_disassemble() {
        let fx = Fixture::new();
        let out = fx.dir.path().join("out");
        let ll = fx.dir.path().join("m.ll");
        fs::write(&ll, "; ModuleID = 'm'\n").unwrap();
        let bc = assemble(&fx.config, &fx.executor, &ll, &out).unwrap();
        assert_eq!(bc, out.join("m.bc"));
        assert!(looks_like_bitcode(&bc));
        assert_eq!(assemble(&fx.config, &fx.executor, &bc, &out).unwrap(), bc);

        let back = disassemble(&fx.config, &fx.executor, &bc).unwrap();
        assert_eq!(back, fx.dir.path().join("out/m.ll"));
        assert!(fs::read_to_string(&back).unwrap().contains("ModuleID"));

        assert!(matches!(
            assemble(&fx.config, &fx.executor, Path::new("prog.c"), &out),
            Err(CompileError::NotIr(_))
        ));
    }

    #[test]
    fn assembling_leaves_neighbouring_bitcode_alone() {
        let fx = Fixture::new();
        let ll = fx.dir.path().join("x.ll");
        let user_bc = fx.dir.path().join("x.bc");
        fs::write(&ll, "; ModuleID = 'x'\n").unwrap();
        fs::write(&user_bc, b"BC\xc0\xdeuser bitcode").unwrap();

        let scratch = fx.dir.path().join("scratch");
        let bc = assemble(&fx.config, &fx.executor, &ll, &scratch).unwrap();
        assert_eq!(bc, scratch.join("x.bc"));
        assert_eq!(fs::read(&user_bc).unwrap(), b"BC\xc0\xdeuser bitcode");
    }

    #[test]
    fn assembling_non_bitcode_is_fatal() {
        let fx = Fixture::new();
        let fake = fx.dir.path().join("fake.bc");
        fs::write(&fake, "not bitcode").unwrap();
        assert!(matches!(
            assemble(&fx.config, &fx.executor, &fake, fx.dir.path()),
            Err(CompileError::NotBitcode { .. })
        ));
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize("-O2.-I/usr/include"), "-O2.-I_usr_include");
    }
}
