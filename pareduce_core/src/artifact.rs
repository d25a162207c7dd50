use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const C_SUFFIXES: &[&str] = &["c"];
// GCC torture tests use `.C` for C++.
const CXX_SUFFIXES: &[&str] = &["cpp", "C"];
const TEXT_IR_SUFFIXES: &[&str] = &["ll"];
const BINARY_IR_SUFFIXES: &[&str] = &["bc"];

const BITCODE_MAGIC: &[u8; 2] = b"BC";

/// The kind of a candidate program, decided purely from its file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    CSource,
    CxxSource,
    TextIr,
    BinaryIr,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if C_SUFFIXES.contains(&ext) {
            Some(ArtifactKind::CSource)
        } else if CXX_SUFFIXES.contains(&ext) {
            Some(ArtifactKind::CxxSource)
        } else if TEXT_IR_SUFFIXES.contains(&ext) {
            Some(ArtifactKind::TextIr)
        } else if BINARY_IR_SUFFIXES.contains(&ext) {
            Some(ArtifactKind::BinaryIr)
        } else {
            None
        }
    }

    pub fn is_source(self) -> bool {
        matches!(self, ArtifactKind::CSource | ArtifactKind::CxxSource)
    }

    pub fn is_ir(self) -> bool {
        matches!(self, ArtifactKind::TextIr | ArtifactKind::BinaryIr)
    }
}

/// A candidate program under evaluation. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    path: PathBuf,
    kind: ArtifactKind,
}

impl Artifact {
    /// Returns `None` when the suffix is not one of the recognized program kinds.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = ArtifactKind::from_path(&path)?;
        Some(Self { path, kind })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn is_source(&self) -> bool {
        self.kind.is_source()
    }

    pub fn is_ir(&self) -> bool {
        self.kind.is_ir()
    }

    /// File name used in log lines and derived output names.
    pub fn name(&self) -> String {
        file_name_lossy(&self.path)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

pub fn is_c(path: &Path) -> bool {
    ArtifactKind::from_path(path) == Some(ArtifactKind::CSource)
}

pub fn is_cxx(path: &Path) -> bool {
    ArtifactKind::from_path(path) == Some(ArtifactKind::CxxSource)
}

pub fn is_source(path: &Path) -> bool {
    ArtifactKind::from_path(path).is_some_and(ArtifactKind::is_source)
}

pub fn is_ir(path: &Path) -> bool {
    ArtifactKind::from_path(path).is_some_and(ArtifactKind::is_ir)
}

pub fn is_program(path: &Path) -> bool {
    ArtifactKind::from_path(path).is_some()
}

/// Quick check that `path` starts with the bitcode magic.
///
/// This does not validate that the module is well-formed; it only tells a
/// bitcode file apart from textual IR or a truncated/empty output.
pub fn looks_like_bitcode(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic == BITCODE_MAGIC,
        Err(_) => false,
    }
}

pub(crate) fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn classifies_by_suffix() {
        assert_eq!(
            ArtifactKind::from_path(Path::new("a/b/test.c")),
            Some(ArtifactKind::CSource)
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("pr123.C")),
            Some(ArtifactKind::CxxSource)
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("x.cpp")),
            Some(ArtifactKind::CxxSource)
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("m.ll")),
            Some(ArtifactKind::TextIr)
        );
        assert_eq!(
            ArtifactKind::from_path(Path::new("m.bc")),
            Some(ArtifactKind::BinaryIr)
        );
        assert_eq!(ArtifactKind::from_path(Path::new("README.md")), None);
        assert_eq!(ArtifactKind::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn predicates_agree_with_kind() {
        assert!(is_c(Path::new("t.c")));
        assert!(!is_c(Path::new("t.C")));
        assert!(is_cxx(Path::new("t.C")));
        assert!(is_source(Path::new("t.cpp")));
        assert!(!is_source(Path::new("t.ll")));
        assert!(is_ir(Path::new("t.ll")));
        assert!(is_ir(Path::new("t.bc")));
        assert!(is_program(Path::new("t.c")));
        assert!(!is_program(Path::new("t.h")));
    }

    #[test]
    fn artifact_rejects_unknown_suffix() {
        assert!(Artifact::from_path("notes.txt").is_none());
        let a = Artifact::from_path("dir/prog.c").unwrap();
        assert_eq!(a.kind(), ArtifactKind::CSource);
        assert_eq!(a.name(), "prog.c");
        assert!(a.is_source());
        assert!(!a.is_ir());
    }

    #[test]
    fn bitcode_magic_heuristic() {
        let dir = tempdir().unwrap();
        let bc = dir.path().join("m.bc");
        let ll = dir.path().join("m.ll");
        let empty = dir.path().join("empty.bc");
        fs::write(&bc, b"BC\xC0\xDE rest").unwrap();
        fs::write(&ll, b"; ModuleID = 'm'\n").unwrap();
        fs::write(&empty, b"").unwrap();

        assert!(looks_like_bitcode(&bc));
        assert!(!looks_like_bitcode(&ll));
        assert!(!looks_like_bitcode(&empty));
        assert!(!looks_like_bitcode(&dir.path().join("missing.bc")));
    }
}
