//! Error types for binary analysis.

use thiserror::Error;

/// Main error type for all analysis operations.
///
/// Errors surfaced by the lazily-initialized derivations (moduledata, line
/// table, package enumeration) are sticky: the first failure is memoized and
/// replayed to every later caller, which is why this type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The file is too short to even identify its format.
    #[error("not enough bytes read")]
    NotEnoughBytesRead,

    /// The magic bytes do not match ELF, PE or Mach-O.
    #[error("unsupported file format")]
    UnsupportedFile,

    /// No PCLNTAB could be located by symbol or pattern search.
    #[error("no pclntab located")]
    NoPclntab,

    /// No moduledata structure passed the self-consistency checks.
    #[error("no moduledata located")]
    NoModuledata,

    /// A named section is not present in the binary.
    #[error("section does not exist")]
    SectionDoesNotExist,

    /// A named symbol is not present in the symbol table.
    #[error("symbol not found")]
    SymbolNotFound,

    /// The version string does not parse as a Go release.
    #[error("invalid go version")]
    InvalidGoVersion,

    /// The compiler version could not be recovered from the binary.
    #[error("unable to determine go version")]
    UnknownGoVersion,

    /// An address or length falls outside the containing section.
    #[error("address out of bounds")]
    OutOfBounds,

    /// Structural decode failure (corrupt or hostile input).
    #[error("parse error: {0}")]
    Parse(String),

    /// No `main` package was found; required by the path classifier.
    #[error("no main package found")]
    NoMainPackage,

    /// The binary carries no DWARF sections.
    #[error("no dwarf data present")]
    NoDwarf,

    /// Underlying I/O failure. Carried as a message so the error stays
    /// cloneable for the sticky one-shot caches.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<goblin::error::Error> for Error {
    fn from(e: goblin::error::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
