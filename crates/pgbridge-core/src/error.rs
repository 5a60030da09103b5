//! Error types for the bridge.
//!
//! Two disjoint classes: [`SqlError`] is a structured error reported by the
//! guest parser itself (malformed input, ordinary and frequent), while
//! [`Fault`] means the host/guest contract or the sandbox broke. Only a
//! `Fault` terminates the operation; callers must never mistake one for a
//! syntax error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Domain error decoded from the guest's error record.
    #[error(transparent)]
    Sql(#[from] SqlError),

    /// Sandbox or ABI contract failure. Unrecoverable for this call; the
    /// instance that produced it must be discarded, never re-pooled.
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl Error {
    /// True for infrastructure failures, false for parser-reported errors.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault(_))
    }
}

/// Error reported by the guest parser, copied out of its fixed-offset
/// error record before the owning result buffer is freed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SqlError {
    /// Exception message.
    pub message: String,
    /// Source function of the exception (e.g. scanner_yyerror).
    pub funcname: String,
    /// Source file of the exception (e.g. scan.l).
    pub filename: String,
    /// Source line of the exception.
    pub lineno: i32,
    /// Character position in the input at which the exception occurred.
    pub cursorpos: i32,
    /// Additional context, empty when the guest reports none.
    pub context: String,
}

#[derive(Error, Debug)]
pub enum Fault {
    #[error("failed to compile guest module")]
    Compile(#[source] anyhow::Error),

    #[error("failed to instantiate guest module")]
    Instantiate(#[source] anyhow::Error),

    #[error("guest export `{0}` not found")]
    MissingExport(&'static str),

    #[error("guest export `{name}` called with {got} args, expects {expects}")]
    Arity {
        name: &'static str,
        expects: usize,
        got: usize,
    },

    #[error("guest call `{name}` trapped")]
    Trap {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("guest memory access rejected at {addr:#x} while {what}")]
    MemoryAccess { addr: u32, what: &'static str },

    #[error("guest allocator returned null for {0} bytes")]
    Alloc(u32),
}
