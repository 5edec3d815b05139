//! Error kinds for the Wisp virtual machine.
//!
//! Four kinds, matching the error-handling design in spec.md §7 exactly:
//! a missing/absent compile result, an in-routine runtime failure, an
//! unrecoverable VM invariant breach, and an I/O failure at the
//! `import`/CLI boundary. No `thiserror` here — hand-written `Display`
//! in the style of the teacher's `codegen/error.rs`.

use std::fmt;

/// A runtime error raised by the interpreter or a native builtin.
///
/// Carries the source line (from the `Chunk`'s per-byte line table) so
/// the caller can print the line-numbered traceback spec.md §7 asks
/// for. Unwinds only the routine it occurred in; other routines are
/// unaffected (spec.md §5's isolation rule).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub line: u32,
    pub message: String,
}

impl RuntimeError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        RuntimeError {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// A fatal, unrecoverable VM invariant breach (temp-root stack
/// overflow, scheduler sync failure, etc). The process is expected to
/// exit; no partial recovery is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalVmError(pub String);

impl fmt::Display for FatalVmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal VM error: {}", self.0)
    }
}

impl std::error::Error for FatalVmError {}

/// Top-level error type unifying the four kinds from spec.md §7.
#[derive(Debug)]
pub enum VmError {
    /// The external compiler returned no `Function` for the given source.
    CompileError(String),
    /// An operator's or builtin's contract failed while a routine ran.
    Runtime(RuntimeError),
    /// An invariant the VM depends on to stay correct was violated.
    Fatal(FatalVmError),
    /// A file could not be read at the `import` or CLI boundary.
    Io(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::CompileError(msg) => write!(f, "compile error: {msg}"),
            VmError::Runtime(e) => write!(f, "{e}"),
            VmError::Fatal(e) => write!(f, "{e}"),
            VmError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<RuntimeError> for VmError {
    fn from(e: RuntimeError) -> Self {
        VmError::Runtime(e)
    }
}

impl From<FatalVmError> for VmError {
    fn from(e: FatalVmError) -> Self {
        VmError::Fatal(e)
    }
}

/// Process exit codes for the (out-of-scope) CLI layer, preserved here
/// since spec.md §6 defines them as part of the core's error contract.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const COMPILE_ERROR: i32 = 65;
    pub const RUNTIME_ERROR: i32 = 70;
    pub const IO_ERROR: i32 = 74;
}

/// Shorthand for a fallible interpreter/native operation.
pub type VmResult<T> = Result<T, RuntimeError>;
