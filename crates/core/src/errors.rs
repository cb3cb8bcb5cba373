//! Runtime-facing error kinds
//!
//! `RuntimeError` and `StringError` are ordinary `Result` error types (see
//! DESIGN.md for why this departs from a thread-local FFI error channel).
//! They are not the same thing as a *thrown* script-level exception: the VM
//! converts one of these into a `Value::String` at the point it crosses the
//! handler-stack boundary, so user `try`/`catch` never sees a Rust type.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Arity,
    Type,
    Index,
    Key,
    DivByZero,
    UndefinedName,
    PropertyOnNonObject,
    Import,
    SendNotAllowed,
    Scheduler,
    Uncaught,
}

impl RuntimeErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            RuntimeErrorKind::Arity => "Arity",
            RuntimeErrorKind::Type => "TypeError",
            RuntimeErrorKind::Index => "Index",
            RuntimeErrorKind::Key => "Key",
            RuntimeErrorKind::DivByZero => "DivByZero",
            RuntimeErrorKind::UndefinedName => "UndefinedName",
            RuntimeErrorKind::PropertyOnNonObject => "PropertyOnNonObject",
            RuntimeErrorKind::Import => "Import",
            RuntimeErrorKind::SendNotAllowed => "SendNotAllowed",
            RuntimeErrorKind::Scheduler => "Scheduler",
            RuntimeErrorKind::Uncaught => "Uncaught",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}: {message}", kind.name())]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn arity(name: &str, expected: usize, actual: usize) -> Self {
        Self::new(
            RuntimeErrorKind::Arity,
            format!("{name} expected {expected} argument(s) but got {actual}"),
        )
    }

    pub fn type_error(what: &str, expected: &str, actual: &str) -> Self {
        Self::new(
            RuntimeErrorKind::Type,
            format!("{what}: expected {expected}, got {actual}"),
        )
    }

    pub fn undefined(name: &str) -> Self {
        Self::new(RuntimeErrorKind::UndefinedName, format!("undefined name '{name}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringErrorKind {
    IndexOutOfBounds,
    InvalidArgument,
    Encoding,
    Format,
    Slice,
    Search,
}

impl StringErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            StringErrorKind::IndexOutOfBounds => "IndexOutOfBounds",
            StringErrorKind::InvalidArgument => "InvalidArgument",
            StringErrorKind::Encoding => "Encoding",
            StringErrorKind::Format => "Format",
            StringErrorKind::Slice => "Slice",
            StringErrorKind::Search => "Search",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}: {message}", kind.name())]
pub struct StringError {
    pub kind: StringErrorKind,
    pub message: String,
}

impl StringError {
    pub fn new(kind: StringErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// StringErrors are handled exactly like RuntimeErrors: fold them into the
// same thrown-value path rather than threading a second error type through
// the VM's dispatch loop.
impl From<StringError> for RuntimeError {
    fn from(e: StringError) -> Self {
        RuntimeError::new(RuntimeErrorKind::Type, format!("{}: {}", e.kind.name(), e.message))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("checkpoint error: {0}")]
pub struct CheckpointError(pub String);
