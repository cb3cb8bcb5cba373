//! Compile-time diagnostics

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    DuplicateLocal,
    TooManyLocals,
    TooManyUpvalues,
    TooManyConstants,
    UnresolvedBreak,
    UnresolvedContinue,
    ReturnFromTopLevel,
    ThisOutsideMethod,
    InvalidAssignmentTarget,
    UnsafeOperationInSafeBlock,
}

impl CompileErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            CompileErrorKind::DuplicateLocal => "DuplicateLocal",
            CompileErrorKind::TooManyLocals => "TooManyLocals",
            CompileErrorKind::TooManyUpvalues => "TooManyUpvalues",
            CompileErrorKind::TooManyConstants => "TooManyConstants",
            CompileErrorKind::UnresolvedBreak => "UnresolvedBreak",
            CompileErrorKind::UnresolvedContinue => "UnresolvedContinue",
            CompileErrorKind::ReturnFromTopLevel => "ReturnFromTopLevel",
            CompileErrorKind::ThisOutsideMethod => "ThisOutsideMethod",
            CompileErrorKind::InvalidAssignmentTarget => "InvalidAssignmentTarget",
            CompileErrorKind::UnsafeOperationInSafeBlock => "UnsafeOperationInSafeBlock",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}: {message} (line {line})", kind.name())]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub line: u32,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, line: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
        }
    }
}
