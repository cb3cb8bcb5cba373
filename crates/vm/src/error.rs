//! VM-facing error wrapping
//!
//! The VM itself only ever produces `RuntimeError`s (compile errors are a
//! `neutron-compiler` concern, surfaced before a `Vm` exists at all); this
//! module exists to carry the extra context — a truncated call-stack
//! summary — that a bare `RuntimeError` doesn't have room for.

use neutron_core::{RuntimeError, RuntimeErrorKind};

/// How many frames an uncaught exception's summary keeps, innermost first.
/// Deep recursion blowing past this just means the summary is truncated, not
/// that the error is lost.
pub const MAX_STACK_SUMMARY_FRAMES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{inner}\n{}", format_frames(.frames))]
pub struct UncaughtException {
    pub inner: RuntimeError,
    pub frames: Vec<String>,
}

fn format_frames(frames: &[String]) -> String {
    let mut out = String::new();
    for (i, frame) in frames.iter().take(MAX_STACK_SUMMARY_FRAMES).enumerate() {
        out.push_str(&format!("  #{i} {frame}\n"));
    }
    if frames.len() > MAX_STACK_SUMMARY_FRAMES {
        out.push_str(&format!("  ... {} more frame(s)\n", frames.len() - MAX_STACK_SUMMARY_FRAMES));
    }
    out
}

impl UncaughtException {
    pub fn new(inner: RuntimeError, frames: Vec<String>) -> Self {
        Self { inner, frames }
    }
}

pub type VmResult<T> = Result<T, RuntimeError>;

pub(crate) fn stack_overflow() -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::Scheduler, "stack overflow: call frames exceeded the configured limit")
}
