//! Call-frame bookkeeping
//!
//! One `CallFrame` per active function invocation, tracking where its code
//! lives, its instruction pointer, and where its locals start on the shared
//! value stack. Mirrors clox's `CallFrame` (`include/vm.h` territory in the
//! original C++ project) rather than allocating a Rust stack frame per call.

use neutron_core::{HeapId, Value};

/// Matches `original_source`'s `FRAMES_MAX`; deep native recursion in a
/// script hits this before it hits the host stack.
pub const FRAMES_MAX: usize = 256;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: HeapId,
    pub ip: usize,
    pub stack_base: usize,
    /// Set when this frame is a class `init` method invoked through
    /// instantiation: the constructed instance, not whatever `init` itself
    /// returns, is what ends up on the stack when the frame pops.
    pub return_override: Option<Value>,
}

impl CallFrame {
    pub fn new(closure: HeapId, stack_base: usize) -> Self {
        Self { closure, ip: 0, stack_base, return_override: None }
    }
}

/// A still-unwinding `try` block: where to resume (`catch_ip`), and how far
/// to rewind the stack/frame depth so the catch body starts clean.
#[derive(Debug, Clone)]
pub struct TryHandler {
    pub catch_ip: usize,
    pub frame_depth: usize,
    pub stack_depth: usize,
}
