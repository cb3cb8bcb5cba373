//! Neutron compiler: turns a validated AST into bytecode
//!
//! This crate owns exactly the single-pass AST-to-`Chunk` walk; lexing and
//! parsing text into the `ast` types here are out of scope and are expected
//! to live upstream of this crate.

pub mod ast;
pub mod compiler;
pub mod error;

pub use compiler::{Compiler, CompilerConfig};
pub use error::{CompileError, CompileErrorKind};
