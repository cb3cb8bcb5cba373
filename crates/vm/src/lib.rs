//! Neutron VM: bytecode interpreter and cooperative process scheduler
//!
//! Takes the `FunctionObj` a `neutron-compiler::Compiler` produces and
//! drives it to completion. `vm` is the single-process interpreter loop;
//! `scheduler` is the Erlang-style multi-process layer built on top of it;
//! `checkpoint` persists a process's globals across restarts.

pub mod checkpoint;
pub mod environment;
pub mod error;
pub mod native;
pub mod scheduler;
pub mod vm;

pub use environment::{CallFrame, TryHandler, FRAMES_MAX, STACK_MAX};
pub use error::{UncaughtException, VmResult, MAX_STACK_SUMMARY_FRAMES};
pub use scheduler::{
    MailboxValue, Message, Pid, ProcessBody, ProcessScheduler, ProcessState, ProcessTask, SchedulerConfig, SchedulerStats,
};
pub use vm::{RunOutcome, Vm, VmConfig};
