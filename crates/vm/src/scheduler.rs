//! Cooperative process scheduler
//!
//! Erlang-style lightweight processes: each `Process` owns its own `Vm`
//! (and therefore its own `Heap` — no shared mutable state between
//! processes), is scheduled in reduction-budgeted time slices, and
//! communicates only by message passing through a mailbox. Because a `Vm`
//! is not `Send` (its interned strings are `Rc`-shared), a process's `Vm`
//! can never hop between OS threads mid-run; instead each process gets its
//! own dedicated thread for its whole lifetime, and concurrency is bounded
//! by a permit pool sized to `SchedulerConfig::workers` — a process can only
//! run a slice while holding a permit, so at most `workers` processes
//! execute bytecode at once no matter how many are spawned. See DESIGN.md
//! for why this replaced an earlier shared-worker-pool sketch.

use neutron_compiler::ast::Stmt;
use neutron_core::{
    Chunk, FunctionObj, HeapObject, NativeContext, NativeFnObj, ObjString, RuntimeError, RuntimeErrorKind,
    StringInterner, Value,
};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::vm::{RunOutcome, Vm, VmConfig};

pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Waiting,
    Finished,
    Dead,
}

/// A value that has been structurally copied out of the sending process's
/// heap so it can cross into a different `Heap` without a dangling
/// `HeapId`. Only data values cross process boundaries; anything carrying
/// behavior (closures, classes, instances, bound methods) is rejected at
/// `send` time with `RuntimeErrorKind::SendNotAllowed`.
#[derive(Debug, Clone)]
pub enum MailboxValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<MailboxValue>),
    Map(Vec<(String, MailboxValue)>),
}

impl MailboxValue {
    /// Deep-copies `value` out of `heap`, failing if it (transitively)
    /// contains anything that can't be represented as plain data.
    pub fn capture(value: &Value, heap: &neutron_core::Heap) -> Result<MailboxValue, RuntimeError> {
        match value {
            Value::Nil => Ok(MailboxValue::Nil),
            Value::Bool(b) => Ok(MailboxValue::Bool(*b)),
            Value::Number(n) => Ok(MailboxValue::Number(*n)),
            Value::String(s) => Ok(MailboxValue::String(s.as_str().to_string())),
            Value::Array(id) => match heap.get(*id) {
                HeapObject::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(MailboxValue::capture(item, heap)?);
                    }
                    Ok(MailboxValue::Array(out))
                }
                _ => unreachable!(),
            },
            Value::Map(id) => match heap.get(*id) {
                HeapObject::Map(map) => {
                    let mut out = Vec::with_capacity(map.entries.len());
                    for (k, v) in &map.entries {
                        out.push((k.as_str().to_string(), MailboxValue::capture(v, heap)?));
                    }
                    Ok(MailboxValue::Map(out))
                }
                _ => unreachable!(),
            },
            other => Err(RuntimeError::new(
                RuntimeErrorKind::SendNotAllowed,
                format!("cannot send a {} between processes: only plain data crosses mailboxes", other.type_name()),
            )),
        }
    }

    /// Materializes this value into the receiving process's heap/interner.
    /// Takes a `NativeContext` rather than a concrete `Vm` so it can be
    /// called from inside a native (`receive`) as well as from checkpoint
    /// restore.
    pub fn materialize(&self, ctx: &mut dyn NativeContext) -> Value {
        match self {
            MailboxValue::Nil => Value::Nil,
            MailboxValue::Bool(b) => Value::Bool(*b),
            MailboxValue::Number(n) => Value::Number(*n),
            MailboxValue::String(s) => Value::String(ctx.interner().intern(s)),
            MailboxValue::Array(items) => {
                let materialized: Vec<Value> = items.iter().map(|v| v.materialize(ctx)).collect();
                Value::Array(ctx.heap_mut().alloc(HeapObject::Array(materialized)))
            }
            MailboxValue::Map(entries) => {
                let interned: Vec<(Rc<ObjString>, Value)> =
                    entries.iter().map(|(k, v)| (ctx.interner().intern(k), v.materialize(ctx))).collect();
                Value::Map(ctx.heap_mut().alloc(HeapObject::Map(neutron_core::MapObj { entries: interned })))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub from: Pid,
    pub data: MailboxValue,
}

/// FIFO mailbox shared between the sender (any process/thread) and the
/// owning process's worker. `send` never blocks; `receive` blocks the
/// calling thread (not the whole scheduler) until a message arrives or
/// `timeout` elapses.
#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl Mailbox {
    fn push(&self, msg: Message) {
        self.queue.lock().expect("mailbox poisoned").push_back(msg);
        self.arrived.notify_one();
    }

    fn pop(&self, timeout: Option<Duration>) -> Option<Message> {
        let mut queue = self.queue.lock().expect("mailbox poisoned");
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            match timeout {
                Some(d) => {
                    let (guard, result) = self.arrived.wait_timeout(queue, d).expect("mailbox poisoned");
                    queue = guard;
                    if result.timed_out() && queue.is_empty() {
                        return None;
                    }
                }
                None => {
                    queue = self.arrived.wait(queue).expect("mailbox poisoned");
                }
            }
        }
    }
}

struct ProcessEntry {
    state: Mutex<ProcessState>,
    mailbox: Mailbox,
}

/// A function lifted out of its originating `Heap` so it can be handed to a
/// brand-new process's `Vm`. Only a closure with no captured upvalues can
/// cross this way — captured state lives in cells owned by the spawning
/// heap and can't follow; nested function/class definitions stored as
/// constants are walked the same way `MailboxValue::capture` walks arrays
/// and maps, with `Value::Class` rejected since class migration isn't
/// supported by this revision.
#[derive(Debug, Clone)]
pub struct PortableFunction {
    name: Option<String>,
    arity: usize,
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<PortableConstant>,
}

#[derive(Debug, Clone)]
enum PortableConstant {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Function(PortableFunction),
}

impl PortableFunction {
    pub fn capture(value: &Value, heap: &neutron_core::Heap) -> Result<PortableFunction, RuntimeError> {
        match value {
            Value::Closure(id) => match heap.get(*id) {
                HeapObject::Closure(c) => {
                    if !c.upvalues.is_empty() {
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::SendNotAllowed,
                            "spawn: a closure that captures variables can't cross into a new process",
                        ));
                    }
                    Self::capture_function(c.function, heap)
                }
                _ => unreachable!(),
            },
            Value::Function(id) => Self::capture_function(*id, heap),
            other => Err(RuntimeError::type_error("spawn", "function", other.type_name())),
        }
    }

    fn capture_function(id: neutron_core::HeapId, heap: &neutron_core::Heap) -> Result<PortableFunction, RuntimeError> {
        match heap.get(id) {
            HeapObject::Function(f) => {
                let constants = f
                    .chunk
                    .constants
                    .iter()
                    .map(|v| Self::capture_constant(v, heap))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PortableFunction {
                    name: f.name.as_ref().map(|n| n.as_str().to_string()),
                    arity: f.arity,
                    code: f.chunk.code.clone(),
                    lines: f.chunk.lines.clone(),
                    constants,
                })
            }
            _ => unreachable!(),
        }
    }

    fn capture_constant(value: &Value, heap: &neutron_core::Heap) -> Result<PortableConstant, RuntimeError> {
        match value {
            Value::Nil => Ok(PortableConstant::Nil),
            Value::Bool(b) => Ok(PortableConstant::Bool(*b)),
            Value::Number(n) => Ok(PortableConstant::Number(*n)),
            Value::String(s) => Ok(PortableConstant::String(s.as_str().to_string())),
            Value::Function(id) => Ok(PortableConstant::Function(Self::capture_function(*id, heap)?)),
            other => Err(RuntimeError::new(
                RuntimeErrorKind::SendNotAllowed,
                format!("spawn: a function referencing a {} constant can't cross into a new process", other.type_name()),
            )),
        }
    }

    /// Materializes this function (and its nested function constants) into
    /// `heap`/`interner`, ready for `Vm::load`.
    fn materialize(&self, heap: &mut neutron_core::Heap, interner: &StringInterner) -> FunctionObj {
        let constants = self.constants.iter().map(|c| c.materialize(heap, interner)).collect();
        FunctionObj {
            name: self.name.as_ref().map(|n| interner.intern(n)),
            arity: self.arity,
            chunk: Chunk { code: self.code.clone(), constants, lines: self.lines.clone() },
            upvalue_count: 0,
        }
    }
}

impl PortableConstant {
    fn materialize(&self, heap: &mut neutron_core::Heap, interner: &StringInterner) -> Value {
        match self {
            PortableConstant::Nil => Value::Nil,
            PortableConstant::Bool(b) => Value::Bool(*b),
            PortableConstant::Number(n) => Value::Number(*n),
            PortableConstant::String(s) => Value::String(interner.intern(s)),
            PortableConstant::Function(f) => {
                let materialized = f.materialize(heap, interner);
                Value::Function(heap.alloc(HeapObject::Function(materialized)))
            }
        }
    }
}

/// A unit of scheduled work: either a source-level body (compiled fresh on
/// the new process's own `Vm`) or a function lifted out of another
/// process's heap via `spawn`.
pub enum ProcessBody {
    Source(Vec<Stmt>),
    Portable(PortableFunction),
}

pub struct ProcessTask {
    pub body: ProcessBody,
    pub args: Vec<MailboxValue>,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub processes_spawned: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub context_switches: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub reductions_per_slice: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: std::env::var("NEUTRON_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
            reductions_per_slice: std::env::var("NEUTRON_REDUCTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(2000),
        }
    }
}

/// A counting permit pool bounding how many processes may be executing
/// bytecode at once. A process's thread blocks in `acquire` until a permit
/// is free, runs one reduction-budgeted slice, then `release`s it — this is
/// the "small worker-thread pool" the rest of this module's docs refer to,
/// realized as a gate rather than as threads that processes hop between
/// (which `Vm`'s non-`Send`-ness rules out).
struct PermitGate {
    available: Mutex<usize>,
    released: Condvar,
}

impl PermitGate {
    fn new(n: usize) -> Self {
        Self { available: Mutex::new(n.max(1)), released: Condvar::new() }
    }

    /// Blocks until a permit is free or the scheduler is shutting down.
    /// Returns `false` only in the shutdown case.
    fn acquire(&self, shutdown: &Mutex<bool>) -> bool {
        let mut avail = self.available.lock().expect("permit gate poisoned");
        loop {
            if *shutdown.lock().expect("shutdown mutex poisoned") {
                return false;
            }
            if *avail > 0 {
                *avail -= 1;
                return true;
            }
            avail = self.released.wait(avail).expect("permit gate poisoned");
        }
    }

    fn release(&self) {
        *self.available.lock().expect("permit gate poisoned") += 1;
        self.released.notify_one();
    }
}

/// The `Arc`-shared half of a `ProcessScheduler`: everything a process's own
/// thread (or a native running inside that process) needs to register new
/// processes, deliver/await messages, and query liveness, without needing a
/// `&mut ProcessScheduler` that only the thread holding the scheduler owns.
#[derive(Clone)]
pub struct SchedulerHandle {
    processes: Arc<Mutex<HashMap<Pid, Arc<ProcessEntry>>>>,
    next_pid: Arc<AtomicU64>,
    stats: Arc<SchedulerStats>,
    permits: Arc<PermitGate>,
    shutdown: Arc<Mutex<bool>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    reductions_per_slice: u64,
}

impl SchedulerHandle {
    fn reserve_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.processes.lock().expect("process table poisoned").insert(
            pid,
            Arc::new(ProcessEntry { state: Mutex::new(ProcessState::Ready), mailbox: Mailbox::default() }),
        );
        self.stats.processes_spawned.fetch_add(1, Ordering::Relaxed);
        pid
    }

    fn mark_dead(&self, pid: Pid) {
        if let Some(entry) = self.processes.lock().expect("process table poisoned").get(&pid) {
            *entry.state.lock().expect("state poisoned") = ProcessState::Dead;
        }
    }

    fn launch(&self, pid: Pid, task: ProcessTask) {
        let Some(entry) = self.processes.lock().expect("process table poisoned").get(&pid).cloned() else {
            return;
        };
        let handle = self.clone();
        let built = std::thread::Builder::new()
            .name(format!("neutron-process-{pid}"))
            .spawn(move || process_thread(pid, entry, task, handle))
            .expect("failed to spawn process thread");
        self.threads.lock().expect("thread list poisoned").push(built);
    }

    /// Registers and launches `task` as a brand-new process, returning its
    /// `Pid` immediately (the process runs concurrently from here on).
    pub fn spawn_child(&self, task: ProcessTask) -> Pid {
        let pid = self.reserve_pid();
        self.launch(pid, task);
        pid
    }

    fn shutdown_all(&self) {
        *self.shutdown.lock().expect("shutdown mutex poisoned") = true;
        self.permits.released.notify_all();
        let mut threads = self.threads.lock().expect("thread list poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        match self.processes.lock().expect("process table poisoned").get(&pid) {
            Some(entry) => !matches!(*entry.state.lock().expect("state poisoned"), ProcessState::Dead | ProcessState::Finished),
            None => false,
        }
    }

    pub fn kill(&self, pid: Pid) {
        self.mark_dead(pid);
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().expect("process table poisoned").len()
    }

    /// Delivers `data` (already deep-copied out of the sender's heap) to
    /// `to`'s mailbox. Returns `false` if `to` doesn't exist or is dead.
    pub fn send(&self, to: Pid, from: Pid, data: MailboxValue) -> bool {
        let processes = self.processes.lock().expect("process table poisoned");
        match processes.get(&to) {
            Some(entry) => {
                entry.mailbox.push(Message { from, data });
                self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                warn!(to, "send to unknown pid dropped");
                false
            }
        }
    }

    /// Blocks the calling thread until a message arrives or `timeout`
    /// elapses. Releases this process's run permit for the duration so a
    /// process waiting on `receive` doesn't starve the others.
    pub fn receive(&self, pid: Pid, timeout: Option<Duration>) -> Option<Message> {
        let entry = self.processes.lock().expect("process table poisoned").get(&pid).cloned()?;
        self.permits.release();
        let msg = entry.mailbox.pop(timeout);
        self.permits.acquire(&self.shutdown);
        msg
    }

    /// Blocks the calling thread for `duration`, releasing this process's
    /// run permit for the duration so other processes can make progress.
    pub fn sleep(&self, duration: Duration) {
        self.permits.release();
        std::thread::sleep(duration);
        self.permits.acquire(&self.shutdown);
    }
}

/// Owns the scheduler's shared state and the handle into it. Cloning the
/// handle (`handle()`) is how natives reach back into the scheduler that's
/// running them.
pub struct ProcessScheduler {
    handle: SchedulerHandle,
    spawn_fn: Option<Arc<dyn Fn(Pid) -> Option<ProcessTask> + Send + Sync>>,
    config: SchedulerConfig,
}

impl ProcessScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let handle = SchedulerHandle {
            processes: Arc::new(Mutex::new(HashMap::new())),
            next_pid: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(SchedulerStats::default()),
            permits: Arc::new(PermitGate::new(config.workers)),
            shutdown: Arc::new(Mutex::new(false)),
            threads: Arc::new(Mutex::new(Vec::new())),
            reductions_per_slice: config.reductions_per_slice,
        };
        Self { handle, spawn_fn: None, config }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.handle.stats
    }

    /// Registers the function used to dispatch a process's body the first
    /// time it's spawned through `spawn()` (the CLI demo path; script-level
    /// `spawn(callable, args...)` bypasses this entirely and calls
    /// `SchedulerHandle::spawn_child` directly with a `Portable` body).
    pub fn start(&mut self, spawn_fn: impl Fn(Pid) -> Option<ProcessTask> + Send + Sync + 'static) {
        info!(workers = self.config.workers, "starting process scheduler");
        self.spawn_fn = Some(Arc::new(spawn_fn));
    }

    pub fn stop(&mut self) {
        self.handle.shutdown_all();
    }

    /// Registers a new process and dispatches it immediately via the
    /// `spawn_fn` passed to `start`.
    pub fn spawn(&self) -> Pid {
        let pid = self.handle.reserve_pid();
        match self.spawn_fn.as_ref().and_then(|f| f(pid)) {
            Some(task) => self.handle.launch(pid, task),
            None => self.handle.mark_dead(pid),
        }
        pid
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.handle.is_alive(pid)
    }

    pub fn kill(&self, pid: Pid) {
        self.handle.kill(pid)
    }

    pub fn process_count(&self) -> usize {
        self.handle.process_count()
    }

    pub fn send(&self, to: Pid, from: Pid, data: MailboxValue) -> bool {
        self.handle.send(to, from, data)
    }

    pub fn receive(&self, pid: Pid, timeout: Option<Duration>) -> Option<Message> {
        self.handle.receive(pid, timeout)
    }
}

/// Every native this module contributes to a process's `Vm` beyond the
/// core builtins: the scheduler operations a script can reach. Each closure
/// captures this process's own `pid` and a clone of the `SchedulerHandle`
/// it's running under, so none of it needs a core `NativeContext` extension.
pub fn scheduler_builtins(interner: &StringInterner, handle: SchedulerHandle, pid: Pid) -> Vec<(Rc<ObjString>, Value)> {
    fn def(
        interner: &StringInterner,
        name: &str,
        arity: Option<usize>,
        func: impl Fn(&mut dyn NativeContext, &[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> (Rc<ObjString>, Value) {
        let name_rc = interner.intern(name);
        (name_rc.clone(), Value::NativeFn(Rc::new(NativeFnObj { name: name_rc, arity, func: Rc::new(func) })))
    }

    vec![
        def(interner, "spawn", None, {
            let handle = handle.clone();
            move |ctx, args| {
                let Some(callable) = args.first() else {
                    return Err(RuntimeError::new(RuntimeErrorKind::Arity, "spawn expects a callable followed by its arguments"));
                };
                let portable = PortableFunction::capture(callable, ctx.heap_mut())?;
                let mut task_args = Vec::with_capacity(args.len().saturating_sub(1));
                for a in &args[1..] {
                    task_args.push(MailboxValue::capture(a, ctx.heap_mut())?);
                }
                let child = handle.spawn_child(ProcessTask { body: ProcessBody::Portable(portable), args: task_args });
                Ok(Value::Number(child as f64))
            }
        }),
        def(interner, "send", Some(2), {
            let handle = handle.clone();
            move |ctx, args| {
                let to = match &args[0] {
                    Value::Number(n) => *n as Pid,
                    other => return Err(RuntimeError::type_error("send", "number (pid)", other.type_name())),
                };
                let payload = MailboxValue::capture(&args[1], ctx.heap_mut())?;
                Ok(Value::Bool(handle.send(to, pid, payload)))
            }
        }),
        def(interner, "receive", None, {
            let handle = handle.clone();
            move |ctx, args| {
                let timeout = match args.first() {
                    None | Some(Value::Nil) => None,
                    Some(Value::Number(ms)) => Some(Duration::from_millis((*ms).max(0.0) as u64)),
                    Some(other) => return Err(RuntimeError::type_error("receive", "number or nil", other.type_name())),
                };
                match handle.receive(pid, timeout) {
                    Some(msg) => {
                        let data = msg.data.materialize(ctx);
                        let entries = vec![(ctx.interner().intern("from"), Value::Number(msg.from as f64)), (ctx.interner().intern("data"), data)];
                        Ok(Value::Map(ctx.heap_mut().alloc(HeapObject::Map(neutron_core::MapObj { entries }))))
                    }
                    None => Ok(Value::Nil),
                }
            }
        }),
        def(interner, "self", Some(0), move |_ctx, _args| Ok(Value::Number(pid as f64))),
        def(interner, "is_alive", Some(1), {
            let handle = handle.clone();
            move |_ctx, args| {
                let target = match &args[0] {
                    Value::Number(n) => *n as Pid,
                    other => return Err(RuntimeError::type_error("is_alive", "number (pid)", other.type_name())),
                };
                Ok(Value::Bool(handle.is_alive(target)))
            }
        }),
        def(interner, "kill", Some(1), {
            let handle = handle.clone();
            move |_ctx, args| {
                let target = match &args[0] {
                    Value::Number(n) => *n as Pid,
                    other => return Err(RuntimeError::type_error("kill", "number (pid)", other.type_name())),
                };
                handle.kill(target);
                Ok(Value::Nil)
            }
        }),
        def(interner, "process_count", Some(0), {
            let handle = handle.clone();
            move |_ctx, _args| Ok(Value::Number(handle.process_count() as f64))
        }),
        def(interner, "sleep", Some(1), {
            let handle = handle.clone();
            move |_ctx, args| {
                let ms = match &args[0] {
                    Value::Number(n) => n.max(0.0),
                    other => return Err(RuntimeError::type_error("sleep", "number (milliseconds)", other.type_name())),
                };
                handle.sleep(Duration::from_millis(ms as u64));
                Ok(Value::Nil)
            }
        }),
    ]
}

/// Runs one process's body on its own dedicated OS thread for its whole
/// lifetime, gated into reduction-budgeted slices by `handle`'s permit pool
/// so that at most `workers` processes are executing bytecode at any
/// instant. A process that exhausts its slice's budget re-loops rather than
/// finishing, giving its permit back so another ready process gets a turn —
/// this is the actual preemption point; nothing about the `Vm`'s state is
/// snapshotted or restored because it was never taken out of `self` to
/// begin with.
fn process_thread(pid: Pid, entry: Arc<ProcessEntry>, task: ProcessTask, handle: SchedulerHandle) {
    let interner = StringInterner::new();
    let mut vm = Vm::new(interner, VmConfig::default());

    let function = match task.body {
        ProcessBody::Source(stmts) => {
            let (heap, interner_ref) = vm.heap_and_interner_mut();
            let compiler = neutron_compiler::Compiler::new(heap, interner_ref, neutron_compiler::CompilerConfig::default());
            match compiler.compile_program(&stmts) {
                Ok(f) => f,
                Err(e) => {
                    warn!(pid, error = %e, "process body failed to compile");
                    *entry.state.lock().expect("state poisoned") = ProcessState::Dead;
                    return;
                }
            }
        }
        ProcessBody::Portable(pf) => {
            let (heap, interner_ref) = vm.heap_and_interner_mut();
            pf.materialize(heap, interner_ref)
        }
    };

    let natives = scheduler_builtins(vm.interner(), handle.clone(), pid);
    for (name, value) in natives {
        vm.define_global(name.as_str(), value);
    }

    let args: Vec<Value> = task.args.iter().map(|a| a.materialize(&mut vm)).collect();
    if let Err(e) = vm.load(function, args) {
        warn!(pid, error = %e, "process arguments didn't match its function's arity");
        *entry.state.lock().expect("state poisoned") = ProcessState::Dead;
        return;
    }

    loop {
        if matches!(*entry.state.lock().expect("state poisoned"), ProcessState::Dead) {
            return;
        }
        if !handle.permits.acquire(&handle.shutdown) {
            *entry.state.lock().expect("state poisoned") = ProcessState::Dead;
            return;
        }
        if matches!(*entry.state.lock().expect("state poisoned"), ProcessState::Dead) {
            handle.permits.release();
            return;
        }
        *entry.state.lock().expect("state poisoned") = ProcessState::Running;
        handle.stats.context_switches.fetch_add(1, Ordering::Relaxed);

        let outcome = vm.run_budgeted(handle.reductions_per_slice);
        handle.permits.release();

        match outcome {
            Ok(RunOutcome::Completed(_)) => {
                *entry.state.lock().expect("state poisoned") = ProcessState::Finished;
                return;
            }
            Ok(RunOutcome::Yielded) => {
                *entry.state.lock().expect("state poisoned") = ProcessState::Ready;
                std::thread::yield_now();
            }
            Err(e) => {
                warn!(pid, error = %e, "process terminated with an uncaught exception");
                *entry.state.lock().expect("state poisoned") = ProcessState::Dead;
                return;
            }
        }
    }
}
