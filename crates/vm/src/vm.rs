//! Stack-based bytecode interpreter
//!
//! One `Vm` owns one `Heap` and drives one chunk of bytecode at a time via
//! the classic fetch-decode-dispatch loop (mirrors `original_source`'s
//! `src/core/vm.cpp`, generalized from that project's smaller opcode set to
//! the one `neutron-core::OpCode` defines). A `Vm` is the unit a scheduled
//! `Process` owns exclusively — nothing here is `Send`/`Sync`, which is
//! deliberate: cross-process communication goes through deep-copied
//! messages (`neutron_vm::scheduler`), never a shared heap.

use crate::environment::{CallFrame, TryHandler, FRAMES_MAX, STACK_MAX};
use crate::error::{stack_overflow, VmResult};
use neutron_core::{
    BoundMethodObj, ClosureObj, FunctionObj, Heap, HeapId, HeapObject, InstanceObj, MapObj, NativeContext, OpCode,
    ObjString, RuntimeError, RuntimeErrorKind, StringInterner, TypeTag, Value,
};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Allocations between collections. `original_source`'s collector uses a
    /// growth-factor heuristic; this VM uses a flat threshold for simplicity
    /// (see DESIGN.md).
    pub gc_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { gc_threshold: 1024 }
    }
}

/// What a budgeted run produced: either the call completed (with its return
/// value) or the reduction budget ran out first, leaving the `Vm`'s stack
/// and frames exactly as they were mid-call for a later `run_budgeted` to
/// pick back up.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Value),
    Yielded,
}

pub struct Vm {
    heap: Heap,
    interner: StringInterner,
    globals: HashMap<Rc<ObjString>, Value>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<HeapId>,
    handlers: Vec<TryHandler>,
    config: VmConfig,
}

impl Vm {
    pub fn new(interner: StringInterner, config: VmConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            interner,
            globals: HashMap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            config,
        };
        for (name, value) in crate::native::builtins(&vm.interner) {
            vm.globals.insert(name, value);
        }
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn interner(&self) -> &StringInterner {
        &self.interner
    }

    /// Split borrow for callers (namely the compiler, which needs both at
    /// once) that `heap()`/`interner()` alone can't satisfy.
    pub fn heap_and_interner_mut(&mut self) -> (&mut Heap, &StringInterner) {
        (&mut self.heap, &self.interner)
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.insert(self.interner.intern(name), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(&self.interner.intern(name)).cloned()
    }

    /// Snapshot of every current global binding, name-keyed. Used by
    /// checkpointing, which needs to iterate without holding a live borrow
    /// into `self.globals` while it deep-copies heap-resident values.
    pub fn globals_snapshot(&self) -> Vec<(String, Value)> {
        self.globals.iter().map(|(k, v)| (k.as_str().to_string(), v.clone())).collect()
    }

    /// Run a freshly-compiled top-level function to completion, returning
    /// whatever its implicit final `return nil;` (or an explicit `return`)
    /// produced.
    pub fn interpret(&mut self, function: FunctionObj) -> VmResult<Value> {
        self.load(function, Vec::new())?;
        match self.run_until(0, None)? {
            RunOutcome::Completed(v) => Ok(v),
            RunOutcome::Yielded => unreachable!("a run with no reduction budget never yields"),
        }
    }

    /// Pushes `function` as a fresh top-level call (closure plus `args`) onto
    /// this `Vm`'s otherwise-empty stack, without running it. Paired with
    /// `run_budgeted`, this lets a scheduled process's slice be driven one
    /// reduction-budget chunk at a time instead of to completion in one call.
    pub fn load(&mut self, function: FunctionObj, args: Vec<Value>) -> VmResult<()> {
        let arity = function.arity;
        if arity != args.len() {
            let name = function.name.as_ref().map(|s| s.as_str().to_string()).unwrap_or_else(|| "<anonymous>".to_string());
            return Err(RuntimeError::arity(&name, arity, args.len()));
        }
        let function_id = self.heap.alloc(HeapObject::Function(function));
        let closure_id = self.heap.alloc(HeapObject::Closure(ClosureObj {
            function: function_id,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Closure(closure_id));
        self.stack.extend(args);
        self.frames.push(CallFrame::new(closure_id, 0));
        Ok(())
    }

    /// Runs at most `reductions` opcodes of whatever call `load` set up (or a
    /// previous `run_budgeted` left parked), returning `Yielded` if the
    /// budget ran out before the call returned.
    pub fn run_budgeted(&mut self, reductions: u64) -> VmResult<RunOutcome> {
        self.run_until(0, Some(reductions))
    }

    // ---- bytecode access helpers ----

    fn closure_function(&self, closure_id: HeapId) -> HeapId {
        match self.heap.get(closure_id) {
            HeapObject::Closure(c) => c.function,
            _ => unreachable!("frame closure id must resolve to a Closure"),
        }
    }

    fn code_byte(&self, function_id: HeapId, offset: usize) -> u8 {
        match self.heap.get(function_id) {
            HeapObject::Function(f) => f.chunk.code[offset],
            _ => unreachable!("function id must resolve to a Function"),
        }
    }

    fn line_at(&self, function_id: HeapId, offset: usize) -> u32 {
        match self.heap.get(function_id) {
            HeapObject::Function(f) => f.chunk.line_at(offset),
            _ => unreachable!(),
        }
    }

    fn constant_at(&self, function_id: HeapId, idx: usize) -> Value {
        match self.heap.get(function_id) {
            HeapObject::Function(f) => f.chunk.constants[idx].clone(),
            _ => unreachable!(),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last().unwrap();
        let (function_id, offset) = (self.closure_function(frame.closure), frame.ip);
        let byte = self.code_byte(function_id, offset);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let function_id = self.closure_function(self.frames.last().unwrap().closure);
        self.constant_at(function_id, idx)
    }

    fn read_string(&mut self) -> Rc<ObjString> {
        match self.read_constant() {
            Value::String(s) => s,
            other => unreachable!("expected a string constant, got {other:?}"),
        }
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        let function_id = self.closure_function(frame.closure);
        self.line_at(function_id, frame.ip.saturating_sub(1))
    }

    // ---- stack helpers ----

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(stack_overflow());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler-balanced stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    /// Converts a Rust-side `RuntimeError` into a thrown script value and
    /// runs the normal handler search over it, so arithmetic/type/etc.
    /// errors are catchable by a script `try`/`catch` exactly like an
    /// explicit `throw`. Returns `Ok(())` if some handler caught it (caller
    /// should fall through to the next instruction); returns `Err` only when
    /// the exception reaches the top of the call stack uncaught.
    fn raise(&mut self, err: RuntimeError) -> VmResult<()> {
        let value = Value::String(self.interner.intern(&err.to_string()));
        self.throw_value(value, Some(err))
    }

    fn throw_value(&mut self, value: Value, original: Option<RuntimeError>) -> VmResult<()> {
        loop {
            match self.handlers.last() {
                None => {
                    let summary = self.stack_summary();
                    let base = original.unwrap_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::Uncaught, value.stringify(&self.heap))
                    });
                    let mut message = base.message;
                    for (i, frame) in summary.iter().enumerate() {
                        message.push_str(&format!("\n  #{i} {frame}"));
                    }
                    return Err(RuntimeError::new(RuntimeErrorKind::Uncaught, message));
                }
                Some(handler) => {
                    if handler.frame_depth > self.frames.len() {
                        self.handlers.pop();
                        continue;
                    }
                    let handler = self.handlers.pop().unwrap();
                    self.frames.truncate(handler.frame_depth);
                    self.stack.truncate(handler.stack_depth);
                    if let Some(frame) = self.frames.last_mut() {
                        frame.ip = handler.catch_ip;
                    }
                    self.stack.push(value);
                    return Ok(());
                }
            }
        }
    }

    /// Innermost-first, truncated to `MAX_STACK_SUMMARY_FRAMES` by the
    /// caller formatting this for a user-facing message.
    fn stack_summary(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .take(crate::error::MAX_STACK_SUMMARY_FRAMES)
            .map(|frame| {
                let function_id = self.closure_function(frame.closure);
                let name = match self.heap.get(function_id) {
                    HeapObject::Function(f) => f.name.as_ref().map(|s| s.as_str().to_string()).unwrap_or_else(|| "script".to_string()),
                    _ => "?".to_string(),
                };
                let line = self.line_at(function_id, frame.ip.saturating_sub(1));
                format!("in {name} (line {line})")
            })
            .collect()
    }

    fn try_op<T>(&mut self, result: VmResult<T>) -> VmResult<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                self.raise(e)?;
                Ok(None)
            }
        }
    }

    fn maybe_collect(&mut self) {
        if self.heap.allocated_since_gc < self.config.gc_threshold {
            return;
        }
        let mut roots: Vec<HeapId> = self.stack.iter().filter_map(value_heap_id).collect();
        roots.extend(self.globals.values().filter_map(value_heap_id));
        roots.extend(self.frames.iter().map(|f| f.closure));
        roots.extend(self.open_upvalues.iter().copied());
        let (live, freed) = self.heap.collect(roots);
        trace!(live, freed, "garbage collection cycle");
    }

    // ---- calling ----

    fn call_value(&mut self, callee: Value, arg_count: usize) -> VmResult<()> {
        match callee {
            Value::Closure(id) => self.call_closure(id, arg_count),
            Value::Function(id) => self.call_closure(self.wrap_bare_function(id), arg_count),
            Value::NativeFn(native) => self.call_native(&native, arg_count),
            Value::Class(id) => self.call_class(id, arg_count),
            Value::BoundMethod(id) => self.call_bound_method(id, arg_count),
            other => Err(RuntimeError::type_error("call", "a callable value", other.type_name())),
        }
    }

    /// A bare `Value::Function` shows up only via native code building one
    /// (the compiler always wraps compiled functions in a `Closure`); adapt
    /// it to a zero-upvalue closure so the rest of the call machinery stays
    /// uniform.
    fn wrap_bare_function(&mut self, function_id: HeapId) -> HeapId {
        self.heap.alloc(HeapObject::Closure(ClosureObj {
            function: function_id,
            upvalues: Vec::new(),
        }))
    }

    fn call_closure(&mut self, closure_id: HeapId, arg_count: usize) -> VmResult<()> {
        let function_id = self.closure_function(closure_id);
        let arity = match self.heap.get(function_id) {
            HeapObject::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if arity != arg_count {
            let name = match self.heap.get(function_id) {
                HeapObject::Function(f) => f.name.as_ref().map(|s| s.as_str().to_string()).unwrap_or_else(|| "<anonymous>".to_string()),
                _ => unreachable!(),
            };
            return Err(RuntimeError::arity(&name, arity, arg_count));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(stack_overflow());
        }
        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame::new(closure_id, base));
        Ok(())
    }

    fn call_native(&mut self, native: &neutron_core::NativeFnObj, arg_count: usize) -> VmResult<()> {
        if let Some(expected) = native.arity {
            if expected != arg_count {
                return Err(RuntimeError::arity(native.name.as_str(), expected, arg_count));
            }
        }
        let args: Vec<Value> = self.stack[self.stack.len() - arg_count..].to_vec();
        let result = (native.func)(self, &args)?;
        self.stack.truncate(self.stack.len() - arg_count - 1);
        self.push(result)?;
        self.maybe_collect();
        Ok(())
    }

    fn call_class(&mut self, class_id: HeapId, arg_count: usize) -> VmResult<()> {
        let instance_id = self.heap.alloc(HeapObject::Instance(InstanceObj {
            class: class_id,
            fields: Vec::new(),
        }));
        let base = self.stack.len() - arg_count - 1;
        self.stack[base] = Value::Instance(instance_id);

        let initializer = match self.heap.get(class_id) {
            HeapObject::Class(c) => c.find_method("init"),
            _ => unreachable!(),
        };
        match initializer {
            Some(method_id) => {
                let arity = match self.heap.get(method_id) {
                    HeapObject::Function(f) => f.arity,
                    _ => unreachable!(),
                };
                if arity != arg_count {
                    return Err(RuntimeError::arity("init", arity, arg_count));
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(stack_overflow());
                }
                let closure_id = self.wrap_bare_function(method_id);
                let mut frame = CallFrame::new(closure_id, base);
                frame.return_override = Some(Value::Instance(instance_id));
                self.frames.push(frame);
            }
            None => {
                if arg_count != 0 {
                    return Err(RuntimeError::arity("init", 0, arg_count));
                }
                self.stack.truncate(base + 1);
            }
        }
        self.maybe_collect();
        Ok(())
    }

    fn call_bound_method(&mut self, bound_id: HeapId, arg_count: usize) -> VmResult<()> {
        let (receiver, method_id) = match self.heap.get(bound_id) {
            HeapObject::BoundMethod(b) => (b.receiver.clone(), b.method),
            _ => unreachable!(),
        };
        let arity = match self.heap.get(method_id) {
            HeapObject::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if arity != arg_count {
            return Err(RuntimeError::arity("method", arity, arg_count));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(stack_overflow());
        }
        let base = self.stack.len() - arg_count - 1;
        self.stack[base] = receiver;
        let closure_id = self.wrap_bare_function(method_id);
        self.frames.push(CallFrame::new(closure_id, base));
        Ok(())
    }

    fn bind_method(&mut self, instance: Value, method_id: HeapId) -> Value {
        let id = self.heap.alloc(HeapObject::BoundMethod(BoundMethodObj {
            receiver: instance,
            method: method_id,
        }));
        Value::BoundMethod(id)
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_index: usize) -> HeapId {
        for &id in &self.open_upvalues {
            if let HeapObject::Upvalue(neutron_core::UpvalueState::Open(idx)) = self.heap.get(id) {
                if *idx == stack_index {
                    return id;
                }
            }
        }
        let id = self.heap.alloc(HeapObject::Upvalue(neutron_core::UpvalueState::Open(stack_index)));
        self.open_upvalues.push(id);
        id
    }

    fn close_upvalues_from(&mut self, stack_index: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for id in self.open_upvalues.drain(..) {
            let should_close = matches!(
                self.heap.get(id),
                HeapObject::Upvalue(neutron_core::UpvalueState::Open(idx)) if *idx >= stack_index
            );
            if should_close {
                let idx = match self.heap.get(id) {
                    HeapObject::Upvalue(neutron_core::UpvalueState::Open(idx)) => *idx,
                    _ => unreachable!(),
                };
                let value = self.stack[idx].clone();
                *self.heap.get_mut(id) = HeapObject::Upvalue(neutron_core::UpvalueState::Closed(value));
            } else {
                remaining.push(id);
            }
        }
        self.open_upvalues = remaining;
    }

    // ---- main loop ----

    /// Executes instructions until the call-frame stack shrinks back down to
    /// `floor`. The bottom-most frame above `floor` leaves its return value
    /// (or the nil-return default) on top of the stack when this returns.
    fn run_until(&mut self, floor: usize, budget: Option<u64>) -> VmResult<RunOutcome> {
        let mut remaining = budget;
        while self.frames.len() > floor {
            if let Some(r) = remaining.as_mut() {
                if *r == 0 {
                    return Ok(RunOutcome::Yielded);
                }
                *r -= 1;
            }
            let op_byte = self.read_byte();
            let Some(op) = OpCode::from_byte(op_byte) else {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::Scheduler,
                    format!("corrupt bytecode: unknown opcode {op_byte}"),
                ));
            };
            #[cfg(feature = "trace-exec")]
            trace!(?op, line = self.current_line(), "exec");

            match op {
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    // Safety net for upvalues into this frame that never hit an
                    // explicit CloseUpvalue (parameters, e.g.) before returning.
                    self.close_upvalues_from(frame.stack_base);
                    self.stack.truncate(frame.stack_base);
                    let value = frame.return_override.unwrap_or(result);
                    if self.frames.len() < floor + 1 {
                        self.push(value)?;
                        break;
                    }
                    self.push(value)?;
                }
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v)?;
                }
                OpCode::ConstantLong => {
                    let hi = self.read_byte() as usize;
                    let lo = self.read_byte() as usize;
                    let idx = (hi << 8) | lo;
                    let function_id = self.closure_function(self.frames.last().unwrap().closure);
                    let v = self.constant_at(function_id, idx);
                    self.push(v)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0).clone();
                    self.push(v)?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().stack_base;
                    let v = self.stack[base + slot].clone();
                    self.push(v)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().stack_base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::SetLocalTyped => {
                    let slot = self.read_byte() as usize;
                    let tag_byte = self.read_byte();
                    let tag = TypeTag::from_byte(tag_byte).expect("compiler emits valid TypeTag bytes");
                    let value = self.peek(0).clone();
                    if !tag.matches(&value) {
                        let err = RuntimeError::type_error("assignment", tag.name(), value.type_name());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    }
                    let base = self.frames.last().unwrap().stack_base;
                    self.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).cloned() {
                        Some(v) => self.push(v)?,
                        None => {
                            let err = RuntimeError::undefined(name.as_str());
                            if self.try_op::<()>(Err(err))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.pop();
                    self.globals.insert(name, value);
                }
                OpCode::DefineTypedGlobal => {
                    let name = self.read_string();
                    let tag_byte = self.read_byte();
                    let tag = TypeTag::from_byte(tag_byte).expect("compiler emits valid TypeTag bytes");
                    let value = self.pop();
                    if !tag.matches(&value) {
                        let err = RuntimeError::type_error("declaration", tag.name(), value.type_name());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    }
                    self.globals.insert(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        let err = RuntimeError::undefined(name.as_str());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    } else {
                        let value = self.peek(0).clone();
                        self.globals.insert(name, value);
                    }
                }
                OpCode::SetGlobalTyped => {
                    let name = self.read_string();
                    let tag_byte = self.read_byte();
                    let tag = TypeTag::from_byte(tag_byte).expect("compiler emits valid TypeTag bytes");
                    let value = self.peek(0).clone();
                    if !tag.matches(&value) {
                        let err = RuntimeError::type_error("assignment", tag.name(), value.type_name());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    } else if !self.globals.contains_key(&name) {
                        let err = RuntimeError::undefined(name.as_str());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    } else {
                        self.globals.insert(name, value);
                    }
                }
                OpCode::ValidateSafeLocal => {
                    let slot = self.read_byte() as usize;
                    let tag_byte = self.read_byte();
                    let tag = TypeTag::from_byte(tag_byte).expect("compiler emits valid TypeTag bytes");
                    let base = self.frames.last().unwrap().stack_base;
                    let value = self.stack[base + slot].clone();
                    if !tag.matches(&value) {
                        let err = RuntimeError::type_error("safe binding", tag.name(), value.type_name());
                        if self.try_op::<()>(Err(err))?.is_none() {
                            continue;
                        }
                    }
                }
                OpCode::ValidateSafeGlobal => {
                    let name = self.read_string();
                    let tag_byte = self.read_byte();
                    let tag = TypeTag::from_byte(tag_byte).expect("compiler emits valid TypeTag bytes");
                    if let Some(value) = self.globals.get(&name).cloned() {
                        if !tag.matches(&value) {
                            let err = RuntimeError::type_error("safe binding", tag.name(), value.type_name());
                            if self.try_op::<()>(Err(err))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.pop();
                    match self.get_property(&receiver, &name) {
                        Ok(v) => self.push(v)?,
                        Err(e) => {
                            if self.try_op::<()>(Err(e))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = self.pop();
                    let receiver = self.peek(0).clone();
                    match self.set_property(&receiver, &name, value.clone()) {
                        Ok(()) => self.push(value)?,
                        Err(e) => {
                            if self.try_op::<()>(Err(e))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b))?;
                }
                OpCode::Greater | OpCode::Less => {
                    let b = self.pop();
                    let a = self.pop();
                    match compare(&a, &b) {
                        Ok(ordering) => {
                            let result = match op {
                                OpCode::Greater => ordering == std::cmp::Ordering::Greater,
                                OpCode::Less => ordering == std::cmp::Ordering::Less,
                                _ => unreachable!(),
                            };
                            self.push(Value::Bool(result))?;
                        }
                        Err(e) => {
                            if self.try_op::<()>(Err(e))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = self.add_values(a, b);
                    let Some(v) = self.try_op(result)? else { continue };
                    self.push(v)?;
                }
                OpCode::Subtract => {
                    let result = self.binary_numeric(|a, b| Ok(a - b));
                    let Some(v) = self.try_op(result)? else { continue };
                    self.push(v)?;
                }
                OpCode::Multiply => {
                    let result = self.binary_numeric(|a, b| Ok(a * b));
                    let Some(v) = self.try_op(result)? else { continue };
                    self.push(v)?;
                }
                OpCode::Divide => {
                    let result = self.binary_numeric(|a, b| {
                        if b == 0.0 {
                            Err(RuntimeError::new(RuntimeErrorKind::DivByZero, "division by zero"))
                        } else {
                            Ok(a / b)
                        }
                    });
                    let Some(v) = self.try_op(result)? else { continue };
                    self.push(v)?;
                }
                OpCode::Modulo => {
                    let result = self.binary_numeric(|a, b| {
                        if b == 0.0 {
                            Err(RuntimeError::new(RuntimeErrorKind::DivByZero, "modulo by zero"))
                        } else {
                            Ok(a % b)
                        }
                    });
                    let Some(v) = self.try_op(result)? else { continue };
                    self.push(v)?;
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()))?;
                }
                OpCode::Negate => {
                    let v = self.pop();
                    match v {
                        Value::Number(n) => self.push(Value::Number(-n))?,
                        other => {
                            let err = RuntimeError::type_error("unary -", "number", other.type_name());
                            if self.try_op::<()>(Err(err))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::Say => {
                    let v = self.pop();
                    println!("{}", v.stringify(&self.heap));
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count).clone();
                    if let Err(e) = self.call_value(callee, arg_count) {
                        if self.try_op::<()>(Err(e))?.is_none() {
                            continue;
                        }
                    }
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let function_id = match function_value {
                        Value::Function(id) => id,
                        _ => unreachable!("Closure operand must be a Function constant"),
                    };
                    let upvalue_count = match self.heap.get(function_id) {
                        HeapObject::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    let base = self.frames.last().unwrap().stack_base;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            let enclosing_upvalues = match self.heap.get(enclosing) {
                                HeapObject::Closure(c) => c.upvalues.clone(),
                                _ => unreachable!(),
                            };
                            upvalues.push(enclosing_upvalues[index]);
                        }
                    }
                    let closure_id = self.heap.alloc(HeapObject::Closure(ClosureObj { function: function_id, upvalues }));
                    self.push(Value::Closure(closure_id))?;
                    self.maybe_collect();
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_id = match self.heap.get(closure) {
                        HeapObject::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let value = match self.heap.get(upvalue_id) {
                        HeapObject::Upvalue(neutron_core::UpvalueState::Open(idx)) => self.stack[*idx].clone(),
                        HeapObject::Upvalue(neutron_core::UpvalueState::Closed(v)) => v.clone(),
                        _ => unreachable!(),
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_id = match self.heap.get(closure) {
                        HeapObject::Closure(c) => c.upvalues[slot],
                        _ => unreachable!(),
                    };
                    let value = self.peek(0).clone();
                    let target_idx = match self.heap.get(upvalue_id) {
                        HeapObject::Upvalue(neutron_core::UpvalueState::Open(idx)) => Some(*idx),
                        HeapObject::Upvalue(neutron_core::UpvalueState::Closed(_)) => None,
                        _ => unreachable!(),
                    };
                    match target_idx {
                        Some(idx) => self.stack[idx] = value,
                        None => *self.heap.get_mut(upvalue_id) = HeapObject::Upvalue(neutron_core::UpvalueState::Closed(value)),
                    }
                }
                OpCode::CloseUpvalue => {
                    let idx = self.stack.len() - 1;
                    self.close_upvalues_from(idx);
                    self.pop();
                }
                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let items = self.stack.split_off(self.stack.len() - count);
                    let id = self.heap.alloc(HeapObject::Array(items));
                    self.push(Value::Array(id))?;
                    self.maybe_collect();
                }
                OpCode::Object => {
                    let count = self.read_byte() as usize;
                    let mut entries = Vec::with_capacity(count);
                    let pairs = self.stack.split_off(self.stack.len() - count * 2);
                    for pair in pairs.chunks(2) {
                        let key = match &pair[0] {
                            Value::String(s) => s.clone(),
                            _ => unreachable!("object keys are always string constants"),
                        };
                        entries.push((key, pair[1].clone()));
                    }
                    let id = self.heap.alloc(HeapObject::Map(MapObj { entries }));
                    self.push(Value::Map(id))?;
                    self.maybe_collect();
                }
                OpCode::IndexGet => {
                    let index = self.pop();
                    let object = self.pop();
                    match self.index_get(&object, &index) {
                        Ok(v) => self.push(v)?,
                        Err(e) => {
                            if self.try_op::<()>(Err(e))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::IndexSet => {
                    let value = self.pop();
                    let index = self.pop();
                    let object = self.pop();
                    match self.index_set(&object, &index, value.clone()) {
                        Ok(()) => self.push(value)?,
                        Err(e) => {
                            if self.try_op::<()>(Err(e))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
                OpCode::This => {
                    let base = self.frames.last().unwrap().stack_base;
                    let v = self.stack[base].clone();
                    self.push(v)?;
                }
                OpCode::Break | OpCode::Continue => {
                    // Purely structural markers in the original opcode set;
                    // this compiler lowers break/continue to Jump/Loop
                    // directly, so these never appear in emitted bytecode.
                    unreachable!("break/continue are compiled to Jump/Loop, not emitted directly");
                }
                OpCode::Try => {
                    let target = self.jump_target_from_short();
                    self.handlers.push(TryHandler {
                        catch_ip: target,
                        frame_depth: self.frames.len(),
                        stack_depth: self.stack.len(),
                    });
                }
                OpCode::EndTry => {
                    self.handlers.pop();
                }
                OpCode::Throw => {
                    let value = self.pop();
                    self.throw_value(value, None)?;
                }
                OpCode::LogicalAnd | OpCode::LogicalOr => {
                    unreachable!("&&/|| are compiled to short-circuiting Jump sequences, not emitted directly");
                }
                OpCode::BitwiseAnd => self.bitwise(|a, b| a & b)?,
                OpCode::BitwiseOr => self.bitwise(|a, b| a | b)?,
                OpCode::BitwiseXor => self.bitwise(|a, b| a ^ b)?,
                OpCode::LeftShift => self.bitwise(|a, b| a.wrapping_shl(b as u32))?,
                OpCode::RightShift => self.bitwise(|a, b| a.wrapping_shr(b as u32))?,
                OpCode::BitwiseNot => {
                    let v = self.pop();
                    match v {
                        Value::Number(n) => self.push(Value::Number(!(n as i64) as f64))?,
                        other => {
                            let err = RuntimeError::type_error("~", "number", other.type_name());
                            if self.try_op::<()>(Err(err))?.is_none() {
                                continue;
                            }
                        }
                    }
                }
            }
        }
        Ok(RunOutcome::Completed(self.pop()))
    }

    fn jump_target_from_short(&mut self) -> usize {
        let offset = self.read_short();
        self.frames.last().unwrap().ip + offset as usize
    }

    fn add_values(&mut self, a: Value, b: Value) -> VmResult<Value> {
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => {
                let joined = format!("{}{}", a.as_str(), b.as_str());
                Ok(Value::String(self.interner.intern(&joined)))
            }
            (a, b) => Err(RuntimeError::type_error("+", "two numbers or two strings", &format!("{} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> VmResult<f64>) -> VmResult<Value> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => f(a, b).map(Value::Number),
            (a, b) => Err(RuntimeError::type_error("arithmetic", "two numbers", &format!("{} and {}", a.type_name(), b.type_name()))),
        }
    }

    fn bitwise(&mut self, f: impl Fn(i64, i64) -> i64) -> VmResult<()> {
        let result = self.binary_numeric(|a, b| Ok(f(a as i64, b as i64) as f64));
        if let Some(v) = self.try_op(result)? {
            self.push(v)?;
        }
        Ok(())
    }

    fn get_property(&mut self, receiver: &Value, name: &Rc<ObjString>) -> VmResult<Value> {
        match receiver {
            Value::Instance(id) => {
                let field = match self.heap.get(*id) {
                    HeapObject::Instance(i) => i.get_field(name.as_str()).cloned(),
                    _ => unreachable!(),
                };
                if let Some(v) = field {
                    return Ok(v);
                }
                let class_id = match self.heap.get(*id) {
                    HeapObject::Instance(i) => i.class,
                    _ => unreachable!(),
                };
                let method = match self.heap.get(class_id) {
                    HeapObject::Class(c) => c.find_method(name.as_str()),
                    _ => unreachable!(),
                };
                match method {
                    Some(method_id) => Ok(self.bind_method(receiver.clone(), method_id)),
                    None => Ok(Value::Nil),
                }
            }
            Value::Map(id) => match self.heap.get(*id) {
                HeapObject::Map(m) => Ok(m.get(name.as_str()).cloned().unwrap_or(Value::Nil)),
                _ => unreachable!(),
            },
            Value::Module(id) => match self.heap.get(*id) {
                HeapObject::Module(m) => m
                    .get_export(name.as_str())
                    .cloned()
                    .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Key, format!("module has no export '{}'", name.as_str()))),
                _ => unreachable!(),
            },
            Value::Class(id) => {
                let method = match self.heap.get(*id) {
                    HeapObject::Class(c) => c.find_method(name.as_str()),
                    _ => unreachable!(),
                };
                method
                    .map(|m| self.bind_method(receiver.clone(), m))
                    .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Key, format!("class has no method '{}'", name.as_str())))
            }
            other => Err(RuntimeError::new(
                RuntimeErrorKind::PropertyOnNonObject,
                format!("cannot read property '{}' of {}", name.as_str(), other.type_name()),
            )),
        }
    }

    fn set_property(&mut self, receiver: &Value, name: &Rc<ObjString>, value: Value) -> VmResult<()> {
        match receiver {
            Value::Instance(id) => {
                match self.heap.get_mut(*id) {
                    HeapObject::Instance(i) => i.set_field(name.clone(), value),
                    _ => unreachable!(),
                }
                Ok(())
            }
            other => Err(RuntimeError::new(
                RuntimeErrorKind::PropertyOnNonObject,
                format!("cannot set property '{}' on {}", name.as_str(), other.type_name()),
            )),
        }
    }

    fn index_get(&mut self, object: &Value, index: &Value) -> VmResult<Value> {
        match object {
            Value::Array(id) => {
                let i = expect_index(index)?;
                match self.heap.get(*id) {
                    HeapObject::Array(items) => items
                        .get(i)
                        .cloned()
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Index, format!("index {i} out of bounds"))),
                    _ => unreachable!(),
                }
            }
            Value::String(s) => {
                let i = expect_index(index)?;
                s.as_str()
                    .chars()
                    .nth(i)
                    .map(|c| Value::String(self.interner.intern(&c.to_string())))
                    .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Index, format!("index {i} out of bounds")))
            }
            Value::Map(id) => {
                let key = expect_key(index)?;
                match self.heap.get(*id) {
                    HeapObject::Map(m) => m
                        .get(key.as_str())
                        .cloned()
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Key, format!("no key '{}'", key.as_str()))),
                    _ => unreachable!(),
                }
            }
            other => Err(RuntimeError::type_error("indexing", "array, string, or map", other.type_name())),
        }
    }

    fn index_set(&mut self, object: &Value, index: &Value, value: Value) -> VmResult<()> {
        match object {
            Value::Array(id) => {
                let i = expect_index(index)?;
                match self.heap.get_mut(*id) {
                    HeapObject::Array(items) => {
                        if i >= items.len() {
                            return Err(RuntimeError::new(RuntimeErrorKind::Index, format!("index {i} out of bounds")));
                        }
                        items[i] = value;
                        Ok(())
                    }
                    _ => unreachable!(),
                }
            }
            Value::Map(id) => {
                let key = expect_key(index)?;
                match self.heap.get_mut(*id) {
                    HeapObject::Map(m) => {
                        m.set(key, value);
                        Ok(())
                    }
                    _ => unreachable!(),
                }
            }
            other => Err(RuntimeError::type_error("indexed assignment", "array or map", other.type_name())),
        }
    }
}

fn value_heap_id(value: &Value) -> Option<HeapId> {
    match value {
        Value::Array(id)
        | Value::Map(id)
        | Value::Function(id)
        | Value::Closure(id)
        | Value::Class(id)
        | Value::Instance(id)
        | Value::BoundMethod(id)
        | Value::Module(id)
        | Value::Buffer(id) => Some(*id),
        _ => None,
    }
}

fn expect_index(value: &Value) -> VmResult<usize> {
    match value {
        Value::Number(n) if *n >= 0.0 => Ok(*n as usize),
        Value::Number(_) => Err(RuntimeError::new(RuntimeErrorKind::Index, "index must not be negative")),
        other => Err(RuntimeError::type_error("index", "number", other.type_name())),
    }
}

fn expect_key(value: &Value) -> VmResult<Rc<ObjString>> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(RuntimeError::type_error("map key", "string", other.type_name())),
    }
}

fn compare(a: &Value, b: &Value) -> VmResult<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            a.partial_cmp(b).ok_or_else(|| RuntimeError::new(RuntimeErrorKind::Type, "cannot compare NaN"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.as_str().cmp(b.as_str())),
        (a, b) => Err(RuntimeError::type_error("comparison", "two numbers or two strings", &format!("{} and {}", a.type_name(), b.type_name()))),
    }
}

impl NativeContext for Vm {
    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn interner(&self) -> &StringInterner {
        &self.interner
    }

    fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let floor = self.frames.len();
        self.push(callee.clone())?;
        for arg in args {
            self.push(arg.clone())?;
        }
        self.call_value(callee.clone(), args.len())?;
        if self.frames.len() > floor {
            match self.run_until(floor, None)? {
                RunOutcome::Completed(v) => Ok(v),
                RunOutcome::Yielded => unreachable!("a run with no reduction budget never yields"),
            }
        } else {
            Ok(self.pop())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutron_compiler::{Compiler, CompilerConfig};
    use neutron_compiler::ast::{Expr, Literal, Stmt};

    fn run(program: Vec<Stmt>) -> (Value, Vm) {
        let interner = StringInterner::new();
        let mut vm = Vm::new(interner, VmConfig::default());
        let function = {
            let (heap, interner) = vm.heap_and_interner_mut();
            let compiler = Compiler::new(heap, interner, CompilerConfig::default());
            compiler.compile_program(&program).expect("program compiles")
        };
        let result = vm.interpret(function).expect("program runs");
        (result, vm)
    }

    #[test]
    fn arithmetic_evaluates_left_to_right() {
        let (result, _vm) = run(vec![Stmt::Return {
            value: Some(Expr::Binary {
                op: neutron_compiler::ast::BinaryOp::Add,
                left: Box::new(Expr::Literal(Literal::Number(1.0))),
                right: Box::new(Expr::Literal(Literal::Number(2.0))),
                line: 1,
            }),
            line: 1,
        }]);
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let program = vec![Stmt::Try {
            body: vec![Stmt::Expression(Expr::Binary {
                op: neutron_compiler::ast::BinaryOp::Div,
                left: Box::new(Expr::Literal(Literal::Number(1.0))),
                right: Box::new(Expr::Literal(Literal::Number(0.0))),
                line: 1,
            })],
            catch_var: Some("e".to_string()),
            catch_body: vec![Stmt::Return {
                value: Some(Expr::Literal(Literal::String("caught".to_string()))),
                line: 2,
            }],
            finally: None,
            line: 1,
        }];
        let (result, vm) = run(program);
        assert_eq!(result.stringify(vm.heap()), "caught");
    }
}
