//! Single-pass AST-to-bytecode compiler
//!
//! Grounded on `original_source/neutron-macos-intel/include/compiler/compiler.h`
//! and `original_source/src/compiler/compiler.cpp`: one tree-walk over the
//! validated AST that emits straight into a `Chunk`, no separate IR. The C++
//! original threads scope resolution through an `enclosing: Compiler*` chain;
//! here that's an index into `Compiler::scopes` (a `Vec<FunctionScope>`)
//! instead of a pointer chain, since every scope's lifetime is already tied
//! to the one `Compiler` doing the walk.

use crate::ast::{BinaryOp, Expr, FunctionStmt, Literal, MatchArm, Param, Stmt, UnaryOp};
use crate::error::{CompileError, CompileErrorKind};
use neutron_core::{
    Chunk, ClassObj, FunctionObj, Heap, HeapObject, ObjString, OpCode, StringInterner, TypeTag, UpvalueDesc, Value,
};
use std::rc::Rc;

/// Tunables exposed to the CLI layer.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Enforce declared-type checks in every scope, as though the whole
    /// program were one `safe` file, per the `--safe-file` flag.
    pub safe_file: bool,
    pub max_locals: usize,
    pub max_upvalues: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            safe_file: false,
            max_locals: 256,
            max_upvalues: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: i32,
    type_annotation: Option<TypeTag>,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
}

struct LoopCtx {
    /// Byte offset the `continue` target loops back to.
    continue_target: usize,
    /// Patch locations of `break` jumps still waiting for the loop's end.
    break_jumps: Vec<usize>,
}

struct FunctionScope {
    function: FunctionObj,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    /// True inside a `safe { ... }` block, or for the whole function when
    /// `CompilerConfig::safe_file` is set.
    in_safe_block: bool,
}

impl FunctionScope {
    fn new(name: Option<Rc<ObjString>>, kind: FunctionKind, in_safe_block: bool) -> Self {
        // Slot 0 is reserved for the receiver in a method, unnamed/unusable
        // otherwise (mirrors clox's "" sentinel local for slot 0).
        let receiver_name = if kind == FunctionKind::Method { "this" } else { "" };
        Self {
            function: FunctionObj {
                name,
                arity: 0,
                chunk: Chunk::new(),
                upvalue_count: 0,
            },
            kind,
            locals: vec![Local {
                name: receiver_name.to_string(),
                depth: 0,
                type_annotation: None,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            in_safe_block,
        }
    }
}

/// Walks a validated AST and emits bytecode for it. One `Compiler` compiles
/// one top-level unit (a script or a `use`d module); nested functions are
/// compiled by pushing a new `FunctionScope` onto the same instance rather
/// than recursing into a fresh `Compiler`.
pub struct Compiler<'a> {
    heap: &'a mut Heap,
    interner: &'a StringInterner,
    config: CompilerConfig,
    scopes: Vec<FunctionScope>,
    declared_globals: std::collections::HashSet<String>,
    /// Declared types for globals defined with an annotation, so a later
    /// assignment inside a safe scope re-checks the type the global was
    /// actually declared with rather than a placeholder.
    global_types: std::collections::HashMap<String, TypeTag>,
}

type CResult<T> = Result<T, CompileError>;

impl<'a> Compiler<'a> {
    pub fn new(heap: &'a mut Heap, interner: &'a StringInterner, config: CompilerConfig) -> Self {
        Self {
            heap,
            interner,
            config,
            scopes: vec![FunctionScope::new(None, FunctionKind::Script, false)],
            declared_globals: std::collections::HashSet::new(),
            global_types: std::collections::HashMap::new(),
        }
    }

    /// Compile a whole program into its top-level `FunctionObj`, ready to be
    /// wrapped in a `Closure` and handed to the VM.
    pub fn compile_program(mut self, program: &[Stmt]) -> CResult<FunctionObj> {
        for stmt in program {
            self.compile_stmt(stmt)?;
        }
        let line = program.last().map(stmt_line).unwrap_or(0);
        self.emit_return(line);
        let scope = self.scopes.pop().expect("script scope always present");
        Ok(scope.function)
    }

    fn current(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("at least one scope")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current().function.chunk
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.chunk().write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, operand: u8, line: u32) {
        self.emit_op(op, line);
        self.emit_byte(operand, line);
    }

    fn emit_return(&mut self, line: u32) {
        self.emit_op(OpCode::Nil, line);
        self.emit_op(OpCode::Return, line);
    }

    fn make_constant(&mut self, value: Value, line: u32) -> CResult<u8> {
        let idx = self.chunk().add_constant(value);
        if idx > u8::MAX as usize {
            return Err(CompileError::new(
                CompileErrorKind::TooManyConstants,
                line,
                "a single function cannot hold more than 256 constants",
            ));
        }
        Ok(idx as u8)
    }

    fn emit_constant(&mut self, value: Value, line: u32) -> CResult<()> {
        let idx = self.make_constant(value, line)?;
        self.emit_bytes(OpCode::Constant, idx, line);
        Ok(())
    }

    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let chunk = self.chunk();
        let jump = chunk.code.len() - offset - 2;
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        self.emit_op(OpCode::Loop, line);
        let offset = self.chunk().code.len() - loop_start + 2;
        self.emit_byte(((offset >> 8) & 0xff) as u8, line);
        self.emit_byte((offset & 0xff) as u8, line);
    }

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let scope = self.current();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
            self.current().locals.pop();
        }
    }

    // ---- statements ----

    fn compile_stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expression(expr) => {
                let line = expr_line(expr);
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Pop, line);
            }
            Stmt::Say(expr, line) => {
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Say, *line);
            }
            Stmt::Var {
                name,
                type_annotation,
                init,
                line,
            } => self.compile_var_decl(name, *type_annotation, init.as_ref(), *line)?,
            Stmt::Block(body) => {
                self.begin_scope();
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.end_scope(body.last().map(stmt_line).unwrap_or(0));
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.compile_if(cond, then_branch, else_branch.as_deref())?,
            Stmt::While { cond, body } => self.compile_while(cond, body)?,
            Stmt::DoWhile { body, cond } => self.compile_do_while(body, cond)?,
            Stmt::Function(f) => self.compile_function_decl(f)?,
            Stmt::Return { value, line } => self.compile_return(value.as_ref(), *line)?,
            Stmt::Class { name, methods, line } => self.compile_class_decl(name, methods, *line)?,
            Stmt::Use {
                target,
                is_file_path,
                line,
            } => self.compile_use(target, *is_file_path, *line)?,
            Stmt::Break(line) => self.compile_break(*line)?,
            Stmt::Continue(line) => self.compile_continue(*line)?,
            Stmt::Match { scrutinee, arms, line } => self.compile_match(scrutinee, arms, *line)?,
            Stmt::Try {
                body,
                catch_var,
                catch_body,
                finally,
                line,
            } => self.compile_try(body, catch_var.as_deref(), catch_body, finally.as_deref(), *line)?,
            Stmt::Throw(expr, line) => {
                self.compile_expr(expr)?;
                self.emit_op(OpCode::Throw, *line);
            }
            Stmt::Safe(body) => self.compile_safe_block(body)?,
        }
        Ok(())
    }

    fn compile_var_decl(
        &mut self,
        name: &str,
        type_annotation: Option<TypeTag>,
        init: Option<&Expr>,
        line: u32,
    ) -> CResult<()> {
        if let Some(init) = init {
            self.compile_expr(init)?;
        } else {
            self.emit_op(OpCode::Nil, line);
        }

        let enforce_type = type_annotation.is_some() && (self.current().in_safe_block || self.config.safe_file);

        if self.current().scope_depth > 0 {
            self.add_local(name, type_annotation, line)?;
            if enforce_type {
                let tag = type_annotation.expect("enforce_type implies Some");
                let slot = (self.current().locals.len() - 1) as u8;
                self.emit_op(OpCode::ValidateSafeLocal, line);
                self.emit_byte(slot, line);
                self.emit_byte(tag as u8, line);
            }
            // The initializer's value is already sitting in the new local's
            // stack slot; marking it merely stops treating it as uninitialized.
            self.mark_local_initialized();
        } else {
            let name_value = Value::String(self.interner.intern(name));
            let idx = self.make_constant(name_value, line)?;
            self.declared_globals.insert(name.to_string());
            if enforce_type {
                let tag = type_annotation.expect("enforce_type implies Some");
                self.global_types.insert(name.to_string(), tag);
                self.emit_op(OpCode::DefineTypedGlobal, line);
                self.emit_byte(idx, line);
                self.emit_byte(tag as u8, line);
            } else {
                self.emit_bytes(OpCode::DefineGlobal, idx, line);
            }
        }
        Ok(())
    }

    fn add_local(&mut self, name: &str, type_annotation: Option<TypeTag>, line: u32) -> CResult<()> {
        let scope = self.current();
        let depth = scope.scope_depth;
        if scope
            .locals
            .iter()
            .any(|l| l.depth == depth && l.name == name)
        {
            return Err(CompileError::new(
                CompileErrorKind::DuplicateLocal,
                line,
                format!("'{name}' is already declared in this scope"),
            ));
        }
        if scope.locals.len() >= self.config.max_locals {
            return Err(CompileError::new(
                CompileErrorKind::TooManyLocals,
                line,
                "too many local variables in this function",
            ));
        }
        scope.locals.push(Local {
            name: name.to_string(),
            // -1 marks "declared but not yet initialized"; resolving a local
            // by this name before `mark_local_initialized` runs would read
            // its own uninitialized slot (self-referential `let x = x`).
            depth: -1,
            type_annotation,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_local_initialized(&mut self) {
        let scope = self.current();
        let depth = scope.scope_depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn compile_if(&mut self, cond: &Expr, then_branch: &[Stmt], else_branch: Option<&[Stmt]>) -> CResult<()> {
        let line = expr_line(cond);
        self.compile_expr(cond)?;
        let then_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line);
        for s in then_branch {
            self.compile_stmt(s)?;
        }
        let else_jump = self.emit_jump(OpCode::Jump, line);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop, line);
        if let Some(else_branch) = else_branch {
            for s in else_branch {
                self.compile_stmt(s)?;
            }
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Stmt]) -> CResult<()> {
        let line = expr_line(cond);
        let loop_start = self.chunk().code.len();
        self.current().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
        });
        self.compile_expr(cond)?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop, line);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop, line);
        self.finish_loop(line);
        Ok(())
    }

    fn compile_do_while(&mut self, body: &[Stmt], cond: &Expr) -> CResult<()> {
        let line = expr_line(cond);
        let loop_start = self.chunk().code.len();
        self.current().loops.push(LoopCtx {
            continue_target: loop_start,
            break_jumps: Vec::new(),
        });
        for s in body {
            self.compile_stmt(s)?;
        }
        self.compile_expr(cond)?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop, line);
        self.finish_loop(line);
        Ok(())
    }

    fn finish_loop(&mut self, line: u32) {
        let loop_ctx = self.current().loops.pop().expect("loop just pushed");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
        let _ = line;
    }

    fn compile_break(&mut self, line: u32) -> CResult<()> {
        let jump = self.emit_jump(OpCode::Jump, line);
        match self.current().loops.last_mut() {
            Some(ctx) => {
                ctx.break_jumps.push(jump);
                Ok(())
            }
            None => Err(CompileError::new(CompileErrorKind::UnresolvedBreak, line, "'break' outside a loop")),
        }
    }

    fn compile_continue(&mut self, line: u32) -> CResult<()> {
        let target = match self.current().loops.last() {
            Some(ctx) => ctx.continue_target,
            None => {
                return Err(CompileError::new(
                    CompileErrorKind::UnresolvedContinue,
                    line,
                    "'continue' outside a loop",
                ));
            }
        };
        self.emit_loop(target, line);
        Ok(())
    }

    fn compile_function_decl(&mut self, f: &FunctionStmt) -> CResult<()> {
        if self.current().scope_depth > 0 {
            self.add_local(&f.name, None, f.line)?;
            self.mark_local_initialized();
        } else {
            self.declared_globals.insert(f.name.clone());
        }
        self.compile_function(Some(&f.name), &f.params, &f.body, FunctionKind::Function, f.line)?;
        if self.current().scope_depth == 0 {
            let name_value = Value::String(self.interner.intern(&f.name));
            let idx = self.make_constant(name_value, f.line)?;
            self.emit_bytes(OpCode::DefineGlobal, idx, f.line);
        }
        Ok(())
    }

    /// Compile a function body into its own `FunctionScope`, then splice the
    /// resulting `FunctionObj` (plus any upvalue captures) into the enclosing
    /// scope as a `CLOSURE` instruction. Mirrors clox's `function()` but with
    /// an index into `self.scopes` standing in for the enclosing-pointer walk.
    fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[Param],
        body: &[Stmt],
        kind: FunctionKind,
        line: u32,
    ) -> CResult<()> {
        let interned_name = name.map(|n| self.interner.intern(n));
        self.scopes.push(FunctionScope::new(interned_name, kind, self.config.safe_file));
        self.current().function.arity = params.len();
        self.begin_scope();

        for param in params {
            self.add_local(&param.name, param.type_annotation, line)?;
            self.mark_local_initialized();
            if let Some(tag) = param.type_annotation {
                if self.config.safe_file {
                    let slot = (self.current().locals.len() - 1) as u8;
                    self.emit_bytes(OpCode::ValidateSafeLocal, slot, line);
                    self.emit_byte(tag as u8, line);
                }
            }
        }

        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        let last_line = body.last().map(stmt_line).unwrap_or(line);
        self.emit_return(last_line);

        let finished = self.scopes.pop().expect("pushed above");
        let upvalue_count = finished.upvalues.len();
        let mut function = finished.function;
        function.upvalue_count = upvalue_count;

        let func_id = self.heap.alloc(HeapObject::Function(function));
        let const_idx = self.make_constant(Value::Function(func_id), line)?;
        self.emit_bytes(OpCode::Closure, const_idx, line);
        for upvalue in &finished.upvalues {
            self.emit_byte(upvalue.is_local as u8, line);
            self.emit_byte(upvalue.index, line);
        }
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>, line: u32) -> CResult<()> {
        if self.scopes.len() == 1 && self.scopes[0].kind == FunctionKind::Script {
            return Err(CompileError::new(
                CompileErrorKind::ReturnFromTopLevel,
                line,
                "'return' outside a function",
            ));
        }
        match value {
            Some(expr) => self.compile_expr(expr)?,
            None => self.emit_op(OpCode::Nil, line),
        }
        self.emit_op(OpCode::Return, line);
        Ok(())
    }

    /// Classes have no runtime construction opcode: every method body is
    /// compiled up front and the whole `ClassObj` is built directly on the
    /// heap, so the class *value* itself becomes a compile-time constant
    /// bound to its name exactly like any other global.
    fn compile_class_decl(&mut self, name: &str, methods: &[FunctionStmt], line: u32) -> CResult<()> {
        let mut compiled_methods = Vec::with_capacity(methods.len());
        for method in methods {
            let method_name = self.interner.intern(&method.name);
            let function = self.compile_method(method)?;
            let func_id = self.heap.alloc(HeapObject::Function(function));
            compiled_methods.push((method_name, func_id));
        }
        let class = ClassObj {
            name: self.interner.intern(name),
            methods: compiled_methods,
        };
        let class_id = self.heap.alloc(HeapObject::Class(class));
        self.emit_constant(Value::Class(class_id), line)?;

        if self.current().scope_depth > 0 {
            self.add_local(name, None, line)?;
            self.mark_local_initialized();
        } else {
            let name_value = Value::String(self.interner.intern(name));
            let idx = self.make_constant(name_value, line)?;
            self.declared_globals.insert(name.to_string());
            self.emit_bytes(OpCode::DefineGlobal, idx, line);
        }
        Ok(())
    }

    /// Methods are compiled in their own throwaway scope so their upvalue
    /// captures never leak into the class declaration's enclosing function;
    /// `this` resolution happens through the reserved slot-0 local.
    /// Methods are built once, at class-declaration time, into a bare
    /// `FunctionObj` rather than a `Closure` (a `ClassObj` is a standalone
    /// heap constant, not bound to any particular call frame). So a method
    /// gets its own scope stack, isolated from whatever function happens to
    /// be compiling the enclosing `class` statement: it resolves `this`, its
    /// own locals, and globals, but cannot capture an outer function's
    /// locals as upvalues the way a nested function expression can.
    fn compile_method(&mut self, method: &FunctionStmt) -> CResult<FunctionObj> {
        let interned_name = self.interner.intern(&method.name);
        let outer_scopes = std::mem::replace(
            &mut self.scopes,
            vec![FunctionScope::new(Some(interned_name), FunctionKind::Method, self.config.safe_file)],
        );
        self.current().function.arity = method.params.len();
        self.begin_scope();
        for param in &method.params {
            self.add_local(&param.name, param.type_annotation, method.line)?;
            self.mark_local_initialized();
        }
        for stmt in &method.body {
            self.compile_stmt(stmt)?;
        }
        let last_line = method.body.last().map(stmt_line).unwrap_or(method.line);
        self.emit_return(last_line);
        let finished = self.scopes.pop().expect("the lone method scope");
        self.scopes = outer_scopes;
        let mut function = finished.function;
        function.upvalue_count = finished.upvalues.len();
        Ok(function)
    }

    fn compile_use(&mut self, target: &str, is_file_path: bool, line: u32) -> CResult<()> {
        // Module resolution is a VM concern, not a compile-time one: emit the
        // target name as a string constant and let the VM's module loader
        // resolve/bind it, reusing DefineGlobal so `use`d names behave like
        // any other global binding to callers.
        let module_name = Value::String(self.interner.intern(target));
        let idx = self.make_constant(module_name, line)?;
        self.emit_bytes(OpCode::GetGlobal, idx, line);
        let binding = if is_file_path { target.rsplit('/').next().unwrap_or(target) } else { target };
        let binding_value = Value::String(self.interner.intern(binding));
        let bind_idx = self.make_constant(binding_value, line)?;
        self.emit_bytes(OpCode::DefineGlobal, bind_idx, line);
        self.declared_globals.insert(binding.to_string());
        Ok(())
    }

    fn compile_match(&mut self, scrutinee: &Expr, arms: &[MatchArm], line: u32) -> CResult<()> {
        self.compile_expr(scrutinee)?;
        let mut end_jumps = Vec::new();
        for arm in arms {
            self.emit_op(OpCode::Dup, line);
            self.compile_expr(&arm.pattern)?;
            self.emit_op(OpCode::Equal, line);
            let skip_jump = self.emit_jump(OpCode::JumpIfFalse, line);
            self.emit_op(OpCode::Pop, line);
            self.emit_op(OpCode::Pop, line);
            self.begin_scope();
            for s in &arm.body {
                self.compile_stmt(s)?;
            }
            self.end_scope(line);
            end_jumps.push(self.emit_jump(OpCode::Jump, line));
            self.patch_jump(skip_jump);
            self.emit_op(OpCode::Pop, line);
        }
        self.emit_op(OpCode::Pop, line);
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        catch_var: Option<&str>,
        catch_body: &[Stmt],
        finally: Option<&[Stmt]>,
        line: u32,
    ) -> CResult<()> {
        let try_jump = self.emit_jump(OpCode::Try, line);
        for s in body {
            self.compile_stmt(s)?;
        }
        self.emit_op(OpCode::EndTry, line);
        let skip_catch = self.emit_jump(OpCode::Jump, line);
        self.patch_jump(try_jump);

        self.begin_scope();
        if let Some(name) = catch_var {
            self.add_local(name, None, line)?;
            self.mark_local_initialized();
        } else {
            self.emit_op(OpCode::Pop, line);
        }
        for s in catch_body {
            self.compile_stmt(s)?;
        }
        self.end_scope(line);
        self.patch_jump(skip_catch);

        if let Some(finally) = finally {
            for s in finally {
                self.compile_stmt(s)?;
            }
        }
        Ok(())
    }

    fn compile_safe_block(&mut self, body: &[Stmt]) -> CResult<()> {
        let was_safe = self.current().in_safe_block;
        self.current().in_safe_block = true;
        self.begin_scope();
        for s in body {
            self.compile_stmt(s)?;
        }
        let last_line = body.last().map(stmt_line).unwrap_or(0);
        self.end_scope(last_line);
        self.current().in_safe_block = was_safe;
        Ok(())
    }

    // ---- expressions ----

    fn compile_expr(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Literal(lit) => self.compile_literal(lit, expr_line(expr))?,
            Expr::Variable { name, line } => self.compile_variable_get(name, *line)?,
            Expr::Binary { op, left, right, line } => self.compile_binary(*op, left, right, *line)?,
            Expr::Unary { op, operand, line } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => OpCode::Negate,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::BitNot => OpCode::BitwiseNot,
                };
                self.emit_op(opcode, *line);
            }
            Expr::Grouping(inner) => self.compile_expr(inner)?,
            Expr::Member { object, name, line } => {
                self.compile_expr(object)?;
                let idx = self.make_constant(Value::String(self.interner.intern(name)), *line)?;
                self.emit_bytes(OpCode::GetProperty, idx, *line);
            }
            Expr::Call { callee, args, line } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit_bytes(OpCode::Call, args.len() as u8, *line);
            }
            Expr::Assign { name, value, line } => self.compile_assign(name, value, *line)?,
            Expr::MemberSet {
                object,
                name,
                value,
                line,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let idx = self.make_constant(Value::String(self.interner.intern(name)), *line)?;
                self.emit_bytes(OpCode::SetProperty, idx, *line);
            }
            Expr::Index { object, index, line } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit_op(OpCode::IndexGet, *line);
            }
            Expr::IndexSet {
                object,
                index,
                value,
                line,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit_op(OpCode::IndexSet, *line);
            }
            Expr::Object(entries) => {
                for (key, value) in entries {
                    let idx = self.make_constant(Value::String(self.interner.intern(key)), expr_line(value))?;
                    self.emit_bytes(OpCode::Constant, idx, expr_line(value));
                    self.compile_expr(value)?;
                }
                self.emit_bytes(OpCode::Object, entries.len() as u8, 0);
            }
            Expr::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_bytes(OpCode::Array, items.len() as u8, 0);
            }
            Expr::This { line } => {
                if !self.scopes.iter().any(|s| s.kind == FunctionKind::Method) {
                    return Err(CompileError::new(
                        CompileErrorKind::ThisOutsideMethod,
                        *line,
                        "'this' used outside a method",
                    ));
                }
                self.emit_op(OpCode::This, *line);
            }
            Expr::Function { name, params, body, line } => {
                self.compile_function(name.as_deref(), params, body, FunctionKind::Function, *line)?;
            }
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
                line,
            } => {
                self.compile_expr(cond)?;
                let then_jump = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.emit_op(OpCode::Pop, *line);
                self.compile_expr(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump, *line);
                self.patch_jump(then_jump);
                self.emit_op(OpCode::Pop, *line);
                self.compile_expr(else_branch)?;
                self.patch_jump(end_jump);
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, lit: &Literal, line: u32) -> CResult<()> {
        match lit {
            Literal::Nil => self.emit_op(OpCode::Nil, line),
            Literal::Bool(true) => self.emit_op(OpCode::True, line),
            Literal::Bool(false) => self.emit_op(OpCode::False, line),
            Literal::Number(n) => self.emit_constant(Value::Number(*n), line)?,
            Literal::String(s) => self.emit_constant(Value::String(self.interner.intern(s)), line)?,
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, line: u32) -> CResult<()> {
        // Short-circuiting operators need the left operand's jump decision
        // before the right operand is even compiled, so they can't share the
        // eager both-sides-then-opcode shape the arithmetic/comparison ops use.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            self.compile_expr(left)?;
            let jump = self.emit_jump(
                if op == BinaryOp::And { OpCode::JumpIfFalse } else { OpCode::Jump },
                line,
            );
            self.emit_op(OpCode::Pop, line);
            self.compile_expr(right)?;
            self.patch_jump(jump);
            return Ok(());
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        // <= and >= aren't their own opcodes: `a <= b` is `!(a > b)` and
        // `a >= b` is `!(a < b)`, same as clox folds them.
        let opcode = match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Subtract,
            BinaryOp::Mul => OpCode::Multiply,
            BinaryOp::Div => OpCode::Divide,
            BinaryOp::Mod => OpCode::Modulo,
            BinaryOp::Eq => OpCode::Equal,
            BinaryOp::NotEq => OpCode::NotEqual,
            BinaryOp::Lt => OpCode::Less,
            BinaryOp::Le => OpCode::Greater,
            BinaryOp::Gt => OpCode::Greater,
            BinaryOp::Ge => OpCode::Less,
            BinaryOp::BitAnd => OpCode::BitwiseAnd,
            BinaryOp::BitOr => OpCode::BitwiseOr,
            BinaryOp::BitXor => OpCode::BitwiseXor,
            BinaryOp::Shl => OpCode::LeftShift,
            BinaryOp::Shr => OpCode::RightShift,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        self.emit_op(opcode, line);
        if matches!(op, BinaryOp::Le | BinaryOp::Ge) {
            self.emit_op(OpCode::Not, line);
        }
        Ok(())
    }

    fn compile_variable_get(&mut self, name: &str, line: u32) -> CResult<()> {
        if let Some(slot) = self.resolve_local(self.scopes.len() - 1, name) {
            self.emit_bytes(OpCode::GetLocal, slot, line);
        } else if let Some(upvalue) = self.resolve_upvalue(self.scopes.len() - 1, name, line)? {
            self.emit_bytes(OpCode::GetUpvalue, upvalue, line);
        } else {
            let idx = self.make_constant(Value::String(self.interner.intern(name)), line)?;
            self.emit_bytes(OpCode::GetGlobal, idx, line);
        }
        Ok(())
    }

    fn compile_assign(&mut self, name: &str, value: &Expr, line: u32) -> CResult<()> {
        self.compile_expr(value)?;
        if let Some(slot) = self.resolve_local(self.scopes.len() - 1, name) {
            let annotation = self.scopes[self.scopes.len() - 1].locals[slot as usize].type_annotation;
            if annotation.is_some() && (self.current().in_safe_block || self.config.safe_file) {
                self.emit_op(OpCode::SetLocalTyped, line);
                self.emit_byte(slot, line);
                self.emit_byte(annotation.expect("checked above") as u8, line);
            } else {
                self.emit_bytes(OpCode::SetLocal, slot, line);
            }
        } else if let Some(upvalue) = self.resolve_upvalue(self.scopes.len() - 1, name, line)? {
            self.emit_bytes(OpCode::SetUpvalue, upvalue, line);
        } else {
            let idx = self.make_constant(Value::String(self.interner.intern(name)), line)?;
            let declared_type = self.global_types.get(name).copied();
            if let Some(tag) = declared_type {
                if self.current().in_safe_block || self.config.safe_file {
                    self.emit_op(OpCode::SetGlobalTyped, line);
                    self.emit_byte(idx, line);
                    self.emit_byte(tag as u8, line);
                } else {
                    self.emit_bytes(OpCode::SetGlobal, idx, line);
                }
            } else {
                self.emit_bytes(OpCode::SetGlobal, idx, line);
            }
        }
        Ok(())
    }

    fn resolve_local(&self, scope_idx: usize, name: &str) -> Option<u8> {
        let scope = &self.scopes[scope_idx];
        scope
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name && l.depth != -1)
            .map(|(i, _)| i as u8)
    }

    /// Walks outward one enclosing scope at a time, exactly the shape of the
    /// C++ original's `enclosing` pointer chase, just over indices instead of
    /// pointers. A local found in an outer scope is captured into the current
    /// scope's upvalue list; a local found in some further-out scope is
    /// captured transitively, one upvalue hop per intervening scope.
    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str, line: u32) -> CResult<Option<u8>> {
        if scope_idx == 0 {
            return Ok(None);
        }
        let enclosing_idx = scope_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing_idx, name) {
            self.scopes[enclosing_idx].locals[local_slot as usize].is_captured = true;
            return self.add_upvalue(scope_idx, local_slot, true, line).map(Some);
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing_idx, name, line)? {
            return self.add_upvalue(scope_idx, upvalue_slot, false, line).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool, line: u32) -> CResult<u8> {
        let scope = &mut self.scopes[scope_idx];
        if let Some((i, _)) = scope
            .upvalues
            .iter()
            .enumerate()
            .find(|(_, u)| u.index == index && u.is_local == is_local)
        {
            return Ok(i as u8);
        }
        if scope.upvalues.len() >= self.config.max_upvalues {
            return Err(CompileError::new(
                CompileErrorKind::TooManyUpvalues,
                line,
                "too many captured variables in this function",
            ));
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        Ok((scope.upvalues.len() - 1) as u8)
    }
}

fn stmt_line(stmt: &Stmt) -> u32 {
    match stmt {
        Stmt::Expression(e) => expr_line(e),
        Stmt::Say(_, line) => *line,
        Stmt::Var { line, .. } => *line,
        Stmt::Block(body) => body.last().map(stmt_line).unwrap_or(0),
        Stmt::If { cond, .. } => expr_line(cond),
        Stmt::While { cond, .. } => expr_line(cond),
        Stmt::DoWhile { cond, .. } => expr_line(cond),
        Stmt::Function(f) => f.line,
        Stmt::Return { line, .. } => *line,
        Stmt::Class { line, .. } => *line,
        Stmt::Use { line, .. } => *line,
        Stmt::Break(line) => *line,
        Stmt::Continue(line) => *line,
        Stmt::Match { line, .. } => *line,
        Stmt::Try { line, .. } => *line,
        Stmt::Throw(_, line) => *line,
        Stmt::Safe(body) => body.last().map(stmt_line).unwrap_or(0),
    }
}

fn expr_line(expr: &Expr) -> u32 {
    match expr {
        Expr::Literal(_) => 0,
        Expr::Variable { line, .. }
        | Expr::Binary { line, .. }
        | Expr::Unary { line, .. }
        | Expr::Member { line, .. }
        | Expr::Call { line, .. }
        | Expr::Assign { line, .. }
        | Expr::MemberSet { line, .. }
        | Expr::Index { line, .. }
        | Expr::IndexSet { line, .. }
        | Expr::This { line }
        | Expr::Function { line, .. }
        | Expr::Ternary { line, .. } => *line,
        Expr::Grouping(inner) => expr_line(inner),
        Expr::Object(entries) => entries.first().map(|(_, v)| expr_line(v)).unwrap_or(0),
        Expr::Array(items) => items.first().map(expr_line).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutron_core::HeapObject;

    fn compile(program: Vec<Stmt>) -> (FunctionObj, Heap) {
        let mut heap = Heap::new();
        let interner = StringInterner::new();
        let function = {
            let compiler = Compiler::new(&mut heap, &interner, CompilerConfig::default());
            compiler.compile_program(&program).expect("program compiles")
        };
        (function, heap)
    }

    #[test]
    fn empty_program_just_returns_nil() {
        let (function, _heap) = compile(vec![]);
        assert_eq!(function.chunk.code, vec![OpCode::Nil as u8, OpCode::Return as u8]);
    }

    #[test]
    fn var_decl_at_top_level_defines_a_global() {
        let (function, _heap) = compile(vec![Stmt::Var {
            name: "x".to_string(),
            type_annotation: None,
            init: Some(Expr::Literal(Literal::Number(1.0))),
            line: 1,
        }]);
        assert!(function.chunk.code.contains(&(OpCode::DefineGlobal as u8)));
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let mut heap = Heap::new();
        let interner = StringInterner::new();
        let compiler = Compiler::new(&mut heap, &interner, CompilerConfig::default());
        let err = compiler
            .compile_program(&[Stmt::Break(4)])
            .expect_err("break outside a loop must fail to compile");
        assert_eq!(err.kind, CompileErrorKind::UnresolvedBreak);
    }

    #[test]
    fn nested_closure_captures_outer_local_as_upvalue() {
        let program = vec![Stmt::Function(FunctionStmt {
            name: "outer".to_string(),
            params: vec![],
            body: vec![
                Stmt::Var {
                    name: "counter".to_string(),
                    type_annotation: None,
                    init: Some(Expr::Literal(Literal::Number(0.0))),
                    line: 2,
                },
                Stmt::Function(FunctionStmt {
                    name: "inner".to_string(),
                    params: vec![],
                    body: vec![Stmt::Return {
                        value: Some(Expr::Variable {
                            name: "counter".to_string(),
                            line: 4,
                        }),
                        line: 4,
                    }],
                    line: 3,
                }),
                Stmt::Return {
                    value: Some(Expr::Variable {
                        name: "inner".to_string(),
                        line: 5,
                    }),
                    line: 5,
                },
            ],
            line: 1,
        })];
        let (function, heap) = compile(program);
        assert!(function.chunk.code.contains(&(OpCode::Closure as u8)));
        let has_upvalue_get = function
            .chunk
            .constants
            .iter()
            .any(|c| matches!(c, Value::Function(id) if matches!(heap.get(*id), HeapObject::Function(f) if f.chunk.code.contains(&(OpCode::GetUpvalue as u8)))));
        assert!(has_upvalue_get, "inner function should read `counter` via GetUpvalue");
    }

    #[test]
    fn class_declaration_compiles_methods_and_binds_a_global() {
        let program = vec![Stmt::Class {
            name: "Counter".to_string(),
            methods: vec![FunctionStmt {
                name: "tick".to_string(),
                params: vec![],
                body: vec![Stmt::Return { value: None, line: 2 }],
                line: 2,
            }],
            line: 1,
        }];
        let (function, heap) = compile(program);
        let class_const = function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Class(id) => Some(*id),
                _ => None,
            })
            .expect("class constant present");
        match heap.get(class_const) {
            HeapObject::Class(class) => assert!(class.find_method("tick").is_some()),
            _ => panic!("expected a class object"),
        }
    }
}
