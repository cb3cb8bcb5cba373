//! End-to-end compiler+VM scenarios
//!
//! Lexing/parsing live outside this workspace, so every program here is a
//! hand-built AST rather than source text. Each test exercises one full
//! compile-then-run round trip, the same boundary `neutron-cli` drives.

use neutron_compiler::ast::{BinaryOp, Expr, FunctionStmt, Literal, MatchArm, Param, Stmt, UnaryOp};
use neutron_compiler::{Compiler, CompilerConfig};
use neutron_core::{StringInterner, TypeTag, Value};
use neutron_vm::{Vm, VmConfig};

fn run(program: Vec<Stmt>) -> (Value, Vm) {
    let mut vm = Vm::new(StringInterner::new(), VmConfig::default());
    let (heap, interner) = vm.heap_and_interner_mut();
    let compiler = Compiler::new(heap, interner, CompilerConfig::default());
    let function = compiler.compile_program(&program).expect("program should compile");
    let result = vm.interpret(function).expect("program should run without an uncaught exception");
    (result, vm)
}

fn num(n: f64) -> Expr {
    Expr::Literal(Literal::Number(n))
}

fn var(name: &str, line: u32) -> Expr {
    Expr::Variable { name: name.to_string(), line }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, line: u32) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right), line }
}

#[test]
fn a_closure_captures_its_defining_scope_by_reference() {
    // let make_counter = function() {
    //   var count = 0;
    //   return function() { count = count + 1; return count; };
    // };
    // let counter = make_counter();
    // counter();
    // return counter();
    let inner = Stmt::Return {
        value: Some(Expr::Assign {
            name: "count".to_string(),
            value: Box::new(binary(BinaryOp::Add, var("count", 1), num(1.0), 1)),
            line: 1,
        }),
        line: 1,
    };
    let make_counter_body = vec![
        Stmt::Var { name: "count".to_string(), type_annotation: None, init: Some(num(0.0)), line: 1 },
        Stmt::Return {
            value: Some(Expr::Function { name: None, params: vec![], body: vec![inner], line: 1 }),
            line: 1,
        },
    ];
    let program = vec![
        Stmt::Var {
            name: "make_counter".to_string(),
            type_annotation: None,
            init: Some(Expr::Function { name: None, params: vec![], body: make_counter_body, line: 1 }),
            line: 1,
        },
        Stmt::Var {
            name: "counter".to_string(),
            type_annotation: None,
            init: Some(Expr::Call { callee: Box::new(var("make_counter", 2)), args: vec![], line: 2 }),
            line: 2,
        },
        Stmt::Expression(Expr::Call { callee: Box::new(var("counter", 3)), args: vec![], line: 3 }),
        Stmt::Return {
            value: Some(Expr::Call { callee: Box::new(var("counter", 4)), args: vec![], line: 4 }),
            line: 4,
        },
    ];

    let (result, _vm) = run(program);
    assert_eq!(result, Value::Number(2.0));
}

#[test]
fn class_init_sets_a_field_and_a_method_reads_it() {
    // class Point {
    //   init(x) { this.x = x; }
    //   getX() { return this.x; }
    // }
    // let p = Point(7);
    // return p.getX();
    let init = FunctionStmt {
        name: "init".to_string(),
        params: vec![Param { name: "x".to_string(), type_annotation: None }],
        body: vec![Stmt::Expression(Expr::MemberSet {
            object: Box::new(Expr::This { line: 1 }),
            name: "x".to_string(),
            value: Box::new(var("x", 1)),
            line: 1,
        })],
        line: 1,
    };
    let get_x = FunctionStmt {
        name: "getX".to_string(),
        params: vec![],
        body: vec![Stmt::Return {
            value: Some(Expr::Member { object: Box::new(Expr::This { line: 2 }), name: "x".to_string(), line: 2 }),
            line: 2,
        }],
        line: 2,
    };
    let program = vec![
        Stmt::Class { name: "Point".to_string(), methods: vec![init, get_x], line: 1 },
        Stmt::Var {
            name: "p".to_string(),
            type_annotation: None,
            init: Some(Expr::Call { callee: Box::new(var("Point", 3)), args: vec![num(7.0)], line: 3 }),
            line: 3,
        },
        Stmt::Return {
            value: Some(Expr::Call {
                callee: Box::new(Expr::Member { object: Box::new(var("p", 4)), name: "getX".to_string(), line: 4 }),
                args: vec![],
                line: 4,
            }),
            line: 4,
        },
    ];

    let (result, _vm) = run(program);
    assert_eq!(result, Value::Number(7.0));
}

#[test]
fn try_catch_recovers_from_a_thrown_value_and_runs_finally() {
    // var log = "";
    // try {
    //   throw "boom";
    // } catch (e) {
    //   log = log + e;
    // } finally {
    //   log = log + "!";
    // }
    // return log;
    let program = vec![
        Stmt::Var { name: "log".to_string(), type_annotation: None, init: Some(Expr::Literal(Literal::String(String::new()))), line: 1 },
        Stmt::Try {
            body: vec![Stmt::Throw(Expr::Literal(Literal::String("boom".to_string())), 2)],
            catch_var: Some("e".to_string()),
            catch_body: vec![Stmt::Expression(Expr::Assign {
                name: "log".to_string(),
                value: Box::new(binary(BinaryOp::Add, var("log", 3), var("e", 3), 3)),
                line: 3,
            })],
            finally: Some(vec![Stmt::Expression(Expr::Assign {
                name: "log".to_string(),
                value: Box::new(binary(BinaryOp::Add, var("log", 4), Expr::Literal(Literal::String("!".to_string())), 4)),
                line: 4,
            })]),
            line: 2,
        },
        Stmt::Return { value: Some(var("log", 5)), line: 5 },
    ];

    let (result, vm) = run(program);
    assert_eq!(result.stringify(vm.heap()), "boom!");
}

#[test]
fn a_safe_var_decl_rejects_a_mismatched_initializer() {
    // safe {
    //   var n: number = "not a number";
    // }
    let program = vec![Stmt::Safe(vec![Stmt::Var {
        name: "n".to_string(),
        type_annotation: Some(TypeTag::Number),
        init: Some(Expr::Literal(Literal::String("not a number".to_string()))),
        line: 1,
    }])];

    let mut vm = Vm::new(StringInterner::new(), VmConfig::default());
    let (heap, interner) = vm.heap_and_interner_mut();
    let compiler = Compiler::new(heap, interner, CompilerConfig::default());
    let function = compiler.compile_program(&program).expect("program should compile");
    let result = vm.interpret(function);
    assert!(result.is_err(), "assigning a string to a safe-declared number local should raise a type error");
}

#[test]
fn division_by_zero_is_an_uncaught_runtime_error_without_a_handler() {
    let program = vec![Stmt::Return { value: Some(binary(BinaryOp::Div, num(1.0), num(0.0), 1)), line: 1 }];
    let mut vm = Vm::new(StringInterner::new(), VmConfig::default());
    let (heap, interner) = vm.heap_and_interner_mut();
    let compiler = Compiler::new(heap, interner, CompilerConfig::default());
    let function = compiler.compile_program(&program).expect("program should compile");
    let err = vm.interpret(function).expect_err("division by zero should propagate as an error");
    assert_eq!(err.kind, neutron_core::RuntimeErrorKind::Uncaught);
}

#[test]
fn a_match_statement_runs_only_the_matching_arm() {
    // var result = 0;
    // match (2) {
    //   1 => { result = 10; }
    //   2 => { result = 20; }
    // }
    // return result;
    let program = vec![
        Stmt::Var { name: "result".to_string(), type_annotation: None, init: Some(num(0.0)), line: 1 },
        Stmt::Match {
            scrutinee: num(2.0),
            arms: vec![
                MatchArm {
                    pattern: num(1.0),
                    body: vec![Stmt::Expression(Expr::Assign { name: "result".to_string(), value: Box::new(num(10.0)), line: 2 })],
                },
                MatchArm {
                    pattern: num(2.0),
                    body: vec![Stmt::Expression(Expr::Assign { name: "result".to_string(), value: Box::new(num(20.0)), line: 3 })],
                },
            ],
            line: 2,
        },
        Stmt::Return { value: Some(var("result", 4)), line: 4 },
    ];

    let (result, _vm) = run(program);
    assert_eq!(result, Value::Number(20.0));
}

#[test]
fn unary_not_and_negate_compose() {
    let program = vec![Stmt::Return {
        value: Some(Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(num(0.0)), line: 1 }),
            line: 1,
        }),
        line: 1,
    }];
    let (result, _vm) = run(program);
    // -0.0 is falsy only if it were nil/false; numbers (including 0 and -0)
    // are truthy, so !(-0) is false.
    assert_eq!(result, Value::Bool(false));
}
