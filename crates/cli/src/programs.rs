//! Hand-built sample programs
//!
//! There is no lexer/parser in this workspace (out of scope for this
//! engine), so `neutronc` can't read `.ntrn` source files. What it *can*
//! do is drive the compiler and VM over a fixed AST built directly in Rust
//! — useful as a smoke test of the full pipeline and as a worked example
//! of what the compiler consumes. A real front end would sit here and
//! produce the same `Vec<Stmt>`.

use neutron_compiler::ast::{BinaryOp, Expr, FunctionStmt, Literal, Param, Stmt};

fn num(n: f64) -> Expr {
    Expr::Literal(Literal::Number(n))
}

fn var(name: &str, line: u32) -> Expr {
    Expr::Variable { name: name.to_string(), line }
}

/// Builds, instantiates, and calls a method on a small `Counter` class, then
/// returns its running total — exercises classes, `this`, and arithmetic.
pub fn counter_demo() -> Vec<Stmt> {
    let init = FunctionStmt {
        name: "init".to_string(),
        params: vec![],
        body: vec![Stmt::Expression(Expr::MemberSet {
            object: Box::new(Expr::This { line: 1 }),
            name: "total".to_string(),
            value: Box::new(num(0.0)),
            line: 1,
        })],
        line: 1,
    };
    let bump = FunctionStmt {
        name: "bump".to_string(),
        params: vec![Param { name: "by".to_string(), type_annotation: None }],
        body: vec![
            Stmt::Expression(Expr::MemberSet {
                object: Box::new(Expr::This { line: 2 }),
                name: "total".to_string(),
                value: Box::new(Expr::Binary {
                    op: BinaryOp::Add,
                    left: Box::new(Expr::Member { object: Box::new(Expr::This { line: 2 }), name: "total".to_string(), line: 2 }),
                    right: Box::new(var("by", 2)),
                    line: 2,
                }),
                line: 2,
            }),
            Stmt::Return { value: Some(Expr::Member { object: Box::new(Expr::This { line: 2 }), name: "total".to_string(), line: 2 }), line: 2 },
        ],
        line: 2,
    };

    vec![
        Stmt::Class { name: "Counter".to_string(), methods: vec![init, bump], line: 1 },
        Stmt::Var {
            name: "c".to_string(),
            type_annotation: None,
            init: Some(Expr::Call { callee: Box::new(var("Counter", 3)), args: vec![], line: 3 }),
            line: 3,
        },
        Stmt::Expression(Expr::Call {
            callee: Box::new(Expr::Member { object: Box::new(var("c", 4)), name: "bump".to_string(), line: 4 }),
            args: vec![num(5.0)],
            line: 4,
        }),
        Stmt::Return {
            value: Some(Expr::Call {
                callee: Box::new(Expr::Member { object: Box::new(var("c", 5)), name: "bump".to_string(), line: 5 }),
                args: vec![num(10.0)],
                line: 5,
            }),
            line: 5,
        },
    ]
}

/// A body suitable for handing to the scheduler: does a bit of arithmetic
/// and returns. Standing in for a real script body until a front end exists.
pub fn worker_body(seed: f64) -> Vec<Stmt> {
    vec![Stmt::Return {
        value: Some(Expr::Binary {
            op: BinaryOp::Mul,
            left: Box::new(num(seed)),
            right: Box::new(num(2.0)),
            line: 1,
        }),
        line: 1,
    }]
}
