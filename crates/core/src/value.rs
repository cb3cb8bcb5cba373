//! Value: what the language talks about
//!
//! A tagged union over every runtime value. Heap-resident variants carry
//! a `HeapId` into the owning Process's `Heap`; `String` and `NativeFn` are
//! `Rc`-shared since neither can participate in a cycle (an interned string
//! has no outgoing references, and a native function's captured state, if
//! any, lives on the Rust side, not in the scripted heap).

use crate::errors::RuntimeError;
use crate::heap::{Heap, HeapId, HeapObject};
use crate::strings::{ObjString, StringInterner};
use std::fmt;
use std::rc::Rc;

/// Minimal surface a native function needs back from its caller: heap
/// access to build return values, and the ability to re-enter the VM's call
/// path (needed so `map`/`filter`/`reduce` can invoke a callback `Value`
/// rather than stubbing "not implemented").
pub trait NativeContext {
    fn heap_mut(&mut self) -> &mut Heap;
    fn interner(&self) -> &StringInterner;
    fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, RuntimeError>;
}

pub type NativeFnBody = dyn Fn(&mut dyn NativeContext, &[Value]) -> Result<Value, RuntimeError>;

pub struct NativeFnObj {
    pub name: Rc<ObjString>,
    pub arity: Option<usize>,
    pub func: Rc<NativeFnBody>,
}

impl fmt::Debug for NativeFnObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFnObj").field("name", &self.name.as_str()).finish()
    }
}

impl PartialEq for NativeFnObj {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(Rc<ObjString>),
    Array(HeapId),
    Map(HeapId),
    Function(HeapId),
    Closure(HeapId),
    NativeFn(Rc<NativeFnObj>),
    Class(HeapId),
    Instance(HeapId),
    BoundMethod(HeapId),
    Module(HeapId),
    Buffer(HeapId),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Closure(_) | Value::NativeFn(_) | Value::Class(_) | Value::BoundMethod(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Function(_) | Value::Closure(_) | Value::NativeFn(_) => "function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::BoundMethod(_) => "bound_method",
            Value::Module(_) => "module",
            Value::Buffer(_) => "buffer",
        }
    }

    /// Append any `HeapId`s reachable directly from this value, for the
    /// collector's mark phase.
    pub(crate) fn heap_children(&self, into: &mut Vec<HeapId>) {
        match self {
            Value::Array(id)
            | Value::Map(id)
            | Value::Function(id)
            | Value::Closure(id)
            | Value::Class(id)
            | Value::Instance(id)
            | Value::BoundMethod(id)
            | Value::Module(id)
            | Value::Buffer(id) => into.push(*id),
            Value::Nil | Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::NativeFn(_) => {}
        }
    }

    pub fn stringify(&self, heap: &Heap) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.as_str().to_string(),
            Value::Array(id) => match heap.get(*id) {
                HeapObject::Array(items) => {
                    let parts: Vec<String> = items.iter().map(|v| v.stringify(heap)).collect();
                    format!("[{}]", parts.join(", "))
                }
                _ => unreachable!("Array HeapId must resolve to HeapObject::Array"),
            },
            Value::Map(id) => match heap.get(*id) {
                HeapObject::Map(map) => {
                    let parts: Vec<String> = map
                        .entries
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k.as_str(), v.stringify(heap)))
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                _ => unreachable!("Map HeapId must resolve to HeapObject::Map"),
            },
            Value::Function(id) => match heap.get(*id) {
                HeapObject::Function(f) => format!("<fn {}>", function_name(f)),
                _ => unreachable!(),
            },
            Value::Closure(id) => match heap.get(*id) {
                HeapObject::Closure(c) => match heap.get(c.function) {
                    HeapObject::Function(f) => format!("<fn {}>", function_name(f)),
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            Value::NativeFn(n) => format!("<native fn {}>", n.name.as_str()),
            Value::Class(id) => match heap.get(*id) {
                HeapObject::Class(c) => format!("<class {}>", c.name.as_str()),
                _ => unreachable!(),
            },
            Value::Instance(id) => match heap.get(*id) {
                HeapObject::Instance(i) => match heap.get(i.class) {
                    HeapObject::Class(c) => format!("<instance {}>", c.name.as_str()),
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            Value::BoundMethod(id) => match heap.get(*id) {
                HeapObject::BoundMethod(_) => "<bound method>".to_string(),
                _ => unreachable!(),
            },
            Value::Module(id) => match heap.get(*id) {
                HeapObject::Module(m) => format!("<module {}>", m.name.as_str()),
                _ => unreachable!(),
            },
            Value::Buffer(id) => match heap.get(*id) {
                HeapObject::Buffer(b) => format!("<buffer {} bytes>", b.len()),
                _ => unreachable!(),
            },
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn function_name(f: &crate::heap::FunctionObj) -> &str {
    f.name.as_ref().map(|s| s.as_str()).unwrap_or("anonymous")
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // Standard IEEE comparison: NaN != NaN. Interning and map-key
            // lookups treat numbers by bit value instead; see DESIGN.md.
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b) || a.as_str() == b.as_str(),
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => a == b,
            (Value::NativeFn(a), Value::NativeFn(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::BoundMethod(a), Value::BoundMethod(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert_ne!(nan, nan.clone());
    }

    #[test]
    fn nil_and_false_are_falsy() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
    }

    #[test]
    fn integral_numbers_stringify_without_decimal() {
        let heap = Heap::new();
        assert_eq!(Value::Number(3.0).stringify(&heap), "3");
        assert_eq!(Value::Number(3.5).stringify(&heap), "3.5");
    }
}
