//! Built-in native functions
//!
//! Registered into the globals table the same way a user-defined global
//! would be, so script code can't tell a native from a scripted function by
//! how it's called — only `Value::NativeFn` vs `Value::Closure` distinguishes
//! them internally. `map`/`filter`/`reduce` re-enter the VM through
//! `NativeContext::call_value` rather than being special-cased opcodes, so
//! higher-order array built-ins reuse the ordinary call machinery instead of
//! needing their own bytecode.

use neutron_core::{
    HeapObject, NativeContext, NativeFnObj, ObjString, RuntimeError, StringError, StringErrorKind, StringInterner, Value,
};
use std::rc::Rc;

type NativeResult = Result<Value, RuntimeError>;

fn native(interner: &StringInterner, name: &str, arity: Option<usize>, func: impl Fn(&mut dyn NativeContext, &[Value]) -> NativeResult + 'static) -> (Rc<ObjString>, Value) {
    let name_rc = interner.intern(name);
    let obj = NativeFnObj {
        name: name_rc.clone(),
        arity,
        func: Rc::new(func),
    };
    (name_rc, Value::NativeFn(Rc::new(obj)))
}

fn expect_number(v: &Value, who: &str) -> Result<f64, RuntimeError> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(RuntimeError::type_error(who, "number", other.type_name())),
    }
}

fn expect_string(v: &Value, who: &str) -> Result<Rc<ObjString>, RuntimeError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(RuntimeError::type_error(who, "string", other.type_name())),
    }
}

/// Every built-in global this VM ships, paired with its interned name.
/// Installed into a fresh `Vm`'s globals table at construction time.
pub fn builtins(interner: &StringInterner) -> Vec<(Rc<ObjString>, Value)> {
    vec![
        native(interner, "len", Some(1), |ctx, args| {
            match &args[0] {
                Value::String(s) => Ok(Value::Number(s.char_len() as f64)),
                Value::Array(id) => match ctx.heap_mut().get(*id) {
                    HeapObject::Array(items) => Ok(Value::Number(items.len() as f64)),
                    _ => unreachable!(),
                },
                Value::Map(id) => match ctx.heap_mut().get(*id) {
                    HeapObject::Map(m) => Ok(Value::Number(m.entries.len() as f64)),
                    _ => unreachable!(),
                },
                other => Err(RuntimeError::type_error("len", "string, array, or map", other.type_name())),
            }
        }),
        native(interner, "type_of", Some(1), |ctx, args| {
            Ok(Value::String(ctx.interner().intern(args[0].type_name())))
        }),
        native(interner, "push", Some(2), |ctx, args| match &args[0] {
            Value::Array(id) => {
                match ctx.heap_mut().get_mut(*id) {
                    HeapObject::Array(items) => items.push(args[1].clone()),
                    _ => unreachable!(),
                }
                Ok(args[0].clone())
            }
            other => Err(RuntimeError::type_error("push", "array", other.type_name())),
        }),
        native(interner, "pop", Some(1), |ctx, args| match &args[0] {
            Value::Array(id) => match ctx.heap_mut().get_mut(*id) {
                HeapObject::Array(items) => Ok(items.pop().unwrap_or(Value::Nil)),
                _ => unreachable!(),
            },
            other => Err(RuntimeError::type_error("pop", "array", other.type_name())),
        }),
        native(interner, "keys", Some(1), |ctx, args| match &args[0] {
            Value::Map(id) => {
                let entries = match ctx.heap_mut().get(*id) {
                    HeapObject::Map(m) => m.entries.iter().map(|(k, _)| Value::String(k.clone())).collect(),
                    _ => unreachable!(),
                };
                let array_id = ctx.heap_mut().alloc(HeapObject::Array(entries));
                Ok(Value::Array(array_id))
            }
            other => Err(RuntimeError::type_error("keys", "map", other.type_name())),
        }),
        native(interner, "map", Some(2), |ctx, args| {
            let items = array_snapshot(ctx, &args[0], "map")?;
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(ctx.call_value(&args[1], &[item])?);
            }
            let id = ctx.heap_mut().alloc(HeapObject::Array(mapped));
            Ok(Value::Array(id))
        }),
        native(interner, "filter", Some(2), |ctx, args| {
            let items = array_snapshot(ctx, &args[0], "filter")?;
            let mut kept = Vec::new();
            for item in items {
                if ctx.call_value(&args[1], &[item.clone()])?.is_truthy() {
                    kept.push(item);
                }
            }
            let id = ctx.heap_mut().alloc(HeapObject::Array(kept));
            Ok(Value::Array(id))
        }),
        native(interner, "reduce", Some(3), |ctx, args| {
            let items = array_snapshot(ctx, &args[0], "reduce")?;
            let mut acc = args[2].clone();
            for item in items {
                acc = ctx.call_value(&args[1], &[acc, item])?;
            }
            Ok(acc)
        }),
        native(interner, "upper", Some(1), |ctx, args| {
            let s = expect_string(&args[0], "upper")?;
            Ok(Value::String(ctx.interner().intern(&s.as_str().to_uppercase())))
        }),
        native(interner, "lower", Some(1), |ctx, args| {
            let s = expect_string(&args[0], "lower")?;
            Ok(Value::String(ctx.interner().intern(&s.as_str().to_lowercase())))
        }),
        native(interner, "trim", Some(1), |ctx, args| {
            let s = expect_string(&args[0], "trim")?;
            Ok(Value::String(ctx.interner().intern(s.as_str().trim())))
        }),
        native(interner, "split", Some(2), |ctx, args| {
            let s = expect_string(&args[0], "split")?;
            let sep = expect_string(&args[1], "split")?;
            let parts: Vec<Value> = if sep.as_str().is_empty() {
                s.as_str().chars().map(|c| Value::String(ctx.interner().intern(&c.to_string()))).collect()
            } else {
                s.as_str().split(sep.as_str()).map(|p| Value::String(ctx.interner().intern(p))).collect()
            };
            let id = ctx.heap_mut().alloc(HeapObject::Array(parts));
            Ok(Value::Array(id))
        }),
        native(interner, "index_of", Some(2), |_ctx, args| {
            let s = expect_string(&args[0], "index_of")?;
            let needle = expect_string(&args[1], "index_of")?;
            match s.as_str().find(needle.as_str()) {
                Some(byte_idx) => Ok(Value::Number(s.as_str()[..byte_idx].chars().count() as f64)),
                None => Err(StringError::new(StringErrorKind::Search, format!("'{}' not found", needle.as_str())).into()),
            }
        }),
        native(interner, "contains", Some(2), |_ctx, args| {
            let s = expect_string(&args[0], "contains")?;
            let needle = expect_string(&args[1], "contains")?;
            Ok(Value::Bool(s.as_str().contains(needle.as_str())))
        }),
        native(interner, "char_at", Some(2), |ctx, args| {
            let s = expect_string(&args[0], "char_at")?;
            let idx = expect_number(&args[1], "char_at")? as i64;
            if idx < 0 {
                return Err(StringError::new(StringErrorKind::IndexOutOfBounds, format!("char_at: index {idx} is negative")).into());
            }
            match s.as_str().chars().nth(idx as usize) {
                Some(c) => Ok(Value::String(ctx.interner().intern(&c.to_string()))),
                None => Err(StringError::new(
                    StringErrorKind::IndexOutOfBounds,
                    format!("char_at: index {idx} out of bounds for a {}-character string", s.char_len()),
                )
                .into()),
            }
        }),
        native(interner, "slice", Some(3), |ctx, args| {
            let s = expect_string(&args[0], "slice")?;
            let start = expect_number(&args[1], "slice")? as i64;
            let end = expect_number(&args[2], "slice")? as i64;
            let len = s.char_len() as i64;
            if start < 0 || end < start || end > len {
                return Err(StringError::new(
                    StringErrorKind::Slice,
                    format!("slice: range {start}..{end} is out of bounds for a {len}-character string"),
                )
                .into());
            }
            let sliced: String = s.as_str().chars().skip(start as usize).take((end - start) as usize).collect();
            Ok(Value::String(ctx.interner().intern(&sliced)))
        }),
        native(interner, "byte_len", Some(1), |_ctx, args| {
            let s = expect_string(&args[0], "byte_len")?;
            Ok(Value::Number(s.byte_len() as f64))
        }),
        native(interner, "char_len", Some(1), |_ctx, args| {
            let s = expect_string(&args[0], "char_len")?;
            Ok(Value::Number(s.char_len() as f64))
        }),
    ]
}

fn array_snapshot(ctx: &mut dyn NativeContext, value: &Value, who: &str) -> Result<Vec<Value>, RuntimeError> {
    match value {
        Value::Array(id) => match ctx.heap_mut().get(*id) {
            HeapObject::Array(items) => Ok(items.clone()),
            _ => unreachable!(),
        },
        other => Err(RuntimeError::type_error(who, "array", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutron_core::Heap;

    struct DummyCtx {
        heap: Heap,
        interner: StringInterner,
    }

    impl NativeContext for DummyCtx {
        fn heap_mut(&mut self) -> &mut Heap {
            &mut self.heap
        }
        fn interner(&self) -> &StringInterner {
            &self.interner
        }
        fn call_value(&mut self, _callee: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
            unimplemented!("not exercised by these tests")
        }
    }

    #[test]
    fn len_reports_array_length() {
        let interner = StringInterner::new();
        let mut ctx = DummyCtx { heap: Heap::new(), interner: StringInterner::new() };
        let id = ctx.heap.alloc(HeapObject::Array(vec![Value::Number(1.0), Value::Number(2.0)]));
        let (_, len_fn) = builtins(&interner).into_iter().find(|(n, _)| n.as_str() == "len").unwrap();
        if let Value::NativeFn(f) = len_fn {
            let result = (f.func)(&mut ctx, &[Value::Array(id)]).unwrap();
            assert_eq!(result, Value::Number(2.0));
        } else {
            panic!("expected native fn");
        }
    }
}
