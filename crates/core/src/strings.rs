//! ObjString - interned, reference-counted string data
//!
//! Strings are interned into a process-wide table keyed by byte content so
//! that two `ObjString`s with equal bytes share the same allocation. Equality
//! and hashing use pointer identity (`Rc::ptr_eq`) once interned, matching the
//! "equality between strings by identity after interning" rule.
//!
//! Unlike an arena-or-global string type that tracks allocation source for
//! FFI-shared strands, each Neutron process owns a single VM and never
//! shares raw string pointers across threads, so a plain `Rc<ObjString>`
//! behind a `Mutex`-guarded intern table is sufficient and avoids `unsafe`.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Mutex;

/// FNV-1a hash, cached on the string so repeated map lookups are O(1).
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[derive(Debug)]
pub struct ObjString {
    bytes: Box<str>,
    hash: u64,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.bytes
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn char_len(&self) -> usize {
        self.bytes.chars().count()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for ObjString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bytes)
    }
}

// Content equality is used only while building the intern table; once
// interned, callers compare the `Rc<ObjString>` pointers directly.
impl PartialEq for ObjString {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}
impl Eq for ObjString {}

impl Hash for ObjString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Process-wide intern table. One instance lives on each VM/Process so that
/// processes never contend on a shared global lock, matching each process's
/// heap isolation at the string level instead of bump allocation.
#[derive(Default)]
pub struct StringInterner {
    table: Mutex<HashMap<Box<str>, Rc<ObjString>>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning the shared handle. Two calls with equal bytes
    /// return pointer-identical `Rc`s.
    pub fn intern(&self, text: &str) -> Rc<ObjString> {
        let mut table = self.table.lock().expect("string interner poisoned");
        if let Some(existing) = table.get(text) {
            return Rc::clone(existing);
        }
        let obj = Rc::new(ObjString {
            bytes: text.into(),
            hash: fnv1a(text.as_bytes()),
        });
        table.insert(text.into(), Rc::clone(&obj));
        obj
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("string interner poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_shares_allocation() {
        let interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_content_not_shared() {
        let interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("world");
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn byte_and_char_len_differ_for_multibyte() {
        let interner = StringInterner::new();
        let s = interner.intern("café");
        assert_eq!(s.char_len(), 4);
        assert_eq!(s.byte_len(), 5);
    }

    #[test]
    fn hash_is_stable() {
        let interner = StringInterner::new();
        let s = interner.intern("stable");
        assert_eq!(s.hash(), fnv1a(b"stable"));
    }
}
