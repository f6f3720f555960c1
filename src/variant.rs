//! Module `variant` implements the dynamic, type-tagged value container
//! used for configuration trees, query/data arguments, and (conceptually)
//! cross-language boundary marshalling.
//!
//! Grounded on the original `otama_variant.cpp`/`otama_variant.h`, which
//! allocate every [`Variant`] from a pool attached to one arena and free
//! them all at once when the arena is destroyed. The safe-Rust port
//! keeps the "one lock per arena, not per value" concurrency model —
//! operations on a single arena are serialized by a reentrant lock held
//! by the arena — by storing every value in one
//! [`parking_lot::ReentrantMutex`]-guarded slab and handing callers back
//! lightweight handles rather than raw references. See DESIGN.md for the
//! one place this necessarily diverges from the C original: a [`Variant`]
//! handle that outlives its [`Arena`] keeps the arena's storage alive
//! (via `Arc`) instead of dangling, because safe Rust has no way to
//! express "this pointer becomes invalid after this call" without
//! unsafe code.

use parking_lot::ReentrantMutex;
use std::{cell::RefCell, collections::HashMap, fmt, sync::Arc};

/// Opaque pointer payload. The facade never dereferences this; it is an
/// address-as-integer value, or a handle into caller-owned memory (e.g.
/// a raw feature handle, or a pre-decoded image struct).
pub type Pointer = usize;

#[derive(Clone)]
enum Data {
    Null,
    Int(i64),
    Float(f32),
    String(String),
    Binary { bytes: Vec<u8>, owned: bool },
    Pointer(Pointer),
    Array(Vec<usize>),
    Hash(HashMap<String, usize>),
}

struct ArenaInner {
    slab: ReentrantMutex<RefCell<Vec<Data>>>,
}

/// Owns every [`Variant`] allocated from it. Dropping the arena drops the
/// backing slab; individual values have no standalone free.
#[derive(Clone)]
pub struct Arena(Arc<ArenaInner>);

impl Arena {
    pub fn new() -> Arena {
        Arena(Arc::new(ArenaInner {
            slab: ReentrantMutex::new(RefCell::new(Vec::new())),
        }))
    }

    fn alloc(&self, data: Data) -> Variant {
        let guard = self.0.slab.lock();
        let mut slab = guard.borrow_mut();
        slab.push(data);
        let key = slab.len() - 1;
        Variant {
            arena: self.0.clone(),
            key,
        }
    }

    pub fn null(&self) -> Variant {
        self.alloc(Data::Null)
    }

    pub fn int(&self, v: i64) -> Variant {
        self.alloc(Data::Int(v))
    }

    pub fn float(&self, v: f32) -> Variant {
        self.alloc(Data::Float(v))
    }

    pub fn string<S: Into<String>>(&self, v: S) -> Variant {
        self.alloc(Data::String(v.into()))
    }

    pub fn binary_owned(&self, bytes: Vec<u8>) -> Variant {
        self.alloc(Data::Binary { bytes, owned: true })
    }

    pub fn binary_borrowed(&self, bytes: &[u8]) -> Variant {
        self.alloc(Data::Binary {
            bytes: bytes.to_vec(),
            owned: false,
        })
    }

    pub fn pointer(&self, p: Pointer) -> Variant {
        self.alloc(Data::Pointer(p))
    }

    pub fn array(&self) -> Variant {
        self.alloc(Data::Array(Vec::new()))
    }

    pub fn hash(&self) -> Variant {
        self.alloc(Data::Hash(HashMap::new()))
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

/// A handle into an [`Arena`]-owned value. Cheap to clone (an `Arc` bump
/// plus an index); all mutation goes through the arena's single lock.
#[derive(Clone)]
pub struct Variant {
    arena: Arc<ArenaInner>,
    key: usize,
}

impl Variant {
    fn with_data<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Data) -> R,
    {
        let guard = self.arena.slab.lock();
        let slab = guard.borrow();
        f(&slab[self.key])
    }

    fn with_data_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Data) -> R,
    {
        let guard = self.arena.slab.lock();
        let mut slab = guard.borrow_mut();
        f(&mut slab[self.key])
    }

    fn child(&self, key: usize) -> Variant {
        Variant {
            arena: self.arena.clone(),
            key,
        }
    }

    /// Allocate a new value from the same arena this value belongs to.
    fn alloc_sibling(&self, data: Data) -> Variant {
        let guard = self.arena.slab.lock();
        let mut slab = guard.borrow_mut();
        slab.push(data);
        let key = slab.len() - 1;
        Variant {
            arena: self.arena.clone(),
            key,
        }
    }

    pub fn is_null(&self) -> bool {
        self.with_data(|d| matches!(d, Data::Null))
    }

    pub fn is_array(&self) -> bool {
        self.with_data(|d| matches!(d, Data::Array(_)))
    }

    pub fn is_hash(&self) -> bool {
        self.with_data(|d| matches!(d, Data::Hash(_)))
    }

    /// `array_at(i)` auto-grows to index `i`, creating intermediate null
    /// entries, and returns the (possibly freshly-created) element.
    pub fn array_at(&self, i: usize) -> Variant {
        let null_key = self.alloc_sibling(Data::Null).key;
        self.with_data_mut(|d| match d {
            Data::Array(items) => {
                while items.len() <= i {
                    if items.len() == i {
                        items.push(null_key);
                    } else {
                        let pad = self.alloc_sibling(Data::Null);
                        items.push(pad.key);
                    }
                }
            }
            _ => panic!("array_at called on non-array variant"),
        });
        self.with_data(|d| match d {
            Data::Array(items) => self.child(items[i]),
            _ => unreachable!(),
        })
    }

    /// One past the highest index ever assigned via `array_at`.
    pub fn array_count(&self) -> usize {
        self.with_data(|d| match d {
            Data::Array(items) => items.len(),
            _ => 0,
        })
    }

    pub fn array_push(&self, value: Variant) {
        assert!(Arc::ptr_eq(&self.arena, &value.arena), "cross-arena push");
        self.with_data_mut(|d| match d {
            Data::Array(items) => items.push(value.key),
            _ => panic!("array_push called on non-array variant"),
        });
    }

    /// `hash_at(k)` auto-creates a Null entry for a missing key.
    pub fn hash_at(&self, k: &str) -> Variant {
        let existing = self.with_data(|d| match d {
            Data::Hash(map) => map.get(k).copied(),
            _ => panic!("hash_at called on non-hash variant"),
        });
        let key = match existing {
            Some(key) => key,
            None => {
                let fresh = self.alloc_sibling(Data::Null);
                self.with_data_mut(|d| match d {
                    Data::Hash(map) => {
                        map.insert(k.to_string(), fresh.key);
                    }
                    _ => unreachable!(),
                });
                fresh.key
            }
        };
        self.child(key)
    }

    pub fn hash_set(&self, k: &str, value: Variant) {
        assert!(Arc::ptr_eq(&self.arena, &value.arena), "cross-arena insert");
        self.with_data_mut(|d| match d {
            Data::Hash(map) => {
                map.insert(k.to_string(), value.key);
            }
            _ => panic!("hash_set called on non-hash variant"),
        });
    }

    pub fn hash_contains(&self, k: &str) -> bool {
        self.with_data(|d| match d {
            Data::Hash(map) => map.contains_key(k),
            _ => false,
        })
    }

    pub fn hash_keys(&self) -> Vec<String> {
        self.with_data(|d| match d {
            Data::Hash(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Int→value, Float→truncation, String→`strtoll`-style base-10 parse
    /// (0 on failure), Pointer→address as integer, other→0.
    pub fn to_int(&self) -> i64 {
        self.with_data(|d| match d {
            Data::Int(v) => *v,
            Data::Float(v) => *v as i64,
            Data::String(s) => parse_leading_i64(s),
            Data::Pointer(p) => *p as i64,
            Data::Null | Data::Binary { .. } | Data::Array(_) | Data::Hash(_) => 0,
        })
    }

    /// Int→cast, Float→value, String→`strtod`-style parse (0 on
    /// failure), other→0.
    pub fn to_float(&self) -> f32 {
        self.with_data(|d| match d {
            Data::Int(v) => *v as f32,
            Data::Float(v) => *v,
            Data::String(s) => s.trim().parse::<f32>().unwrap_or(0.0),
            Data::Null | Data::Binary { .. } | Data::Pointer(_) | Data::Array(_) | Data::Hash(_) => {
                0.0
            }
        })
    }

    /// Deterministic lexical form. Primitives use a fixed textual
    /// rendering; binary blobs that are not all-printable (or contain a
    /// NUL) render as a hex dump; composite values render as a typed
    /// stub carrying their arena slot, mirroring the original's
    /// `ARRAY(ptr)`-style debug strings.
    pub fn to_string_value(&self) -> String {
        self.with_data(|d| match d {
            Data::Null => "".to_string(),
            Data::Int(v) => format!("{}", v),
            Data::Float(v) => format!("{:E}", v),
            Data::String(s) => s.clone(),
            Data::Binary { bytes, .. } => {
                if bytes.iter().any(|&b| b == 0 || !b.is_ascii_graphic() && b != b' ') {
                    let mut s = String::with_capacity(bytes.len() * 2);
                    for b in bytes {
                        s.push_str(&format!("{:02x}", b));
                    }
                    s
                } else {
                    String::from_utf8_lossy(bytes).into_owned()
                }
            }
            Data::Pointer(p) => format!("POINTER({:#x})", p),
            Data::Array(items) => format!("ARRAY({})", items.len()),
            Data::Hash(map) => format!("HASH({})", map.len()),
        })
    }

    /// 0/empty/false/off/null → false; otherwise → true. The strings
    /// "true"/"on" (case-insensitive) are explicitly true.
    pub fn to_bool(&self) -> bool {
        self.with_data(|d| match d {
            Data::Null => false,
            Data::Int(v) => *v != 0,
            Data::Float(v) => *v != 0.0,
            Data::String(s) => {
                let lower = s.to_lowercase();
                match lower.as_str() {
                    "" | "0" | "false" | "off" | "null" => false,
                    "true" | "on" => true,
                    _ => true,
                }
            }
            Data::Binary { bytes, .. } => !bytes.is_empty(),
            Data::Pointer(p) => *p != 0,
            Data::Array(items) => !items.is_empty(),
            Data::Hash(map) => !map.is_empty(),
        })
    }

    pub fn as_binary(&self) -> Option<Vec<u8>> {
        self.with_data(|d| match d {
            Data::Binary { bytes, .. } => Some(bytes.clone()),
            _ => None,
        })
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Variant({})", self.to_string_value())
    }
}

fn parse_leading_i64(s: &str) -> i64 {
    let trimmed = s.trim();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let start_digits = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start_digits {
        return 0;
    }
    trimmed[..end].parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod variant_test {
    use super::*;

    #[test]
    fn test_array_at_auto_grows_with_nulls() {
        let arena = Arena::new();
        let arr = arena.array();
        let v = arr.array_at(3);
        v.with_data(|d| assert!(matches!(d, Data::Null)));
        assert_eq!(arr.array_count(), 4);
        for i in 0..3 {
            assert!(arr.array_at(i).is_null());
        }
    }

    #[test]
    fn test_hash_at_auto_creates_null() {
        let arena = Arena::new();
        let h = arena.hash();
        assert!(!h.hash_contains("missing"));
        let v = h.hash_at("missing");
        assert!(v.is_null());
        assert!(h.hash_contains("missing"));
    }

    #[test]
    fn test_to_int_conversions() {
        let arena = Arena::new();
        assert_eq!(arena.int(42).to_int(), 42);
        assert_eq!(arena.float(3.9).to_int(), 3);
        assert_eq!(arena.string("123abc").to_int(), 123);
        assert_eq!(arena.string("notanumber").to_int(), 0);
        assert_eq!(arena.null().to_int(), 0);
    }

    #[test]
    fn test_to_bool_conversions() {
        let arena = Arena::new();
        assert!(!arena.null().to_bool());
        assert!(!arena.string("off").to_bool());
        assert!(!arena.string("false").to_bool());
        assert!(arena.string("on").to_bool());
        assert!(arena.string("true").to_bool());
        assert!(arena.string("TRUE").to_bool());
        assert!(arena.int(1).to_bool());
        assert!(!arena.int(0).to_bool());
    }

    #[test]
    fn test_to_string_binary_hex_dump_for_nul() {
        let arena = Arena::new();
        let v = arena.binary_owned(vec![0u8, 1, 2]);
        assert_eq!(v.to_string_value(), "000102");
    }

    #[test]
    fn test_to_string_binary_printable_is_passthrough() {
        let arena = Arena::new();
        let v = arena.binary_owned(b"hello".to_vec());
        assert_eq!(v.to_string_value(), "hello");
    }

    #[test]
    fn test_different_arenas_are_independent() {
        let a1 = Arena::new();
        let a2 = Arena::new();
        let v1 = a1.int(1);
        let v2 = a2.int(2);
        assert_eq!(v1.to_int(), 1);
        assert_eq!(v2.to_int(), 2);
    }
}
