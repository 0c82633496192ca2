//! Heap objects
//!
//! Every heap object carries a pointer to its type, a lazily created
//! per-instance attribute map, and a payload. The attribute map is an open
//! hash over intern ids with chained buckets.

use crate::channel::ChannelState;
use crate::dict::Dict;
use crate::fiber::FiberData;
use crate::lambda::Lambda;
use crate::module::ModuleData;
use crate::types::TypeData;
use crate::value::Value;
use crate::vector::PersistentVec;
use std::sync::{Arc, Mutex, OnceLock};

const INITIAL_BUCKETS: usize = 8;

/// Open-hash attribute map keyed by intern id.
#[derive(Debug, Default)]
pub struct AttrMap {
    buckets: Vec<Vec<(u32, Value)>>,
    len: usize,
}

impl AttrMap {
    pub fn new() -> Self {
        AttrMap {
            buckets: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: u32) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = &self.buckets[key as usize % self.buckets.len()];
        bucket
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&mut self, key: u32, value: Value) {
        if self.buckets.is_empty() {
            self.buckets = vec![Vec::new(); INITIAL_BUCKETS];
        }
        let idx = key as usize % self.buckets.len();
        if let Some(entry) = self.buckets[idx].iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }
        self.buckets[idx].push((key, value));
        self.len += 1;
        if self.len > self.buckets.len() {
            self.rehash(self.buckets.len() * 2);
        }
    }

    fn rehash(&mut self, size: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![Vec::new(); size]);
        for bucket in old {
            for (k, v) in bucket {
                let idx = k as usize % size;
                self.buckets[idx].push((k, v));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().map(|(k, v)| (*k, v)))
    }
}

/// The kind-specific body of a heap object.
#[derive(Debug)]
pub enum Payload {
    /// a bare instance of a user type; state lives in the attr map
    Plain,
    List {
        first: Value,
        rest: Value,
    },
    Vector(PersistentVec),
    Dict(Mutex<Dict>),
    Str(String),
    Symbol(u32),
    Keyword(u32),
    Lambda(Mutex<Lambda>),
    Module(ModuleData),
    Channel(ChannelState),
    Fiber(FiberData),
    Type(TypeData),
}

pub struct Obj {
    /// set exactly once at allocation; `Type` points at itself
    ty: OnceLock<Arc<Obj>>,
    attrs: Mutex<AttrMap>,
    pub payload: Payload,
}

// hand-written: following `ty` would loop on the self-referential Type
impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.payload {
            Payload::Plain => "instance",
            Payload::List { .. } => "list",
            Payload::Vector(_) => "vector",
            Payload::Dict(_) => "dict",
            Payload::Str(_) => "string",
            Payload::Symbol(_) => "symbol",
            Payload::Keyword(_) => "keyword",
            Payload::Lambda(_) => "lambda",
            Payload::Module(_) => "module",
            Payload::Channel(_) => "channel",
            Payload::Fiber(_) => "fiber",
            Payload::Type(_) => "type",
        };
        write!(f, "<{kind} {:#x}>", self.addr())
    }
}

impl Obj {
    pub fn new(ty: Arc<Obj>, payload: Payload) -> Arc<Obj> {
        let obj = Obj::untyped(payload);
        let _ = obj.ty.set(ty);
        obj
    }

    /// Allocation with the type left unset, for `__alloc__` hooks and the
    /// Type/Type bootstrap. The constructor protocol fills the type in.
    pub fn untyped(payload: Payload) -> Arc<Obj> {
        Arc::new(Obj {
            ty: OnceLock::new(),
            attrs: Mutex::new(AttrMap::new()),
            payload,
        })
    }

    /// The object's type. Total once allocation completed.
    pub fn ty(&self) -> Arc<Obj> {
        self.ty
            .get()
            .expect("object type read before allocation completed")
            .clone()
    }

    /// Install the type; a no-op when it was already set by the allocator.
    pub fn set_ty(&self, ty: Arc<Obj>) {
        let _ = self.ty.set(ty);
    }

    pub fn get_attr(&self, key: u32) -> Option<Value> {
        self.attrs
            .lock()
            .expect("get_attr: attr map poisoned")
            .get(key)
    }

    pub fn set_attr(&self, key: u32, value: Value) {
        self.attrs
            .lock()
            .expect("set_attr: attr map poisoned")
            .set(key, value);
    }

    pub fn addr(&self) -> usize {
        self as *const Obj as usize
    }

    pub fn as_type(&self) -> Option<&TypeData> {
        match &self.payload {
            Payload::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleData> {
        match &self.payload {
            Payload::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&ChannelState> {
        match &self.payload {
            Payload::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_fiber(&self) -> Option<&FiberData> {
        match &self.payload {
            Payload::Fiber(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_lambda(&self) -> Option<&Mutex<Lambda>> {
        match &self.payload {
            Payload::Lambda(l) => Some(l),
            _ => None,
        }
    }
}
