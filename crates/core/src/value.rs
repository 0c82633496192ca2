//! The value reference
//!
//! A value is a small tagged record: immediate integer, immediate double,
//! raw pointer (VM bookkeeping only), or heap object pointer where the null
//! pointer is nil. Numeric operators run inline; anything else dispatches
//! through the operand's type so user types can overload.

use crate::dict::Dict;
use crate::error::{arithmetic_error, index_error, type_error};
use crate::host;
use crate::intern::{intern, unintern};
use crate::lambda::{Lambda, NativeFn};
use crate::object::{Obj, Payload};
use crate::types::{builtins, find_field};
use crate::vector::PersistentVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// raw pointer payload for saved frame/instruction pointers; never
    /// surfaces to user code
    Ptr(usize),
    Obj(Option<Arc<Obj>>),
}

fn class_id() -> u32 {
    static ID: OnceLock<u32> = OnceLock::new();
    *ID.get_or_init(|| intern("__class__"))
}

fn addr_id() -> u32 {
    static ID: OnceLock<u32> = OnceLock::new();
    *ID.get_or_init(|| intern("__addr__"))
}

impl Value {
    pub fn nil() -> Value {
        Value::Obj(None)
    }

    pub fn obj(o: Arc<Obj>) -> Value {
        Value::Obj(Some(o))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::obj(Obj::new(builtins().string_t.clone(), Payload::Str(s.into())))
    }

    pub fn symbol(name: &str) -> Value {
        Value::obj(Obj::new(
            builtins().symbol_t.clone(),
            Payload::Symbol(intern(name)),
        ))
    }

    pub fn keyword(name: &str) -> Value {
        Value::obj(Obj::new(
            builtins().keyword_t.clone(),
            Payload::Keyword(intern(name)),
        ))
    }

    pub fn vector(v: PersistentVec) -> Value {
        Value::obj(Obj::new(builtins().vector_t.clone(), Payload::Vector(v)))
    }

    pub fn dict(d: Dict) -> Value {
        Value::obj(Obj::new(
            builtins().dict_t.clone(),
            Payload::Dict(Mutex::new(d)),
        ))
    }

    pub fn lambda(l: Lambda) -> Value {
        Value::obj(Obj::new(
            builtins().lambda_t.clone(),
            Payload::Lambda(Mutex::new(l)),
        ))
    }

    pub fn native(name: &'static str, f: NativeFn) -> Value {
        Value::lambda(Lambda::native(name, f))
    }

    pub fn cons(first: Value, rest: Value) -> Value {
        Value::obj(Obj::new(
            builtins().list_t.clone(),
            Payload::List { first, rest },
        ))
    }

    /// Build a proper list; an empty slice is nil.
    pub fn list_from(items: &[Value]) -> Value {
        let mut list = Value::nil();
        for item in items.iter().rev() {
            list = Value::cons(item.clone(), list);
        }
        list
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Obj(None))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_int() || self.is_float()
    }

    pub fn truthy(&self) -> bool {
        !self.is_nil()
    }

    pub fn as_obj(&self) -> Option<&Arc<Obj>> {
        match self {
            Value::Obj(Some(o)) => Some(o),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Result<i64, Value> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Float(f) => Ok(*f as i64),
            other => Err(type_error(format!(
                "attempt to cast non-number '{other}' to a number"
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64, Value> {
        match self {
            Value::Int(n) => Ok(*n as f64),
            Value::Float(f) => Ok(*f),
            other => Err(type_error(format!(
                "attempt to cast non-number '{other}' to a number"
            ))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Intern id of a symbol value.
    pub fn symbol_id(&self) -> Option<u32> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::Symbol(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn keyword_id(&self) -> Option<u32> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::Keyword(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.as_obj().map(|o| &o.payload), Some(Payload::List { .. }))
    }

    /// The value's type object. Immediates map to Number, nil to Nil.
    pub fn type_of(&self) -> Arc<Obj> {
        match self {
            Value::Int(_) | Value::Float(_) => builtins().number_t.clone(),
            Value::Ptr(_) => builtins().object_t.clone(),
            Value::Obj(None) => builtins().nil_t.clone(),
            Value::Obj(Some(o)) => o.ty(),
        }
    }

    pub fn type_name(&self) -> String {
        self.type_of()
            .as_type()
            .map(|t| t.name())
            .unwrap_or_else(|| "Object".to_string())
    }

    /// `first` reads cons cells directly; nil and the other builtin
    /// sequences have fixed meanings; any other type self-calls `first`.
    pub fn first(&self) -> Result<Value, Value> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::List { first, .. }) => Ok(first.clone()),
            Some(Payload::Str(s)) => Ok(match s.chars().next() {
                Some(c) => Value::string(c.to_string()),
                None => Value::nil(),
            }),
            Some(Payload::Vector(v)) => Ok(v.first().cloned().unwrap_or_else(Value::nil)),
            _ if self.is_nil() => Ok(Value::nil()),
            Some(_) => self.self_call("first", &[]),
            None => Err(type_error(format!(
                "value of type {} is not a sequence",
                self.type_name()
            ))),
        }
    }

    pub fn rest(&self) -> Result<Value, Value> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::List { rest, .. }) => Ok(rest.clone()),
            Some(Payload::Str(s)) => {
                let mut chars = s.chars();
                Ok(match chars.next() {
                    Some(_) => {
                        let rest: String = chars.collect();
                        if rest.is_empty() {
                            Value::nil()
                        } else {
                            Value::string(rest)
                        }
                    }
                    None => Value::nil(),
                })
            }
            Some(Payload::Vector(v)) => {
                if v.len() <= 1 {
                    Ok(Value::nil())
                } else {
                    let mut rest = PersistentVec::new();
                    for item in v.iter().skip(1) {
                        rest = rest.push(item.clone());
                    }
                    Ok(Value::vector(rest))
                }
            }
            _ if self.is_nil() => Ok(Value::nil()),
            Some(_) => self.self_call("rest", &[]),
            None => Err(type_error(format!(
                "value of type {} is not a sequence",
                self.type_name()
            ))),
        }
    }

    pub fn len(&self) -> Result<usize, Value> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::List { .. }) => {
                let mut n = 0;
                let mut walk = self.clone();
                while walk.is_list() {
                    n += 1;
                    walk = walk.rest()?;
                }
                Ok(n)
            }
            Some(Payload::Str(s)) => Ok(s.chars().count()),
            Some(Payload::Vector(v)) => Ok(v.len()),
            Some(Payload::Dict(d)) => Ok(d.lock().expect("dict poisoned").len()),
            _ if self.is_nil() => Ok(0),
            Some(_) => {
                let n = self.self_call("len", &[])?;
                Ok(n.as_int()?.max(0) as usize)
            }
            None => Err(type_error(format!(
                "value of type {} has no length",
                self.type_name()
            ))),
        }
    }

    /// Collect a proper list into a vec. Errors on dotted tails.
    pub fn list_items(&self) -> Result<Vec<Value>, Value> {
        let mut items = Vec::new();
        let mut walk = self.clone();
        while !walk.is_nil() {
            if !walk.is_list() {
                return Err(type_error(format!(
                    "expected a proper list, found trailing {walk}"
                )));
            }
            items.push(walk.first()?);
            walk = walk.rest()?;
        }
        Ok(items)
    }

    /// Attribute lookup: per-instance map, module bindings, then the type
    /// chain. Lambdas found on instances or types come back bound to the
    /// receiver; module bindings are returned raw.
    pub fn getattr(&self, id: u32) -> Result<Value, Value> {
        if id == class_id() {
            return Ok(Value::obj(self.type_of()));
        }
        if id == addr_id() {
            let addr = self.as_obj().map(|o| o.addr()).unwrap_or(0);
            return Ok(Value::Int(addr as i64));
        }

        if let Some(obj) = self.as_obj() {
            if let Some(v) = obj.get_attr(id) {
                return Ok(self.bind_if_method(v));
            }
            if let Some(module) = obj.as_module() {
                if let Some(binding) = module.get(id) {
                    if binding.public {
                        return Ok(binding.value);
                    }
                }
            }
        }

        match find_field(&self.type_of(), id) {
            Some(v) => Ok(self.bind_if_method(v)),
            None => Err(type_error(format!(
                "no attribute '{}' on {}",
                unintern(id),
                self.type_name()
            ))),
        }
    }

    fn bind_if_method(&self, v: Value) -> Value {
        if let Some(l) = v.as_obj().and_then(|o| o.as_lambda()) {
            let bound = l.lock().expect("lambda poisoned").bind(self.clone());
            return Value::lambda(bound);
        }
        v
    }

    pub fn setattr(&self, id: u32, value: Value) -> Result<(), Value> {
        match self.as_obj() {
            Some(obj) => {
                obj.set_attr(id, value);
                Ok(())
            }
            None => Err(type_error(format!(
                "cannot set attribute on {}",
                self.type_name()
            ))),
        }
    }

    /// Invoke the method named `name` on this value with `args`.
    pub fn self_call(&self, name: &str, args: &[Value]) -> Result<Value, Value> {
        let method = self.getattr(intern(name))?;
        if method.as_obj().and_then(|o| o.as_lambda()).is_none() {
            return Err(type_error(format!(
                "self call failed, '{name}' on {} is not a lambda",
                self.type_name()
            )));
        }
        host::host()?.call(&method, args)
    }

    /// Total hash: value for integers, bit-cast for doubles, zero for nil,
    /// structural for the builtin aggregates, identity for other heap
    /// objects unless their type defines `hash`.
    pub fn hash(&self) -> u64 {
        match self {
            Value::Int(n) => *n as u64,
            Value::Float(f) => f.to_bits(),
            Value::Ptr(p) => *p as u64,
            Value::Obj(None) => 0,
            Value::Obj(Some(o)) => match &o.payload {
                Payload::Str(s) => {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    s.hash(&mut h);
                    h.finish()
                }
                Payload::Symbol(id) => 0x5000_0000_0000_0000 | *id as u64,
                Payload::Keyword(id) => 0x6000_0000_0000_0000 | *id as u64,
                Payload::List { first, rest } => {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    first.hash().hash(&mut h);
                    rest.hash().hash(&mut h);
                    h.finish()
                }
                Payload::Vector(v) => {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    for item in v.iter() {
                        item.hash().hash(&mut h);
                    }
                    h.finish()
                }
                Payload::Dict(d) => {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    for (k, v) in d.lock().expect("dict poisoned").iter() {
                        k.hash().hash(&mut h);
                        v.hash().hash(&mut h);
                    }
                    h.finish()
                }
                Payload::Plain => {
                    let hash_id = intern("hash");
                    if find_field(&o.ty(), hash_id).is_some() {
                        if let Ok(v) = self.self_call("hash", &[]) {
                            if let Ok(n) = v.as_int() {
                                return n as u64;
                            }
                        }
                    }
                    o.addr() as u64
                }
                _ => o.addr() as u64,
            },
        }
    }

    /// Structural equality for numbers and the builtin aggregates,
    /// identity for everything else.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Ptr(a), Value::Ptr(b)) => a == b,
            (Value::Obj(None), Value::Obj(None)) => true,
            (Value::Obj(Some(a)), Value::Obj(Some(b))) => match (&a.payload, &b.payload) {
                (Payload::Str(x), Payload::Str(y)) => x == y,
                (Payload::Symbol(x), Payload::Symbol(y)) => x == y,
                (Payload::Keyword(x), Payload::Keyword(y)) => x == y,
                (
                    Payload::List { first: f1, rest: r1 },
                    Payload::List { first: f2, rest: r2 },
                ) => f1.eq_value(f2) && r1.eq_value(r2),
                (Payload::Vector(x), Payload::Vector(y)) => {
                    x.len() == y.len()
                        && x.iter().zip(y.iter()).all(|(a, b)| a.eq_value(b))
                }
                (Payload::Dict(x), Payload::Dict(y)) => {
                    let x = x.lock().expect("dict poisoned");
                    let y = y.lock().expect("dict poisoned");
                    x.len() == y.len()
                        && x.iter().all(|(k, v)| {
                            y.get(k).map(|w| w.eq_value(v)).unwrap_or(false)
                        })
                }
                _ => Arc::ptr_eq(a, b),
            },
            _ => false,
        }
    }

    /// Total ordering: numeric difference when both are numbers, hash
    /// difference otherwise.
    pub fn compare(&self, other: &Value) -> i64 {
        if self.is_number() && other.is_number() {
            let a = self.as_float().unwrap_or(0.0);
            let b = other.as_float().unwrap_or(0.0);
            return if a < b {
                -1
            } else if a > b {
                1
            } else {
                0
            };
        }
        (self.hash() as i64).wrapping_sub(other.hash() as i64)
    }

    fn binary_op(
        &self,
        other: &Value,
        name: &str,
        int_op: fn(i64, i64) -> Result<i64, Value>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Value, Value> {
        if self.is_number() && other.is_number() {
            if let (Value::Int(a), Value::Int(b)) = (self, other) {
                return int_op(*a, *b).map(Value::Int);
            }
            return Ok(Value::Float(float_op(self.as_float()?, other.as_float()?)));
        }
        if !self.is_number() {
            // user types may overload the operator
            return self.self_call(name, &[other.clone()]);
        }
        Err(type_error(format!(
            "attempt to {name} {self} and {other}"
        )))
    }

    pub fn add(&self, other: &Value) -> Result<Value, Value> {
        self.binary_op(other, "+", |a, b| Ok(a.wrapping_add(b)), |a, b| a + b)
    }

    pub fn sub(&self, other: &Value) -> Result<Value, Value> {
        self.binary_op(other, "-", |a, b| Ok(a.wrapping_sub(b)), |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, Value> {
        self.binary_op(other, "*", |a, b| Ok(a.wrapping_mul(b)), |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, Value> {
        self.binary_op(
            other,
            "/",
            |a, b| {
                if b == 0 {
                    Err(arithmetic_error("division by zero"))
                } else {
                    Ok(a.wrapping_div(b))
                }
            },
            |a, b| a / b,
        )
    }

    /// Indexed access used by the `get` builtin for non-attribute keys.
    pub fn index(&self, key: &Value) -> Result<Value, Value> {
        match self.as_obj().map(|o| &o.payload) {
            Some(Payload::Vector(v)) => {
                let i = key.as_int()?;
                if i < 0 {
                    return Err(index_error(i, v.len()));
                }
                v.get(i as usize)
                    .cloned()
                    .ok_or_else(|| index_error(i, v.len()))
            }
            Some(Payload::Str(_)) => {
                let i = key.as_int()?;
                let s = self.as_str().unwrap_or_default();
                let len = s.chars().count();
                if i < 0 || i as usize >= len {
                    return Err(index_error(i, len));
                }
                Ok(Value::string(
                    s.chars().nth(i as usize).map(String::from).unwrap_or_default(),
                ))
            }
            Some(Payload::List { .. }) => {
                let i = key.as_int()?;
                let mut walk = self.clone();
                let mut at = 0;
                while walk.is_list() {
                    if at == i {
                        return walk.first();
                    }
                    at += 1;
                    walk = walk.rest()?;
                }
                Err(index_error(i, at as usize))
            }
            _ => Err(type_error(format!("cannot index {}", self.type_name()))),
        }
    }

    pub fn to_human_string(&self) -> String {
        self.format(true)
    }

    pub fn to_repr_string(&self) -> String {
        self.format(false)
    }

    fn format(&self, human: bool) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Ptr(p) => format!("<ptr {p:#x}>"),
            Value::Obj(None) => "nil".to_string(),
            Value::Obj(Some(o)) => match &o.payload {
                Payload::Str(s) => {
                    if human {
                        s.clone()
                    } else {
                        format!("{s:?}")
                    }
                }
                Payload::Symbol(id) | Payload::Keyword(id) => unintern(*id),
                Payload::List { .. } => {
                    let mut out = String::from("(");
                    let mut walk = self.clone();
                    let mut leading = true;
                    loop {
                        let next = match walk.as_obj().map(|o| &o.payload) {
                            Some(Payload::List { first, rest }) => {
                                if !leading {
                                    out.push(' ');
                                }
                                leading = false;
                                out.push_str(&first.format(false));
                                rest.clone()
                            }
                            _ if walk.is_nil() => break,
                            _ => {
                                out.push_str(" . ");
                                out.push_str(&walk.format(false));
                                break;
                            }
                        };
                        walk = next;
                    }
                    out.push(')');
                    out
                }
                Payload::Vector(v) => {
                    let items: Vec<String> = v.iter().map(|i| i.format(false)).collect();
                    format!("[{}]", items.join(" "))
                }
                Payload::Dict(d) => {
                    let d = d.lock().expect("dict poisoned");
                    let items: Vec<String> = d
                        .iter()
                        .map(|(k, v)| format!("{} {}", k.format(false), v.format(false)))
                        .collect();
                    format!("{{{}}}", items.join(", "))
                }
                Payload::Lambda(l) => {
                    let l = l.lock().expect("lambda poisoned");
                    format!("<fn {}>", l.display_name())
                }
                Payload::Type(t) => format!("<type '{}'>", t.name()),
                Payload::Module(m) => format!("<module {}>", m.name),
                Payload::Fiber(_) => format!("<fiber {:#x}>", o.addr()),
                Payload::Channel(_) => format!("<channel {:#x}>", o.addr()),
                Payload::Plain => {
                    format!("<{} at {:#x}>", self.type_name(), o.addr())
                }
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_human_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_repr_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_value(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cons_law() {
        let a = Value::Int(1);
        let b = Value::string("two");
        let cell = Value::cons(a.clone(), b.clone());
        assert_eq!(cell.first().unwrap(), a);
        assert_eq!(cell.rest().unwrap(), b);
    }

    #[test]
    fn nil_is_total() {
        let nil = Value::nil();
        assert!(nil.is_nil());
        assert!(nil.first().unwrap().is_nil());
        assert!(nil.rest().unwrap().is_nil());
        assert_eq!(nil.hash(), 0);
        assert_eq!(nil.len().unwrap(), 0);
    }

    #[test]
    fn arithmetic_preserves_int_iff_both_int() {
        let six = Value::Int(2).add(&Value::Int(4)).unwrap();
        assert!(six.is_int());
        assert_eq!(six, Value::Int(6));

        let promoted = Value::Int(2).add(&Value::Float(0.5)).unwrap();
        assert!(promoted.is_float());
        assert_eq!(promoted, Value::Float(2.5));

        let product = Value::Float(1.5).mul(&Value::Int(2)).unwrap();
        assert_eq!(product, Value::Float(3.0));
    }

    #[test]
    fn integer_division_by_zero_throws() {
        let err = Value::Int(1).div(&Value::Int(0)).unwrap_err();
        assert!(err.to_human_string().contains("arithmetic-error"));
    }

    #[test]
    fn numeric_plus_non_number_throws() {
        let err = Value::Int(1).add(&Value::string("x")).unwrap_err();
        assert!(err.to_human_string().contains("type-error"));
    }

    #[test]
    fn float_hash_is_bit_cast() {
        assert_eq!(Value::Float(1.5).hash(), 1.5f64.to_bits());
        assert_eq!(Value::Int(7).hash(), 7);
    }

    #[test]
    fn structural_equality() {
        let a = Value::list_from(&[Value::Int(1), Value::string("x")]);
        let b = Value::list_from(&[Value::Int(1), Value::string("x")]);
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, Value::list_from(&[Value::Int(2)]));
    }

    #[test]
    fn symbols_compare_by_intern_id() {
        assert_eq!(Value::symbol("abc"), Value::symbol("abc"));
        assert_ne!(Value::symbol("abc"), Value::keyword("abc"));
    }

    #[test]
    fn numeric_ordering() {
        assert!(Value::Int(1).compare(&Value::Int(2)) < 0);
        assert!(Value::Float(3.0).compare(&Value::Int(2)) > 0);
        assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), 0);
    }

    #[test]
    fn getattr_synthetic_ids() {
        let v = Value::string("hello");
        let class = v.getattr(intern("__class__")).unwrap();
        assert!(class.as_obj().and_then(|o| o.as_type()).is_some());
        let addr = v.getattr(intern("__addr__")).unwrap();
        assert!(matches!(addr, Value::Int(n) if n != 0));
    }

    #[test]
    fn instance_attrs_shadow_type_fields() {
        let obj = Value::obj(Obj::new(builtins().object_t.clone(), Payload::Plain));
        let id = intern("value-test-attr");
        obj.setattr(id, Value::Int(5)).unwrap();
        assert_eq!(obj.getattr(id).unwrap(), Value::Int(5));
    }

    #[test]
    fn missing_attribute_throws() {
        let err = Value::Int(3).getattr(intern("value-test-missing")).unwrap_err();
        assert!(err.to_human_string().contains("no attribute"));
    }

    #[test]
    fn display_forms() {
        let l = Value::list_from(&[Value::Int(1), Value::Int(2)]);
        assert_eq!(l.to_repr_string(), "(1 2)");
        let dotted = Value::cons(Value::Int(1), Value::Int(2));
        assert_eq!(dotted.to_repr_string(), "(1 . 2)");
        assert_eq!(Value::string("hi").to_repr_string(), "\"hi\"");
        assert_eq!(Value::string("hi").to_human_string(), "hi");
        assert_eq!(Value::nil().to_repr_string(), "nil");
        assert_eq!(Value::keyword(":k").to_repr_string(), ":k");
    }

    #[test]
    fn list_items_rejects_dotted() {
        let proper = Value::list_from(&[Value::Int(1), Value::Int(2)]);
        assert_eq!(proper.list_items().unwrap().len(), 2);
        let dotted = Value::cons(Value::Int(1), Value::Int(2));
        assert!(dotted.list_items().is_err());
    }
}
