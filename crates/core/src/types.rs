//! First-class types
//!
//! Every value has a type object carrying a name, a parent list and a field
//! table. The fixed set of builtin types is registered once; `Type` and
//! `Object` are mutually bootstrapped (`Type.type == Type`, `Object` is the
//! lookup root for everything else).

use crate::channel::ChannelState;
use crate::dict::Dict;
use crate::error::{arity_error, type_error};
use crate::intern::intern;
use crate::lambda::CallContext;
use crate::lambda::Control;
use crate::object::{Obj, Payload};
use crate::value::Value;
use crate::vector::PersistentVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

#[derive(Debug)]
pub struct TypeData {
    name: Mutex<String>,
    parents: RwLock<Vec<Arc<Obj>>>,
    fields: RwLock<HashMap<u32, Value>>,
}

impl TypeData {
    pub fn new(name: impl Into<String>) -> TypeData {
        TypeData {
            name: Mutex::new(name.into()),
            parents: RwLock::new(Vec::new()),
            fields: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("type name poisoned").clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().expect("type name poisoned") = name.into();
    }

    pub fn get_field(&self, id: u32) -> Option<Value> {
        self.fields
            .read()
            .expect("type fields poisoned")
            .get(&id)
            .cloned()
    }

    pub fn set_field(&self, id: u32, value: Value) {
        self.fields
            .write()
            .expect("type fields poisoned")
            .insert(id, value);
    }

    pub fn parents(&self) -> Vec<Arc<Obj>> {
        self.parents.read().expect("type parents poisoned").clone()
    }

    pub fn add_parent(&self, parent: Arc<Obj>) {
        self.parents
            .write()
            .expect("type parents poisoned")
            .push(parent);
    }
}

/// Field lookup along the inheritance chain: own fields, then each parent
/// depth-first in declaration order (earlier parent wins), then Object.
pub fn find_field(ty: &Arc<Obj>, id: u32) -> Option<Value> {
    fn lookup(ty: &Arc<Obj>, id: u32) -> Option<Value> {
        let data = ty.as_type()?;
        if let Some(v) = data.get_field(id) {
            return Some(v);
        }
        for parent in data.parents() {
            if let Some(v) = lookup(&parent, id) {
                return Some(v);
            }
        }
        None
    }

    if let Some(v) = lookup(ty, id) {
        return Some(v);
    }
    let object_t = &builtins().object_t;
    if Arc::ptr_eq(ty, object_t) {
        return None;
    }
    object_t.as_type().and_then(|d| d.get_field(id))
}

pub struct Builtins {
    pub type_t: Arc<Obj>,
    pub object_t: Arc<Obj>,
    pub list_t: Arc<Obj>,
    pub nil_t: Arc<Obj>,
    pub number_t: Arc<Obj>,
    pub string_t: Arc<Obj>,
    pub vector_t: Arc<Obj>,
    pub dict_t: Arc<Obj>,
    pub symbol_t: Arc<Obj>,
    pub keyword_t: Arc<Obj>,
    pub lambda_t: Arc<Obj>,
    pub fiber_t: Arc<Obj>,
    pub module_t: Arc<Obj>,
    pub channel_t: Arc<Obj>,
}

static BUILTINS: OnceLock<Builtins> = OnceLock::new();

pub fn builtins() -> &'static Builtins {
    BUILTINS.get_or_init(make_builtins)
}

fn new_type(name: &str, ty: Option<Arc<Obj>>) -> Arc<Obj> {
    let obj = Obj::untyped(Payload::Type(TypeData::new(name)));
    if let Some(t) = ty {
        obj.set_ty(t);
    }
    obj
}

fn make_builtins() -> Builtins {
    // Type's type is itself; everything else hangs off it.
    let type_t = new_type("Type", None);
    type_t.set_ty(type_t.clone());

    let b = Builtins {
        object_t: new_type("Object", Some(type_t.clone())),
        list_t: new_type("List", Some(type_t.clone())),
        nil_t: new_type("Nil", Some(type_t.clone())),
        number_t: new_type("Number", Some(type_t.clone())),
        string_t: new_type("String", Some(type_t.clone())),
        vector_t: new_type("Vector", Some(type_t.clone())),
        dict_t: new_type("Dict", Some(type_t.clone())),
        symbol_t: new_type("Symbol", Some(type_t.clone())),
        keyword_t: new_type("Keyword", Some(type_t.clone())),
        lambda_t: new_type("Lambda", Some(type_t.clone())),
        fiber_t: new_type("Fiber", Some(type_t.clone())),
        module_t: new_type("Module", Some(type_t.clone())),
        channel_t: new_type("Channel", Some(type_t.clone())),
        type_t,
    };

    init_type_type(&b);
    init_object_type(&b);
    init_list_type(&b);
    init_nil_type(&b);
    init_number_type(&b);
    init_string_type(&b);
    init_vector_type(&b);
    init_dict_type(&b);
    init_symbol_type(&b);
    init_keyword_type(&b);
    init_lambda_type(&b);
    init_simple_type(&b, &b.fiber_t);
    init_simple_type(&b, &b.module_t);
    init_channel_type(&b);
    b
}

/// Bind the builtin type names into the core module. The Channel type is
/// additionally bound as `chan` so `(chan)` reads naturally.
pub fn bind_type_names() {
    let b = builtins();
    let pairs: [(&str, &Arc<Obj>); 15] = [
        ("Type", &b.type_t),
        ("Object", &b.object_t),
        ("List", &b.list_t),
        ("Nil", &b.nil_t),
        ("Number", &b.number_t),
        ("String", &b.string_t),
        ("Vector", &b.vector_t),
        ("Dict", &b.dict_t),
        ("Symbol", &b.symbol_t),
        ("Keyword", &b.keyword_t),
        ("Lambda", &b.lambda_t),
        ("Fiber", &b.fiber_t),
        ("Module", &b.module_t),
        ("Channel", &b.channel_t),
        ("chan", &b.channel_t),
    ];
    for (name, ty) in pairs {
        crate::module::def_global(name, Value::obj((*ty).clone()));
    }
}

fn want(name: &str, args: &[Value], n: usize) -> Result<(), Value> {
    // self is argv[0]; report user-visible counts without it
    if args.len() != n {
        return Err(arity_error(name, n - 1, args.len().saturating_sub(1)));
    }
    Ok(())
}

fn type_data<'a>(name: &str, v: &'a Value) -> Result<&'a TypeData, Value> {
    v.as_obj()
        .and_then(|o| o.as_type())
        .ok_or_else(|| type_error(format!("{name} requires a type")))
}

fn field_id(name: &str, v: &Value) -> Result<u32, Value> {
    v.symbol_id()
        .ok_or_else(|| type_error(format!("{name} requires a symbol field name")))
}

/// Build a native lambda value against an explicit Lambda type. The
/// `Value::native` shorthand reaches for the registry, which is off limits
/// while the registry itself is being built.
fn native_value(b: &Builtins, name: &'static str, f: crate::lambda::NativeFn) -> Value {
    Value::obj(Obj::new(
        b.lambda_t.clone(),
        Payload::Lambda(Mutex::new(crate::lambda::Lambda::native(name, f))),
    ))
}

/// Shared attributes every type object carries: printable representation,
/// its name, and the allocation hook for instances.
fn init_default_bindings(b: &Builtins, ty: &Arc<Obj>, alloc: crate::lambda::NativeFn) {
    ty.set_attr(intern("str"), native_value(b, "type-str", type_str));
    ty.set_attr(intern("repr"), native_value(b, "type-str", type_str));
    ty.set_attr(intern("name"), native_value(b, "type-name", type_name));
    ty.set_attr(intern("__alloc__"), native_value(b, "__alloc__", alloc));
}

fn type_str(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("str", args, 1)?;
    let data = type_data("str", &args[0])?;
    let addr = args[0]
        .as_obj()
        .map(|o| o.addr())
        .unwrap_or_default();
    Ok(Control::Value(Value::string(format!(
        "<type '{}' at {addr:#x}>",
        data.name()
    ))))
}

fn type_name(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("name", args, 1)?;
    Ok(Control::Value(Value::string(type_data("name", &args[0])?.name())))
}

fn type_set_field(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("set-field", args, 3)?;
    let data = type_data("set-field", &args[0])?;
    data.set_field(field_id("set-field", &args[1])?, args[2].clone());
    Ok(Control::Value(Value::nil()))
}

fn type_get_field(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get-field", args, 2)?;
    let ty = args[0]
        .as_obj()
        .ok_or_else(|| type_error("get-field requires a type"))?;
    let id = field_id("get-field", &args[1])?;
    Ok(Control::Value(find_field(ty, id).unwrap_or_else(Value::nil)))
}

fn type_add_parent(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("add-parent", args, 2)?;
    let data = type_data("add-parent", &args[0])?;
    let parent = args[1]
        .as_obj()
        .filter(|o| o.as_type().is_some())
        .ok_or_else(|| type_error("add-parent requires a type"))?;
    data.add_parent(parent.clone());
    Ok(Control::Value(Value::nil()))
}

fn type_get_parents(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get-parents", args, 1)?;
    let data = type_data("get-parents", &args[0])?;
    let mut v = PersistentVec::new();
    for p in data.parents() {
        v = v.push(Value::obj(p));
    }
    v = v.push(Value::obj(builtins().object_t.clone()));
    Ok(Control::Value(Value::vector(v)))
}

fn type_new(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("new", args, 2)?;
    let data = type_data("new", &args[0])?;
    match args[1].as_str() {
        Some(s) => data.set_name(s),
        None => {
            return Err(type_error(
                "constructor to `Type` requires a string argument as a name",
            ));
        }
    }
    Ok(Control::Value(Value::nil()))
}

/// `Type.__alloc__`: a fresh, unnamed type with the default bindings.
fn type_alloc(_args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let ty = new_type("", Some(builtins().type_t.clone()));
    init_default_bindings(builtins(), &ty, plain_alloc);
    Ok(Control::Value(Value::obj(ty)))
}

/// Default `__alloc__` for user types: a bare instance whose type is
/// stamped in by the construction protocol.
fn plain_alloc(_args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Ok(Control::Value(Value::obj(Obj::untyped(Payload::Plain))))
}

fn init_type_type(b: &Builtins) {
    init_default_bindings(b, &b.type_t, type_alloc);
    let t = b.type_t.as_type().expect("Type is a type");
    t.set_field(intern("set-field"), native_value(b, "set-field", type_set_field));
    t.set_field(intern("get-field"), native_value(b, "get-field", type_get_field));
    t.set_field(intern("add-parent"), native_value(b, "add-parent", type_add_parent));
    t.set_field(
        intern("get-parents"),
        native_value(b, "get-parents", type_get_parents),
    );
    t.set_field(intern("new"), native_value(b, "new", type_new));
}

fn obj_str(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("str", args, 1)?;
    let ty = args[0].type_of();
    let name = ty.as_type().map(|d| d.name()).unwrap_or_default();
    let addr = args[0].as_obj().map(|o| o.addr()).unwrap_or_default();
    Ok(Control::Value(Value::string(format!(
        "<{name} at {addr:#x}>"
    ))))
}

fn obj_new(_args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Ok(Control::Value(Value::nil()))
}

fn init_object_type(b: &Builtins) {
    init_default_bindings(b, &b.object_t, plain_alloc);
    let t = b.object_t.as_type().expect("Object is a type");
    t.set_field(intern("str"), native_value(b, "obj-str", obj_str));
    t.set_field(intern("repr"), native_value(b, "obj-str", obj_str));
    t.set_field(intern("new"), native_value(b, "new", obj_new));
}

fn init_simple_type(b: &Builtins, ty: &Arc<Obj>) {
    init_default_bindings(b, ty, plain_alloc);
    let t = ty.as_type().expect("builtin is a type");
    t.set_field(intern("new"), native_value(b, "new", obj_new));
}

// ---------------------------------------------------------------------------
// sequence builtins

fn seq_first(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("first", args, 1)?;
    Ok(Control::Value(args[0].first()?))
}

fn seq_rest(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("rest", args, 1)?;
    Ok(Control::Value(args[0].rest()?))
}

fn seq_len(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("len", args, 1)?;
    Ok(Control::Value(Value::Int(args[0].len()? as i64)))
}

fn list_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Ok(Control::Value(Value::list_from(args.get(1..).unwrap_or(&[]))))
}

fn list_get(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get", args, 2)?;
    let index = args[1].as_int()?;
    let mut walk = args[0].clone();
    let mut seen = 0i64;
    while !walk.is_nil() {
        if seen == index {
            return Ok(Control::Value(walk.first()?));
        }
        seen += 1;
        walk = walk.rest()?;
    }
    Err(crate::error::index_error(index, seen as usize))
}

fn list_put(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("put", args, 2)?;
    Ok(Control::Value(Value::cons(args[1].clone(), args[0].clone())))
}

fn init_list_type(b: &Builtins) {
    init_default_bindings(b, &b.list_t, list_alloc);
    let t = b.list_t.as_type().expect("List is a type");
    t.set_field(intern("first"), native_value(b, "first", seq_first));
    t.set_field(intern("rest"), native_value(b, "rest", seq_rest));
    t.set_field(intern("len"), native_value(b, "len", seq_len));
    t.set_field(intern("get"), native_value(b, "get", list_get));
    t.set_field(intern("put"), native_value(b, "put", list_put));
    t.set_field(intern("peek"), native_value(b, "peek", seq_first));
    t.set_field(intern("pop"), native_value(b, "pop", seq_rest));
}

fn nil_alloc(_args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Ok(Control::Value(Value::nil()))
}

fn init_nil_type(b: &Builtins) {
    init_default_bindings(b, &b.nil_t, nil_alloc);
    let t = b.nil_t.as_type().expect("Nil is a type");
    t.set_field(intern("new"), native_value(b, "new", obj_new));
    t.set_field(intern("first"), native_value(b, "first", seq_first));
    t.set_field(intern("rest"), native_value(b, "rest", seq_rest));
    t.set_field(intern("len"), native_value(b, "len", seq_len));
}

fn number_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    match args.get(1) {
        Some(v) if v.is_number() => Ok(Control::Value(v.clone())),
        Some(other) => Err(type_error(format!(
            "Number constructor requires a number, given {other}"
        ))),
        None => Ok(Control::Value(Value::Int(0))),
    }
}

fn init_number_type(b: &Builtins) {
    init_default_bindings(b, &b.number_t, number_alloc);
    let t = b.number_t.as_type().expect("Number is a type");
    t.set_field(intern("new"), native_value(b, "new", obj_new));
}

fn string_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let mut s = String::new();
    for part in args.get(1..).unwrap_or(&[]) {
        s.push_str(&part.to_human_string());
    }
    Ok(Control::Value(Value::string(s)))
}

fn string_get(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get", args, 2)?;
    let s = args[0]
        .as_str()
        .ok_or_else(|| type_error("get requires a string receiver"))?;
    let index = args[1].as_int()?;
    let len = s.chars().count();
    if index < 0 || index as usize >= len {
        return Err(crate::error::index_error(index, len));
    }
    let ch = s.chars().nth(index as usize).map(String::from).unwrap_or_default();
    Ok(Control::Value(Value::string(ch)))
}

fn init_string_type(b: &Builtins) {
    init_default_bindings(b, &b.string_t, string_alloc);
    let t = b.string_t.as_type().expect("String is a type");
    t.set_field(intern("first"), native_value(b, "first", seq_first));
    t.set_field(intern("rest"), native_value(b, "rest", seq_rest));
    t.set_field(intern("len"), native_value(b, "len", seq_len));
    t.set_field(intern("get"), native_value(b, "get", string_get));
}

fn vector_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Ok(Control::Value(Value::vector(PersistentVec::from_slice(
        args.get(1..).unwrap_or(&[]),
    ))))
}

fn vector_of<'a>(name: &str, v: &'a Value) -> Result<&'a PersistentVec, Value> {
    match v.as_obj().map(|o| &o.payload) {
        Some(Payload::Vector(pv)) => Ok(pv),
        _ => Err(type_error(format!("{name} requires a vector"))),
    }
}

fn vector_get(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get", args, 2)?;
    let v = vector_of("get", &args[0])?;
    let index = args[1].as_int()?;
    if index < 0 {
        return Err(crate::error::index_error(index, v.len()));
    }
    match v.get(index as usize) {
        Some(item) => Ok(Control::Value(item.clone())),
        None => Err(crate::error::index_error(index, v.len())),
    }
}

fn vector_set(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("set", args, 3)?;
    let v = vector_of("set", &args[0])?;
    let index = args[1].as_int()?;
    if index < 0 {
        return Err(crate::error::index_error(index, v.len()));
    }
    match v.set(index as usize, args[2].clone()) {
        Some(updated) => Ok(Control::Value(Value::vector(updated))),
        None => Err(crate::error::index_error(index, v.len())),
    }
}

fn vector_put(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("put", args, 2)?;
    let v = vector_of("put", &args[0])?;
    Ok(Control::Value(Value::vector(v.push(args[1].clone()))))
}

fn vector_pop(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("pop", args, 1)?;
    let v = vector_of("pop", &args[0])?;
    match v.pop() {
        Some((rest, _)) => Ok(Control::Value(Value::vector(rest))),
        None => Err(crate::error::index_error(0, 0)),
    }
}

fn vector_peek(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("peek", args, 1)?;
    let v = vector_of("peek", &args[0])?;
    Ok(Control::Value(v.peek().cloned().unwrap_or_else(Value::nil)))
}

fn init_vector_type(b: &Builtins) {
    init_default_bindings(b, &b.vector_t, vector_alloc);
    let t = b.vector_t.as_type().expect("Vector is a type");
    t.set_field(intern("first"), native_value(b, "first", seq_first));
    t.set_field(intern("rest"), native_value(b, "rest", seq_rest));
    t.set_field(intern("len"), native_value(b, "len", seq_len));
    t.set_field(intern("get"), native_value(b, "get", vector_get));
    t.set_field(intern("set"), native_value(b, "set", vector_set));
    t.set_field(intern("put"), native_value(b, "put", vector_put));
    t.set_field(intern("pop"), native_value(b, "pop", vector_pop));
    t.set_field(intern("peek"), native_value(b, "peek", vector_peek));
}

fn dict_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let pairs = args.get(1..).unwrap_or(&[]);
    if pairs.len() % 2 != 0 {
        return Err(type_error("Dict requires an even number of arguments"));
    }
    let mut d = Dict::new();
    for kv in pairs.chunks(2) {
        d.set(kv[0].clone(), kv[1].clone());
    }
    Ok(Control::Value(Value::dict(d)))
}

fn dict_of<'a>(name: &str, v: &'a Value) -> Result<&'a Mutex<Dict>, Value> {
    match v.as_obj().map(|o| &o.payload) {
        Some(Payload::Dict(d)) => Ok(d),
        _ => Err(type_error(format!("{name} requires a dict"))),
    }
}

fn dict_get(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("get", args, 2)?;
    let d = dict_of("get", &args[0])?.lock().expect("dict poisoned");
    Ok(Control::Value(d.get(&args[1]).unwrap_or_else(Value::nil)))
}

fn dict_set(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("set", args, 3)?;
    dict_of("set", &args[0])?
        .lock()
        .expect("dict poisoned")
        .set(args[1].clone(), args[2].clone());
    Ok(Control::Value(args[0].clone()))
}

fn dict_keys(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("keys", args, 1)?;
    let d = dict_of("keys", &args[0])?.lock().expect("dict poisoned");
    let keys: Vec<Value> = d.keys().cloned().collect();
    Ok(Control::Value(Value::list_from(&keys)))
}

fn init_dict_type(b: &Builtins) {
    init_default_bindings(b, &b.dict_t, dict_alloc);
    let t = b.dict_t.as_type().expect("Dict is a type");
    t.set_field(intern("get"), native_value(b, "get", dict_get));
    t.set_field(intern("set"), native_value(b, "set", dict_set));
    t.set_field(intern("keys"), native_value(b, "keys", dict_keys));
    t.set_field(intern("len"), native_value(b, "len", seq_len));
}

fn symbol_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    match args.get(1) {
        Some(v) => Ok(Control::Value(Value::symbol(&v.to_human_string()))),
        None => Err(arity_error("Symbol", 1, 0)),
    }
}

fn init_symbol_type(b: &Builtins) {
    init_default_bindings(b, &b.symbol_t, symbol_alloc);
}

fn keyword_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    match args.get(1) {
        Some(v) => {
            let mut s = v.to_human_string();
            if !s.starts_with(':') {
                s.insert(0, ':');
            }
            Ok(Control::Value(Value::keyword(&s)))
        }
        None => Err(arity_error("Keyword", 1, 0)),
    }
}

fn init_keyword_type(b: &Builtins) {
    init_default_bindings(b, &b.keyword_t, keyword_alloc);
}

fn lambda_alloc(_args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    Err(type_error("explicit construction of lambda undefined"))
}

fn lambda_str(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    want("str", args, 1)?;
    let text = match args[0].as_obj().and_then(|o| o.as_lambda()) {
        Some(l) => {
            let l = l.lock().expect("lambda poisoned");
            let native = l.is_native();
            format!(
                "<fn {} {{:native {}}}>",
                l.display_name(),
                if native { "true" } else { "false" }
            )
        }
        None => return Err(type_error("str requires a lambda")),
    };
    Ok(Control::Value(Value::string(text)))
}

fn init_lambda_type(b: &Builtins) {
    init_default_bindings(b, &b.lambda_t, lambda_alloc);
    let t = b.lambda_t.as_type().expect("Lambda is a type");
    t.set_field(intern("str"), native_value(b, "lambda-str", lambda_str));
    t.set_field(intern("repr"), native_value(b, "lambda-str", lambda_str));
}

fn channel_alloc(args: &[Value], _ctx: &mut CallContext) -> Result<Control, Value> {
    let capacity = match args.get(1) {
        Some(v) => v.as_int()?,
        None => 0,
    };
    let obj = Obj::new(
        builtins().channel_t.clone(),
        Payload::Channel(ChannelState::new(capacity)),
    );
    Ok(Control::Value(Value::obj(obj)))
}

fn init_channel_type(b: &Builtins) {
    init_default_bindings(b, &b.channel_t, channel_alloc);
    let t = b.channel_t.as_type().expect("Channel is a type");
    t.set_field(intern("new"), native_value(b, "new", obj_new));
}

/// Instance construction: `(T arg…)` allocates through `T.__alloc__`,
/// stamps the type, runs a resolved `new` method with the instance and the
/// arguments, and returns the instance.
pub fn construct(ty_value: &Value, args: &[Value]) -> Result<Value, Value> {
    let ty_obj = ty_value
        .as_obj()
        .filter(|o| o.as_type().is_some())
        .ok_or_else(|| type_error("construction requires a type"))?;

    let alloc = ty_value.getattr(intern("__alloc__"))?;
    let instance = crate::host::host()?.call(&alloc, args)?;
    if let Some(obj) = instance.as_obj() {
        obj.set_ty(ty_obj.clone());
    }

    if let Some(ctor) = find_field(ty_obj, intern("new")) {
        let mut ctor_args = Vec::with_capacity(args.len() + 1);
        ctor_args.push(instance.clone());
        ctor_args.extend_from_slice(args);
        crate::host::host()?.call(&ctor, &ctor_args)?;
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_of_type_is_type() {
        let b = builtins();
        assert!(Arc::ptr_eq(&b.type_t.ty(), &b.type_t));
        assert!(Arc::ptr_eq(&b.list_t.ty(), &b.type_t));
    }

    #[test]
    fn field_lookup_prefers_earlier_parent() {
        let b = builtins();
        let id = intern("types-test-m");
        let p1 = new_type("P1", Some(b.type_t.clone()));
        let p2 = new_type("P2", Some(b.type_t.clone()));
        p1.as_type().unwrap().set_field(id, Value::Int(1));
        p2.as_type().unwrap().set_field(id, Value::Int(2));
        let t = new_type("T", Some(b.type_t.clone()));
        t.as_type().unwrap().add_parent(p1.clone());
        t.as_type().unwrap().add_parent(p2.clone());
        assert_eq!(find_field(&t, id), Some(Value::Int(1)));
        // an override on T itself wins
        t.as_type().unwrap().set_field(id, Value::Int(0));
        assert_eq!(find_field(&t, id), Some(Value::Int(0)));
    }

    #[test]
    fn field_lookup_reaches_nested_parents() {
        let b = builtins();
        let id = intern("types-test-nested");
        let grand = new_type("Grand", Some(b.type_t.clone()));
        grand.as_type().unwrap().set_field(id, Value::Int(42));
        let parent = new_type("Parent", Some(b.type_t.clone()));
        parent.as_type().unwrap().add_parent(grand);
        let t = new_type("T2", Some(b.type_t.clone()));
        t.as_type().unwrap().add_parent(parent);
        assert_eq!(find_field(&t, id), Some(Value::Int(42)));
    }

    #[test]
    fn object_fields_are_the_fallback() {
        let b = builtins();
        let id = intern("str");
        let t = new_type("Bare", Some(b.type_t.clone()));
        assert!(find_field(&t, id).is_some());
    }

    #[test]
    fn type_fields_update_atomically() {
        let b = builtins();
        let t = new_type("Shared", Some(b.type_t.clone()));
        let id = intern("types-test-atomic");
        let t2 = t.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..1000 {
                t2.as_type().unwrap().set_field(id, Value::Int(i));
            }
        });
        for _ in 0..1000 {
            if let Some(v) = find_field(&t, id) {
                assert!(matches!(v, Value::Int(_)));
            }
        }
        writer.join().unwrap();
    }
}
