//! Modules
//!
//! A module is a named, mutable mapping from intern id to binding. Private
//! bindings resolve only for lookups made from the module itself; anything
//! unresolved falls through to the core module.

use crate::object::{Obj, Payload};
use crate::types;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub public: bool,
}

#[derive(Debug)]
pub struct ModuleData {
    pub name: String,
    fields: Mutex<HashMap<u32, Binding>>,
}

impl ModuleData {
    pub fn new(name: impl Into<String>) -> ModuleData {
        ModuleData {
            name: name.into(),
            fields: Mutex::new(HashMap::new()),
        }
    }

    pub fn def(&self, id: u32, value: Value) {
        self.fields
            .lock()
            .expect("module def: binding table poisoned")
            .insert(
                id,
                Binding {
                    value,
                    public: true,
                },
            );
    }

    pub fn set_private(&self, id: u32, value: Value) {
        self.fields
            .lock()
            .expect("module set_private: binding table poisoned")
            .insert(
                id,
                Binding {
                    value,
                    public: false,
                },
            );
    }

    pub fn get(&self, id: u32) -> Option<Binding> {
        self.fields
            .lock()
            .expect("module get: binding table poisoned")
            .get(&id)
            .cloned()
    }

    /// Copy this module's public bindings into `other`.
    pub fn import_into(&self, other: &ModuleData) {
        let ours: Vec<(u32, Binding)> = {
            let fields = self
                .fields
                .lock()
                .expect("module import_into: binding table poisoned");
            fields
                .iter()
                .filter(|(_, b)| b.public)
                .map(|(k, b)| (*k, b.clone()))
                .collect()
        };
        for (id, binding) in ours {
            other.def(id, binding.value);
        }
    }
}

/// Allocate a fresh module object.
pub fn new_module(name: impl Into<String>) -> Value {
    let obj = Obj::new(
        types::builtins().module_t.clone(),
        Payload::Module(ModuleData::new(name)),
    );
    Value::obj(obj)
}

static CORE: OnceLock<Value> = OnceLock::new();

/// The process-wide core module; builtin bindings live here and every
/// module-level lookup falls back to it.
pub fn core_module() -> Value {
    CORE.get_or_init(|| new_module("core")).clone()
}

/// Bind a name in the core module.
pub fn def_global(name: &str, value: Value) {
    let core = core_module();
    let data = core
        .as_obj()
        .and_then(|o| o.as_module())
        .expect("core module is a module");
    data.def(crate::intern::intern(name), value);
}

/// Resolve `id` through `module` (or straight from core when `module` is
/// nil), honoring privacy: private bindings are visible only when the
/// lookup originates from the owning module itself.
pub fn module_find(module: &Value, id: u32, from: &Value) -> Option<Value> {
    if let Some(obj) = module.as_obj() {
        if let Some(data) = obj.as_module() {
            if let Some(binding) = data.get(id) {
                let same_module = match (module.as_obj(), from.as_obj()) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    _ => false,
                };
                if binding.public || same_module {
                    return Some(binding.value);
                }
            }
            let core = core_module();
            let is_core = core
                .as_obj()
                .zip(module.as_obj())
                .is_some_and(|(a, b)| Arc::ptr_eq(a, b));
            if !is_core {
                return module_find(&core, id, from);
            }
            return None;
        }
    }
    module_find(&core_module(), id, &core_module())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;

    #[test]
    fn def_and_find() {
        let m = new_module("m-test");
        let id = intern("m-test-binding");
        m.as_obj().unwrap().as_module().unwrap().def(id, Value::Int(7));
        assert_eq!(module_find(&m, id, &m), Some(Value::Int(7)));
    }

    #[test]
    fn private_visible_only_from_owner() {
        let m = new_module("m-priv");
        let other = new_module("m-other");
        let id = intern("m-priv-binding");
        m.as_obj()
            .unwrap()
            .as_module()
            .unwrap()
            .set_private(id, Value::Int(1));
        assert_eq!(module_find(&m, id, &m), Some(Value::Int(1)));
        assert_eq!(module_find(&m, id, &other), None);
    }

    #[test]
    fn unresolved_falls_back_to_core() {
        let id = intern("m-core-fallback");
        def_global("m-core-fallback", Value::Int(99));
        let m = new_module("m-fallback");
        assert_eq!(module_find(&m, id, &m), Some(Value::Int(99)));
    }

    #[test]
    fn import_copies_public_only() {
        let a = new_module("m-import-a");
        let b = new_module("m-import-b");
        let pub_id = intern("m-import-pub");
        let priv_id = intern("m-import-priv");
        let am = a.as_obj().unwrap().as_module().unwrap();
        am.def(pub_id, Value::Int(1));
        am.set_private(priv_id, Value::Int(2));
        am.import_into(b.as_obj().unwrap().as_module().unwrap());
        let bm = b.as_obj().unwrap().as_module().unwrap();
        assert_eq!(bm.get(pub_id).map(|x| x.value), Some(Value::Int(1)));
        assert!(bm.get(priv_id).is_none());
    }
}
