//! Module loading
//!
//! `require` searches `CEDARPATH` (or the default path list) for
//! `name/main.cdr`, then `name`, then `name.cdr`, evaluates the first
//! match into a fresh module and caches it by absolute path.

use crate::eval::eval_str;
use cedar_core::intern::intern;
use cedar_core::module::new_module;
use cedar_core::value::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

static CACHE: OnceLock<Mutex<HashMap<PathBuf, Value>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<PathBuf, Value>> {
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn module_error(msg: impl std::fmt::Display) -> Value {
    Value::string(format!("module-error: {msg}"))
}

/// The module search path: `CEDARPATH` when set (colon separated),
/// otherwise the working directory, the system library directory and the
/// per-user library directory.
pub fn search_paths() -> Vec<PathBuf> {
    if let Ok(path) = std::env::var("CEDARPATH") {
        return path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
    }
    let mut paths = vec![
        PathBuf::from("."),
        PathBuf::from("/usr/local/lib/cedar"),
    ];
    if let Some(home) = home::home_dir() {
        paths.push(home.join(".local/lib/cedar"));
    }
    paths
}

/// Resolve and load a module by name. Loading happens once per absolute
/// path; later requires return the cached module.
pub fn require(name: &str) -> Result<Value, Value> {
    for dir in search_paths() {
        let base = dir.join(name);
        if base.is_dir() {
            let main = base.join("main.cdr");
            if main.is_file() {
                return load_file(&main);
            }
        }
        if base.is_file() {
            return load_file(&base);
        }
        let with_ext = dir.join(format!("{name}.cdr"));
        if with_ext.is_file() {
            return load_file(&with_ext);
        }
    }
    Err(module_error(format!("module '{name}' not found")))
}

/// Load one source file as a module.
pub fn load_file(path: &Path) -> Result<Value, Value> {
    let abs = path
        .canonicalize()
        .map_err(|e| module_error(format!("cannot resolve {}: {e}", path.display())))?;

    if let Some(module) = cache()
        .lock()
        .expect("module cache poisoned")
        .get(&abs)
        .cloned()
    {
        return Ok(module);
    }

    tracing::debug!(path = %abs.display(), "loading module");
    let src = std::fs::read_to_string(&abs)
        .map_err(|e| module_error(format!("cannot read {}: {e}", abs.display())))?;

    let module = new_module(abs.display().to_string());
    module
        .as_obj()
        .and_then(|o| o.as_module())
        .expect("freshly created module")
        .def(intern("*file*"), Value::string(abs.display().to_string()));

    eval_str(&src, &module)?;

    cache()
        .lock()
        .expect("module cache poisoned")
        .insert(abs, module.clone());
    Ok(module)
}
