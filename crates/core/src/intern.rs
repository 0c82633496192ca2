//! Process-wide symbol interning
//!
//! Every distinct symbol or keyword name is stored exactly once and mapped
//! to a stable small integer id. Ids are handed out in insertion order and
//! never reused, so they are safe to cache for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

struct InternTable {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

static TABLE: OnceLock<Mutex<InternTable>> = OnceLock::new();

fn table() -> &'static Mutex<InternTable> {
    TABLE.get_or_init(|| {
        Mutex::new(InternTable {
            names: Vec::new(),
            ids: HashMap::new(),
        })
    })
}

/// Intern a string, returning its stable id. Idempotent and thread-safe.
pub fn intern(name: &str) -> u32 {
    let mut t = table()
        .lock()
        .expect("intern: table lock poisoned - a thread panicked while interning");
    if let Some(&id) = t.ids.get(name) {
        return id;
    }
    let id = t.names.len() as u32;
    t.names.push(name.to_string());
    t.ids.insert(name.to_string(), id);
    id
}

/// Look up the string stored for an id.
///
/// Ids only come from `intern`, so a miss means the caller fabricated one;
/// the name returned in that case makes the bad id visible in diagnostics.
pub fn unintern(id: u32) -> String {
    let t = table()
        .lock()
        .expect("unintern: table lock poisoned - a thread panicked while interning");
    match t.names.get(id as usize) {
        Some(s) => s.clone(),
        None => format!("#<bad-intern-id {id}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let a = intern("alpha-test-symbol");
        let b = intern("alpha-test-symbol");
        assert_eq!(a, b);
        assert_eq!(unintern(a), "alpha-test-symbol");
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let a = intern("intern-test-one");
        let b = intern("intern-test-two");
        assert_ne!(a, b);
        assert_eq!(unintern(a), "intern-test-one");
        assert_eq!(unintern(b), "intern-test-two");
    }

    #[test]
    fn intern_is_thread_safe() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| intern("intern-race-target")))
            .collect();
        let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
    }
}
