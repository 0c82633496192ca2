//! Insertion-ordered dictionaries
//!
//! Keys are arbitrary values compared with value-level hash and equality.
//! Entries keep their insertion order for iteration; a hash index over the
//! entry list makes lookup cheap.

use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<u64, Vec<usize>>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, key: &Value) -> Option<usize> {
        let slots = self.index.get(&key.hash())?;
        slots
            .iter()
            .copied()
            .find(|&slot| self.entries[slot].0.eq_value(key))
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.find(key).map(|slot| self.entries[slot].1.clone())
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.find(key).is_some()
    }

    /// Insert or replace. Replacement keeps the key's original position.
    pub fn set(&mut self, key: Value, value: Value) {
        match self.find(&key) {
            Some(slot) => self.entries[slot].1 = value,
            None => {
                let slot = self.entries.len();
                self.index.entry(key.hash()).or_default().push(slot);
                self.entries.push((key, value));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut d = Dict::new();
        d.set(Value::Int(1), Value::string("one"));
        d.set(Value::string("two"), Value::Int(2));
        assert_eq!(d.get(&Value::Int(1)), Some(Value::string("one")));
        assert_eq!(d.get(&Value::string("two")), Some(Value::Int(2)));
        assert_eq!(d.get(&Value::Int(3)), None);
    }

    #[test]
    fn replace_keeps_position() {
        let mut d = Dict::new();
        d.set(Value::Int(1), Value::Int(10));
        d.set(Value::Int(2), Value::Int(20));
        d.set(Value::Int(1), Value::Int(11));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(d.get(&Value::Int(1)), Some(Value::Int(11)));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn iteration_is_insertion_ordered() {
        let mut d = Dict::new();
        for i in (0..10).rev() {
            d.set(Value::Int(i), Value::Int(i * i));
        }
        let keys: Vec<_> = d.keys().cloned().collect();
        let expected: Vec<_> = (0..10).rev().map(Value::Int).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn structural_keys() {
        let mut d = Dict::new();
        let k1 = Value::list_from(&[Value::Int(1), Value::Int(2)]);
        let k2 = Value::list_from(&[Value::Int(1), Value::Int(2)]);
        d.set(k1, Value::string("pair"));
        assert_eq!(d.get(&k2), Some(Value::string("pair")));
    }
}
