//! Tables: ordered key/value maps with an optional metatable.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use crate::value::{TableKey, Value};

/// A finalizer hook run when a userdata carrying it is released.
///
/// The hook receives the userdata's payload. It must not touch the runtime;
/// it exists solely to release the native resource behind the payload.
pub type Finalizer = dyn Fn(&mut dyn Any);

/// A boundary table.
///
/// Entries live in a `BTreeMap` so that [`Table::next`] has a stable,
/// restartable successor relation, the property the iteration primitive is
/// built on. Setting a key to nil removes the entry.
pub struct Table {
    entries: RefCell<BTreeMap<TableKey, Value>>,
    metatable: RefCell<Option<Rc<Table>>>,
    finalizer: RefCell<Option<Rc<Finalizer>>>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: RefCell::new(BTreeMap::new()),
            metatable: RefCell::new(None),
            finalizer: RefCell::new(None),
        }
    }

    /// Raw field read, bypassing any metatable. Absent keys read as nil.
    pub fn raw_get(&self, key: &TableKey) -> Value {
        self.entries
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    /// Raw field write, bypassing any metatable. Writing nil removes the key.
    pub fn raw_set(&self, key: TableKey, value: Value) {
        let mut entries = self.entries.borrow_mut();
        if value.is_nil() {
            entries.remove(&key);
        } else {
            entries.insert(key, value);
        }
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// The "next key" primitive: the first entry strictly after `prev`, or
    /// the first entry overall when `prev` is `None`. Entries inserted or
    /// removed between calls are honored; iteration is restartable but not
    /// rewindable.
    pub fn next(&self, prev: Option<&TableKey>) -> Option<(TableKey, Value)> {
        let entries = self.entries.borrow();
        let mut range = match prev {
            None => entries.range::<TableKey, _>(..),
            Some(p) => entries.range((Bound::Excluded(p.clone()), Bound::Unbounded)),
        };
        range.next().map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn metatable(&self) -> Option<Rc<Table>> {
        self.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, meta: Option<Rc<Table>>) {
        *self.metatable.borrow_mut() = meta;
    }

    /// The finalizer instances of this metatable inherit at creation time.
    pub fn finalizer(&self) -> Option<Rc<Finalizer>> {
        self.finalizer.borrow().clone()
    }

    pub fn set_finalizer(&self, finalizer: Rc<Finalizer>) {
        *self.finalizer.borrow_mut() = Some(finalizer);
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len())
            .field("has_metatable", &self.metatable.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_get_set() {
        let t = Table::new();
        t.raw_set(TableKey::str("a"), Value::Int(1));
        assert_eq!(t.raw_get(&TableKey::str("a")), Value::Int(1));
        assert_eq!(t.raw_get(&TableKey::str("b")), Value::Nil);
    }

    #[test]
    fn nil_write_removes() {
        let t = Table::new();
        t.raw_set(TableKey::Int(1), Value::Int(10));
        t.raw_set(TableKey::Int(1), Value::Nil);
        assert!(!t.contains(&TableKey::Int(1)));
        assert!(t.is_empty());
    }

    #[test]
    fn next_walks_all_entries() {
        let t = Table::new();
        t.raw_set(TableKey::Int(2), Value::Int(20));
        t.raw_set(TableKey::Int(1), Value::Int(10));
        t.raw_set(TableKey::str("z"), Value::Int(30));

        let mut seen = Vec::new();
        let mut prev = None;
        while let Some((k, _)) = t.next(prev.as_ref()) {
            seen.push(k.clone());
            prev = Some(k);
        }
        assert_eq!(seen.len(), 3);
        // Int keys sort before Str keys, and among themselves by value.
        assert_eq!(seen[0], TableKey::Int(1));
        assert_eq!(seen[1], TableKey::Int(2));
        assert_eq!(seen[2], TableKey::str("z"));
    }

    #[test]
    fn next_survives_removal_of_cursor() {
        let t = Table::new();
        t.raw_set(TableKey::Int(1), Value::Int(10));
        t.raw_set(TableKey::Int(2), Value::Int(20));

        let (first, _) = t.next(None).unwrap();
        t.raw_set(first.clone(), Value::Nil);
        let (second, _) = t.next(Some(&first)).unwrap();
        assert_eq!(second, TableKey::Int(2));
    }
}
