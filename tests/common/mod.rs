//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::cell::Cell;

use tether::{Scripted, Vm, VmOptions};

/// A runtime with the binding layer opened; closed again on drop.
pub struct Fixture {
    pub vm: Vm,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_options(VmOptions::empty())
    }

    pub fn with_options(options: VmOptions) -> Fixture {
        let vm = Vm::with_options(options);
        tether::open(&vm).expect("open binding layer");
        Fixture { vm }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = tether::close(&self.vm);
    }
}

thread_local! {
    static CONSTRUCTS: Cell<u32> = const { Cell::new(0) };
    static DESTRUCTS: Cell<u32> = const { Cell::new(0) };
}

pub fn reset_counters() {
    CONSTRUCTS.set(0);
    DESTRUCTS.set(0);
}

pub fn note_construct() {
    CONSTRUCTS.set(CONSTRUCTS.get() + 1);
}

pub fn note_destruct() {
    DESTRUCTS.set(DESTRUCTS.get() + 1);
}

pub fn constructs() -> u32 {
    CONSTRUCTS.get()
}

pub fn destructs() -> u32 {
    DESTRUCTS.get()
}

/// A counted string container. Every way an instance can come into being
/// (construction, cloning) bumps the construct counter, and every drop bumps
/// the destruct counter, so tests can assert exact lifecycle pairing.
pub struct StringStore {
    pub stored: String,
}

impl StringStore {
    pub fn new(stored: String) -> StringStore {
        note_construct();
        StringStore { stored }
    }

    pub fn get(&self) -> String {
        self.stored.clone()
    }

    pub fn set(&mut self, value: String) {
        self.stored = value;
    }
}

impl Clone for StringStore {
    fn clone(&self) -> StringStore {
        StringStore::new(self.stored.clone())
    }
}

impl Drop for StringStore {
    fn drop(&mut self) {
        note_destruct();
    }
}

impl Scripted for StringStore {}

/// A counted container of a counted container.
pub struct NestedStore {
    pub stored: StringStore,
}

impl NestedStore {
    pub fn new(stored: StringStore) -> NestedStore {
        note_construct();
        NestedStore { stored }
    }

    pub fn get(&self) -> StringStore {
        self.stored.clone()
    }
}

impl Clone for NestedStore {
    fn clone(&self) -> NestedStore {
        NestedStore::new(self.stored.clone())
    }
}

impl Drop for NestedStore {
    fn drop(&mut self) {
        note_destruct();
    }
}

impl Scripted for NestedStore {}

pub fn nested_inner_ref(n: &NestedStore) -> &StringStore {
    &n.stored
}
