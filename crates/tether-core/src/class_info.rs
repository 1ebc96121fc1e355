//! Per-runtime class metadata.
//!
//! One [`ClassRepresentation`] exists per bound native type per runtime
//! instance. The registry that owns them lives in the runtime's app data and
//! is torn down with it; this metadata is deliberately *not* leaked for the
//! process lifetime.

use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tether_runtime::{RegistryKey, Vm};

use crate::convert::Scripted;
use crate::error::BindError;
use crate::statistics::Statistics;
use crate::type_hash::TypeHash;

/// Runtime description of a bound class.
#[derive(Debug)]
pub struct ClassRepresentation {
    name: String,
    type_hash: TypeHash,
    /// Registry slot holding the instance metatable.
    instance_key: RegistryKey,
    /// Registry slot holding the static (class-level) metatable.
    static_key: RegistryKey,
}

impl ClassRepresentation {
    pub fn new(
        name: impl Into<String>,
        type_hash: TypeHash,
        instance_key: RegistryKey,
        static_key: RegistryKey,
    ) -> ClassRepresentation {
        ClassRepresentation {
            name: name.into(),
            type_hash,
            instance_key,
            static_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }

    pub fn instance_key(&self) -> RegistryKey {
        self.instance_key
    }

    pub fn static_key(&self) -> RegistryKey {
        self.static_key
    }
}

/// All classes bound into one runtime instance, keyed both by native type
/// and by boundary-visible name. Re-registering either is an error.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    by_type: RefCell<FxHashMap<TypeId, Rc<ClassRepresentation>>>,
    by_name: RefCell<FxHashMap<String, TypeId>>,
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry::default()
    }

    pub fn is_registered<T: Scripted>(&self) -> bool {
        self.by_type.borrow().contains_key(&TypeId::of::<T>())
    }

    pub fn is_name_registered(&self, name: &str) -> bool {
        self.by_name.borrow().contains_key(name)
    }

    pub fn register<T: Scripted>(
        &self,
        representation: Rc<ClassRepresentation>,
    ) -> Result<(), BindError> {
        let type_id = TypeId::of::<T>();
        if self.by_type.borrow().contains_key(&type_id)
            || self.by_name.borrow().contains_key(representation.name())
        {
            return Err(BindError::ClassAlreadyRegistered {
                name: representation.name().to_owned(),
            });
        }
        self.by_name
            .borrow_mut()
            .insert(representation.name().to_owned(), type_id);
        self.by_type.borrow_mut().insert(type_id, representation);
        Ok(())
    }

    pub fn representation<T: Scripted>(&self) -> Option<Rc<ClassRepresentation>> {
        self.by_type.borrow().get(&TypeId::of::<T>()).cloned()
    }

    /// Every registered representation, for teardown.
    pub fn all(&self) -> Vec<Rc<ClassRepresentation>> {
        self.by_type.borrow().values().cloned().collect()
    }
}

/// Per-runtime state owned by the binding layer, installed by `open` and
/// removed by `close`.
#[derive(Debug, Default)]
pub struct BinderState {
    pub classes: ClassRegistry,
    pub statistics: Statistics,
}

impl BinderState {
    pub fn new() -> BinderState {
        BinderState::default()
    }
}

/// Fetch the binding layer's state for a runtime, if it is open.
pub fn binder_state(vm: &Vm) -> Option<Rc<BinderState>> {
    vm.app_data::<BinderState>()
}
