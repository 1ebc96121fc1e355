//! The fluent registration surface: scopes and namespaces.
//!
//! ```text
//! open(&vm)?;
//! module(&vm)?
//!     .def("name", function)?
//!     .constant("name", SOME_CONSTANT)?
//!     .scope("namespace")?
//!         .class_::<Widget>("Widget")?
//!             .constructor(Widget::new)
//!             .def("resize", Widget::resize)
//!             .def_readwrite("width", width_mut)
//!             .def_readonly("id", id_ref)
//!             .constant("MAX", 16i64)?
//!         .endclass()?
//!     .endscope()?
//! .end()?;
//! close(&vm)?;
//! ```
//!
//! A nested scope's table is created (or reopened) eagerly but only
//! installed into its parent by `endscope`. While open, a scope carries a
//! registry anchor mirrored into the table under a reserved key; `endscope`
//! clears both. Reopening the same name later, in the same chain or a new
//! `module` chain, lands in the same table.

use std::rc::Rc;

use tether_core::{
    BindError, BoundFunction, CallPolicy, Scripted, StackGuard, ToStack, binder_state,
    install_function,
};
use tether_runtime::{NativeFunction, RegistryKey, RuntimeError, Table, TableKey, Value, Vm};

use crate::registrar::ClassRegistrar;

/// Reserved key naming the namespace a scope table belongs to.
const NAMESPACE_KEY: &str = "__tether_namespace";
/// Reserved key mirroring the registry anchor while a scope is open.
const REF_KEY: &str = "__tether_ref";

/// Root scope bound to the runtime's global namespace.
///
/// Requires the binding layer to be [`open`](crate::open)ed first.
pub fn module(vm: &Vm) -> Result<Scope, BindError> {
    binder_state(vm).ok_or(BindError::NotOpen)?;
    Ok(Scope {
        vm: vm.clone(),
        table: vm.globals(),
        anchor: None,
        parent: None,
        name: None,
    })
}

/// One level of the registration tree.
pub struct Scope {
    vm: Vm,
    table: Rc<Table>,
    anchor: Option<RegistryKey>,
    parent: Option<Box<Scope>>,
    name: Option<String>,
}

impl Scope {
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub(crate) fn table(&self) -> &Rc<Table> {
        &self.table
    }

    /// Register a free function (or overload candidate) under `name`.
    pub fn def<Args, F>(self, name: &str, f: F) -> Result<Scope, BindError>
    where
        F: BoundFunction<Args>,
    {
        self.def_with(name, f, CallPolicy::Normal)
    }

    /// Register a free function with an explicit call policy.
    pub fn def_with<Args, F>(self, name: &str, f: F, policy: CallPolicy) -> Result<Scope, BindError>
    where
        F: BoundFunction<Args>,
    {
        let _guard = StackGuard::new(&self.vm, 0, 0);
        install_function(&self.table, name, f.into_marshalled(policy));
        Ok(self)
    }

    /// Register a raw native closure under `name`, bypassing marshalling.
    ///
    /// The closure sees its call frame directly (slot 1 is the first
    /// argument), pushes its results, and may raise by returning `Err`.
    /// This is the escape hatch for natives that need the runtime itself:
    /// nested calls, raw field access, custom errors.
    pub fn def_raw(
        self,
        name: &str,
        f: impl Fn(&Vm) -> Result<u32, RuntimeError> + 'static,
    ) -> Result<Scope, BindError> {
        let _guard = StackGuard::new(&self.vm, 0, 0);
        self.table
            .raw_set(TableKey::str(name), Value::Function(NativeFunction::new(f)));
        Ok(self)
    }

    /// Register a primitive constant under `name`.
    pub fn constant<V: ToStack>(self, name: &str, value: V) -> Result<Scope, BindError> {
        if !V::PRIMITIVE {
            return Err(BindError::NonPrimitiveConstant {
                name: name.to_owned(),
            });
        }
        let _guard = StackGuard::new(&self.vm, 0, 0);
        value.to_stack(&self.vm)?;
        let slot = self.vm.value_at(-1)?;
        self.vm.pop(1);
        self.table.raw_set(TableKey::str(name), slot);
        Ok(self)
    }

    /// Open (or reopen) a nested namespace.
    pub fn scope(self, name: &str) -> Result<Scope, BindError> {
        let _guard = StackGuard::new(&self.vm, 0, 0);
        let key = TableKey::str(name);
        match self.table.raw_get(&key) {
            Value::Nil => {
                let child = Rc::new(Table::new());
                child.raw_set(TableKey::str(NAMESPACE_KEY), Value::str(name));
                let anchor = self.vm.ref_value(Value::Table(child.clone()));
                child.raw_set(TableKey::str(REF_KEY), Value::Opaque(Rc::new(anchor)));
                Ok(Scope {
                    vm: self.vm.clone(),
                    table: child,
                    anchor: Some(anchor),
                    name: Some(name.to_owned()),
                    parent: Some(Box::new(self)),
                })
            }
            Value::Table(existing) => {
                match existing.raw_get(&TableKey::str(NAMESPACE_KEY)) {
                    Value::Str(ns) if &*ns == name => {}
                    Value::Str(ns) => {
                        return Err(BindError::ScopeMismatch {
                            name: name.to_owned(),
                            found: ns.to_string(),
                        });
                    }
                    _ => {
                        return Err(BindError::ScopeMismatch {
                            name: name.to_owned(),
                            found: "(unnamed table)".to_owned(),
                        });
                    }
                }
                let anchor = match existing.raw_get(&TableKey::str(REF_KEY)) {
                    Value::Opaque(raw) => raw.downcast::<RegistryKey>().ok().map(|k| *k),
                    _ => None,
                };
                let anchor = match anchor {
                    Some(key) => key,
                    None => {
                        let key = self.vm.ref_value(Value::Table(existing.clone()));
                        existing.raw_set(TableKey::str(REF_KEY), Value::Opaque(Rc::new(key)));
                        key
                    }
                };
                Ok(Scope {
                    vm: self.vm.clone(),
                    table: existing,
                    anchor: Some(anchor),
                    name: Some(name.to_owned()),
                    parent: Some(Box::new(self)),
                })
            }
            other => Err(BindError::ScopeCollision {
                name: name.to_owned(),
                found: other.type_name(),
            }),
        }
    }

    /// Close this namespace, install it into the parent, return the parent.
    pub fn endscope(mut self) -> Result<Scope, BindError> {
        let parent = self.parent.take().ok_or(BindError::EndOfRootScope)?;
        let name = self.name.take().unwrap_or_default();
        let _guard = StackGuard::new(&self.vm, 0, 0);
        self.table.raw_set(TableKey::str(REF_KEY), Value::Nil);
        if let Some(anchor) = self.anchor.take() {
            self.vm.unref(anchor);
        }
        parent
            .table
            .raw_set(TableKey::str(&name), Value::Table(self.table.clone()));
        Ok(*parent)
    }

    /// End a module chain. Only valid on the root scope.
    pub fn end(self) -> Result<(), BindError> {
        if let Some(name) = &self.name {
            return Err(BindError::UnclosedScope { name: name.clone() });
        }
        Ok(())
    }

    /// Begin registering a class in this scope.
    pub fn class_<T: Scripted>(self, name: &str) -> Result<ClassRegistrar<T>, BindError> {
        ClassRegistrar::begin(self, name)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name.as_deref().unwrap_or("<root>"))
            .field("is_root", &self.parent.is_none())
            .finish()
    }
}
