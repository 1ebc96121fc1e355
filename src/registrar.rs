//! Class registration: building the boundary-side metatable for a native type.
//!
//! One boundary table plays three roles for a bound class: member table,
//! instance metatable, and the class object installed under the class's
//! name. That is the layout the dispatch trampolines expect. While the class is
//! being built the table rides the top of the stack behind a stack-anchored
//! handle; `endclass` wires the trampolines, registers the finalizer and the
//! class representation, installs the table into the containing scope, and
//! pops the anchor.

use std::any::Any;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use tether_core::{
    BindError, BoundConstructor, BoundMethod, CallPolicy, ClassRepresentation, FieldGet, FieldSet,
    FromStack, FunctionSlot, MarshalledFn, MemberSlot, Ownership, ReadOnlyField, ReadOnlyProperty,
    ReadWriteField, ReadWriteProperty, Scripted, StackGuard, TaggedBlock, ToStack, TypeHash,
    binder_state, install_function,
};
use tether_runtime::{NativeFunction, RuntimeError, Table, TableKey, Value, Vm};

use crate::object::StackObject;
use crate::scope::Scope;

/// Builder for one bound class, produced by [`Scope::class_`].
pub struct ClassRegistrar<T: Scripted> {
    vm: Vm,
    scope: Scope,
    table: Rc<Table>,
    anchor: StackObject,
    name: String,
    type_hash: TypeHash,
    constructors: Vec<MarshalledFn>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Scripted> ClassRegistrar<T> {
    pub(crate) fn begin(scope: Scope, name: &str) -> Result<ClassRegistrar<T>, BindError> {
        let vm = scope.vm().clone();
        let state = binder_state(&vm).ok_or(BindError::NotOpen)?;
        if state.classes.is_registered::<T>() || state.classes.is_name_registered(name) {
            return Err(BindError::ClassAlreadyRegistered {
                name: name.to_owned(),
            });
        }

        let guard = StackGuard::new(&vm, 0, 1);
        let table = Rc::new(Table::new());
        vm.push(Value::Table(table.clone()));
        let anchor = StackObject::from_stack(&vm, -1)?;
        drop(guard);

        Ok(ClassRegistrar {
            vm,
            scope,
            table,
            anchor,
            name: name.to_owned(),
            type_hash: TypeHash::from_class_name(name),
            constructors: Vec::new(),
            _marker: PhantomData,
        })
    }

    fn assert_anchored(&self) {
        debug_assert_eq!(
            self.anchor.index(),
            self.vm.top(),
            "class table must sit on top of the stack while building"
        );
    }

    /// Register a primitive constant on the class.
    pub fn constant<V: ToStack>(self, name: &str, value: V) -> Result<ClassRegistrar<T>, BindError> {
        if !V::PRIMITIVE {
            return Err(BindError::NonPrimitiveConstant {
                name: name.to_owned(),
            });
        }
        self.assert_anchored();
        let _guard = StackGuard::new(&self.vm, 0, 0);
        value.to_stack(&self.vm)?;
        let slot = self.vm.value_at(-1)?;
        self.vm.pop(1);
        self.table.raw_set(TableKey::str(name), slot);
        Ok(self)
    }

    /// Register a constructor candidate: a factory returning `T` by value.
    ///
    /// Candidates dispatch in registration order when the class object is
    /// called like a function; every constructed instance is pushed Owned,
    /// so the boundary's finalizer deletes it exactly once at collection.
    pub fn constructor<Args, F>(mut self, factory: F) -> ClassRegistrar<T>
    where
        F: BoundConstructor<T, Args>,
    {
        self.constructors.push(factory.into_marshalled_constructor());
        self
    }

    /// Register a member function under `name`.
    pub fn def<Marker, F>(self, name: &str, method: F) -> ClassRegistrar<T>
    where
        F: BoundMethod<T, Marker>,
    {
        self.def_with(name, method, CallPolicy::Normal)
    }

    /// Register a member function with an explicit call policy.
    pub fn def_with<Marker, F>(self, name: &str, method: F, policy: CallPolicy) -> ClassRegistrar<T>
    where
        F: BoundMethod<T, Marker>,
    {
        self.assert_anchored();
        install_function(&self.table, name, method.into_marshalled_method(policy));
        self
    }

    /// Expose a data member for reading only.
    pub fn def_readonly<F: FieldGet>(
        self,
        name: &str,
        projection: fn(&T) -> &F,
    ) -> ClassRegistrar<T> {
        self.assert_anchored();
        self.table.raw_set(
            TableKey::str(name),
            Value::Opaque(MemberSlot::new(ReadOnlyField::new(projection))),
        );
        self
    }

    /// Expose a data member for reading and writing.
    pub fn def_readwrite<F: FieldSet>(
        self,
        name: &str,
        projection: fn(&mut T) -> &mut F,
    ) -> ClassRegistrar<T> {
        self.assert_anchored();
        self.table.raw_set(
            TableKey::str(name),
            Value::Opaque(MemberSlot::new(ReadWriteField::new(projection))),
        );
        self
    }

    /// Expose a computed member backed by a getter only; assignment raises.
    pub fn property_readonly<V, G>(self, name: &str, getter: G) -> ClassRegistrar<T>
    where
        V: ToStack + 'static,
        G: Fn(&T) -> V + 'static,
    {
        self.assert_anchored();
        self.table.raw_set(
            TableKey::str(name),
            Value::Opaque(MemberSlot::new(ReadOnlyProperty::new(getter))),
        );
        self
    }

    /// Expose a computed member backed by a getter/setter pair.
    pub fn property<V, G, S>(self, name: &str, getter: G, setter: S) -> ClassRegistrar<T>
    where
        V: ToStack + FromStack + 'static,
        G: Fn(&T) -> V + 'static,
        S: Fn(&mut T, V) + 'static,
    {
        self.assert_anchored();
        self.table.raw_set(
            TableKey::str(name),
            Value::Opaque(MemberSlot::new(ReadWriteProperty::new(getter, setter))),
        );
        self
    }

    /// Finalize the class and return the containing scope.
    pub fn endclass(mut self) -> Result<Scope, BindError> {
        self.assert_anchored();
        let vm = self.vm.clone();
        let state = binder_state(&vm).ok_or(BindError::NotOpen)?;

        // The anchored member table comes off the stack on every path out.
        let guard = StackGuard::new(&vm, 1, -1);

        let instance_key = vm.ref_value(Value::Table(self.table.clone()));

        // The static metatable carries the constructor call trampoline, so
        // invoking the class object like a function dispatches through
        // overload resolution over the registered constructor list.
        let static_table = Rc::new(Table::new());
        if !self.constructors.is_empty() {
            let mut candidates = self.constructors.drain(..);
            let slot = FunctionSlot::new(self.name.as_str(), candidates.next().expect("non-empty"));
            for candidate in candidates {
                slot.add_candidate(candidate);
            }
            let dispatching = slot.clone();
            let dispatcher =
                NativeFunction::with_data(move |vm: &Vm| dispatching.dispatch(vm), slot);
            static_table.raw_set(TableKey::str("__call"), Value::Function(dispatcher));
        }
        self.table.set_metatable(Some(static_table.clone()));
        let static_key = vm.ref_value(Value::Table(static_table));

        let representation = Rc::new(ClassRepresentation::new(
            self.name.clone(),
            self.type_hash,
            instance_key,
            static_key,
        ));

        // Dispatch trampolines. They hold the member table weakly; the
        // strong reference is the registry slot, released at close.
        {
            let members = Rc::downgrade(&self.table);
            let rep = representation.clone();
            let index = NativeFunction::new(move |vm: &Vm| class_index(vm, &members, &rep));
            self.table
                .raw_set(TableKey::str("__index"), Value::Function(index));
        }
        {
            let members = Rc::downgrade(&self.table);
            let rep = representation.clone();
            let newindex = NativeFunction::new(move |vm: &Vm| class_newindex(vm, &members, &rep));
            self.table
                .raw_set(TableKey::str("__newindex"), Value::Function(newindex));
        }

        vm.register_finalizer(&self.table, finalize_class_instance::<T>);

        if let Err(e) = state.classes.register::<T>(representation) {
            vm.unref(instance_key);
            vm.unref(static_key);
            return Err(e);
        }

        self.scope
            .table()
            .raw_set(TableKey::str(&self.name), Value::Table(self.table.clone()));

        drop(guard);
        Ok(self.scope)
    }
}

/// `__index` trampoline: raw member-table lookup, descriptors routed
/// through `MemberDescriptor::push`, everything else returned as-is.
fn class_index(
    vm: &Vm,
    members: &Weak<Table>,
    rep: &Rc<ClassRepresentation>,
) -> Result<u32, RuntimeError> {
    // Frame is [target, key].
    let Some(members) = members.upgrade() else {
        return Err(released_error(rep));
    };
    let key_value = vm.value_at(2)?;
    let Some(key) = TableKey::from_value(&key_value) else {
        return Err(RuntimeError::raise(format!(
            "invalid member key of type {} on '{}'",
            key_value.type_name(),
            rep.name()
        )));
    };
    let found = members.raw_get(&key);
    if let Value::Opaque(opaque) = &found
        && let Some(member) = MemberSlot::from_opaque(opaque)
    {
        let target = receiver_pointer(vm, rep)?;
        return member.push(vm, target);
    }
    vm.push(found);
    Ok(1)
}

/// `__newindex` trampoline: unknown names raise, descriptors route through
/// `MemberDescriptor::set` (read-only variants raise there), plain entries
/// are left untouched.
fn class_newindex(
    vm: &Vm,
    members: &Weak<Table>,
    rep: &Rc<ClassRepresentation>,
) -> Result<u32, RuntimeError> {
    // Frame is [target, key, value].
    let Some(members) = members.upgrade() else {
        return Err(released_error(rep));
    };
    let key_value = vm.value_at(2)?;
    let Some(key) = TableKey::from_value(&key_value) else {
        return Err(RuntimeError::raise(format!(
            "invalid member key of type {} on '{}'",
            key_value.type_name(),
            rep.name()
        )));
    };
    match members.raw_get(&key) {
        Value::Nil => Err(RuntimeError::raise(format!(
            "cannot set unknown member '{}' on '{}'",
            key,
            rep.name()
        ))),
        Value::Opaque(opaque) => {
            if let Some(member) = MemberSlot::from_opaque(&opaque) {
                let target = receiver_pointer(vm, rep)?;
                member.set(vm, target)?;
            }
            Ok(0)
        }
        _ => Ok(0),
    }
}

fn released_error(rep: &Rc<ClassRepresentation>) -> RuntimeError {
    RuntimeError::raise(format!("metatable for class '{}' was released", rep.name()))
}

/// Resolve the trampoline's receiver: the opaque block at slot 1, masked
/// clean and type-checked against the class representation.
fn receiver_pointer(vm: &Vm, rep: &Rc<ClassRepresentation>) -> Result<*mut (), RuntimeError> {
    let target = vm.value_at(1)?;
    let Value::UserData(ud) = &target else {
        return Err(RuntimeError::raise(format!(
            "member access on a {} value (expected a '{}' instance)",
            target.type_name(),
            rep.name()
        )));
    };
    let Some(block) = ud.with_payload(|p| p.downcast_ref::<TaggedBlock>().copied()) else {
        return Err(RuntimeError::raise(format!(
            "member access on a foreign userdata (expected a '{}' instance)",
            rep.name()
        )));
    };
    if block.type_hash() != rep.type_hash() {
        return Err(RuntimeError::raise(format!(
            "member access on an instance of another class (expected '{}')",
            rep.name()
        )));
    }
    Ok(block.pointer())
}

/// Finalizer trampoline installed on every class metatable: invoked by the
/// host collector when an instance is released; deletes the native object
/// only if the block is Owned.
fn finalize_class_instance<T: Scripted>(payload: &mut dyn Any) {
    if let Some(block) = payload.downcast_mut::<TaggedBlock>()
        && block.ownership() == Ownership::Owned
    {
        block.disown();
        // Safety: Owned blocks carry a pointer produced by Box::into_raw
        // for exactly this type; disowning first makes deletion unrepeatable.
        unsafe { drop(Box::from_raw(block.pointer() as *mut T)) };
    }
}
