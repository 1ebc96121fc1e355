//! Per-runtime binding state lifecycle.
//!
//! `open` and `close` bracket every use of the registration surface and the
//! handles: `open` installs the binding layer's state (class registry,
//! marshalling statistics) into the runtime instance, `close` tears it down
//! and releases every metatable slot the layer anchored. Each must be called
//! exactly once per runtime, in that order.

use std::rc::Rc;

use tether_core::{BindError, BinderState, StatisticsSnapshot, binder_state};
use tether_runtime::Vm;

/// Attach the binding layer to a runtime instance.
pub fn open(vm: &Vm) -> Result<(), BindError> {
    if binder_state(vm).is_some() {
        return Err(BindError::AlreadyOpen);
    }
    vm.set_app_data(Rc::new(BinderState::new()));
    Ok(())
}

/// Detach the binding layer, releasing every class metatable slot it
/// anchored. Live instances keep their metatables (and finalizers) alive
/// through their own references until they are collected.
pub fn close(vm: &Vm) -> Result<(), BindError> {
    let state = vm.remove_app_data::<BinderState>().ok_or(BindError::NotOpen)?;
    for representation in state.classes.all() {
        vm.unref(representation.instance_key());
        vm.unref(representation.static_key());
    }
    Ok(())
}

/// Marshalling counters for this runtime instance.
pub fn statistics(vm: &Vm) -> Result<StatisticsSnapshot, BindError> {
    Ok(binder_state(vm)
        .ok_or(BindError::NotOpen)?
        .statistics
        .snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_cycle() {
        let vm = Vm::new();
        open(&vm).unwrap();
        assert_eq!(open(&vm).unwrap_err(), BindError::AlreadyOpen);
        close(&vm).unwrap();
        assert_eq!(close(&vm).unwrap_err(), BindError::NotOpen);
    }

    #[test]
    fn statistics_require_open() {
        let vm = Vm::new();
        assert!(statistics(&vm).is_err());
        open(&vm).unwrap();
        assert_eq!(statistics(&vm).unwrap().converts, 0);
        close(&vm).unwrap();
    }
}
