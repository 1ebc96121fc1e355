//! Stack-discipline checking.

use tether_runtime::{Vm, VmOptions};

/// RAII check that a boundary operation leaves the stack where it promised.
///
/// On construction the guard records the frame height. On drop it pops
/// `consumed` values, then verifies the height equals `entry + provided`.
/// A violation is a marshalling bug: it trips a `debug_assert!` during
/// development and, under `VmOptions::STACK_ASSERTS`, a hard panic in any
/// build. Checks are skipped while unwinding so a failing operation does
/// not cascade into an abort.
pub struct StackGuard {
    vm: Vm,
    entry: usize,
    consumed: u32,
    provided: i32,
}

impl StackGuard {
    pub fn new(vm: &Vm, consumed: u32, provided: i32) -> StackGuard {
        StackGuard {
            vm: vm.clone(),
            entry: vm.top(),
            consumed,
            provided,
        }
    }

    pub fn entry_height(&self) -> usize {
        self.entry
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if self.consumed > 0 {
            self.vm.pop(self.consumed as usize);
        }
        let now = self.vm.top() as i64;
        let expected = self.entry as i64 + self.provided as i64;
        if now != expected {
            if self.vm.options().contains(VmOptions::STACK_ASSERTS) {
                panic!(
                    "stack discipline violated: started at {}, expected {}, found {}",
                    self.entry, expected, now
                );
            }
            debug_assert_eq!(
                now, expected,
                "stack discipline violated: started at {}, expected {}, found {}",
                self.entry, expected, now
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_runtime::Value;

    #[test]
    fn guard_pops_declared_leftovers() {
        let vm = Vm::new();
        vm.push(Value::Int(1));
        {
            let _guard = StackGuard::new(&vm, 1, 0);
            vm.push(Value::Int(2));
        }
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn balanced_guard_is_silent() {
        let vm = Vm::new();
        {
            let _guard = StackGuard::new(&vm, 0, 2);
            vm.push(Value::Int(1));
            vm.push(Value::Int(2));
        }
        assert_eq!(vm.top(), 2);
        vm.pop(2);
    }

    #[test]
    #[should_panic(expected = "stack discipline violated")]
    fn strict_mode_panics_on_violation() {
        let vm = Vm::with_options(VmOptions::STACK_ASSERTS);
        let _guard = StackGuard::new(&vm, 0, 0);
        vm.push(Value::Int(1));
    }
}
