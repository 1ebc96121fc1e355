//! Native closures callable from the boundary.

use std::any::Any;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::vm::Vm;

/// A native closure exposed to the boundary.
///
/// The calling convention mirrors the classic embedded-runtime one: when the
/// closure runs, the current frame holds exactly its arguments (slot 1 is the
/// first argument); the closure pushes its results and returns how many it
/// pushed. Errors returned here propagate through [`Vm::pcall`].
///
/// `data` is an optional shared tag the binding layer uses to recognize and
/// mutate its own entries in place (overload promotion swaps candidates
/// behind the same boundary-visible closure object).
pub struct NativeFunction {
    f: Box<dyn Fn(&Vm) -> Result<u32, RuntimeError>>,
    data: Option<Rc<dyn Any>>,
}

impl NativeFunction {
    pub fn new(f: impl Fn(&Vm) -> Result<u32, RuntimeError> + 'static) -> Rc<NativeFunction> {
        Rc::new(NativeFunction {
            f: Box::new(f),
            data: None,
        })
    }

    pub fn with_data(
        f: impl Fn(&Vm) -> Result<u32, RuntimeError> + 'static,
        data: Rc<dyn Any>,
    ) -> Rc<NativeFunction> {
        Rc::new(NativeFunction {
            f: Box::new(f),
            data: Some(data),
        })
    }

    pub fn data(&self) -> Option<&Rc<dyn Any>> {
        self.data.as_ref()
    }

    pub fn invoke(&self, vm: &Vm) -> Result<u32, RuntimeError> {
        (self.f)(vm)
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("has_data", &self.data.is_some())
            .finish_non_exhaustive()
    }
}
