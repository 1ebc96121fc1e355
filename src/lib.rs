//! Tether binds native Rust functions, classes and constructors into an
//! embedded, dynamically-typed, stack-based runtime, and provides typed
//! reference-counted handles for passing values back across the boundary.
//!
//! The registration surface is a fluent tree of scopes rooted at the
//! runtime's global namespace. `open`/`close` bracket everything:
//!
//! ```
//! use tether::{Scripted, Vm, cast, close, globals, module, open};
//!
//! #[derive(Clone)]
//! struct Counter {
//!     count: i64,
//! }
//! impl Scripted for Counter {}
//!
//! fn count_mut(c: &mut Counter) -> &mut i64 {
//!     &mut c.count
//! }
//!
//! fn total(c: &Counter) -> i64 {
//!     c.count
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vm = Vm::new();
//! open(&vm)?;
//!
//! module(&vm)?
//!     .def("double", |x: i64| x * 2)?
//!     .constant("LIMIT", 100i64)?
//!     .scope("counters")?
//!         .class_::<Counter>("Counter")?
//!             .constructor(|start: i64| Counter { count: start })
//!             .def("total", total)
//!             .def_readwrite("count", count_mut)
//!         .endclass()?
//!     .endscope()?
//! .end()?;
//!
//! // Drive the bindings through handles and protected calls.
//! let g = globals(&vm);
//! let doubled: i64 = tether::call(&g.at("double").to_object()?, (21i64,))?;
//! assert_eq!(doubled, 42);
//!
//! let counter_class = g.at("counters").to_object()?.at("Counter").to_object()?;
//! let instance: tether::Object = tether::call(&counter_class, (5i64,))?;
//! assert_eq!(instance.at("count").get::<i64>()?, 5);
//! instance.at("count").set(9i64)?;
//! let not_an_int = cast::<i64, _>(&instance.at("total").to_object()?);
//! assert!(matches!(not_an_int, Err(tether::ConversionError::BadCast { .. })));
//!
//! close(&vm)?;
//! # Ok(())
//! # }
//! ```

mod cast;
mod object;
mod registrar;
mod scope;
mod state;

pub use cast::{BoundaryHandle, CallArgs, call, cast, conditional_call};
pub use object::{Object, Pairs, Proxy, StackObject, globals, newtable};
pub use registrar::ClassRegistrar;
pub use scope::{Scope, module};
pub use state::{close, open, statistics};

// The marshalling core and runtime substrate re-exported for callers that
// drop below the fluent surface.
pub use tether_core::{
    BindError, CallPolicy, ConversionError, FromStack, Ignored, Ownership, Scripted,
    StackGuard, StatisticsSnapshot, ToStack,
};
pub use tether_runtime::{
    NativeFunction, RegistryKey, RuntimeError, Table, TableKey, Value, ValueKind, Vm, VmOptions,
};
