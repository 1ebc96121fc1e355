//! Userdata: opaque native payloads handed to the boundary.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::table::{Finalizer, Table};

/// An opaque block of native data owned by the boundary.
///
/// The runtime never interprets the payload. A finalizer, snapshotted from
/// the metatable when the userdata is created, runs exactly once: when the
/// last reference is released (the host collector here is reference
/// counting) or when the owning runtime is torn down, whichever comes first.
pub struct UserData {
    payload: RefCell<Box<dyn Any>>,
    metatable: Option<Rc<Table>>,
    finalizer: RefCell<Option<Rc<Finalizer>>>,
}

impl UserData {
    pub fn new(payload: Box<dyn Any>, metatable: Option<Rc<Table>>) -> UserData {
        let finalizer = metatable.as_ref().and_then(|m| m.finalizer());
        UserData {
            payload: RefCell::new(payload),
            metatable,
            finalizer: RefCell::new(finalizer),
        }
    }

    pub fn metatable(&self) -> Option<&Rc<Table>> {
        self.metatable.as_ref()
    }

    /// Read access to the payload.
    pub fn with_payload<R>(&self, f: impl FnOnce(&dyn Any) -> R) -> R {
        f(self.payload.borrow().as_ref())
    }

    /// Write access to the payload.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut dyn Any) -> R) -> R {
        f(self.payload.borrow_mut().as_mut())
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        // take() guarantees the hook cannot run twice.
        if let Some(finalizer) = self.finalizer.borrow_mut().take() {
            finalizer(self.payload.borrow_mut().as_mut());
        }
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserData")
            .field("has_metatable", &self.metatable.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn payload_roundtrip() {
        let ud = UserData::new(Box::new(41i32), None);
        ud.with_payload_mut(|p| {
            if let Some(v) = p.downcast_mut::<i32>() {
                *v += 1;
            }
        });
        let value = ud.with_payload(|p| p.downcast_ref::<i32>().copied());
        assert_eq!(value, Some(42));
    }

    #[test]
    fn finalizer_runs_once_on_release() {
        let runs = Rc::new(Cell::new(0u32));
        let meta = Rc::new(Table::new());
        let counter = runs.clone();
        meta.set_finalizer(Rc::new(move |_payload| {
            counter.set(counter.get() + 1);
        }));

        let ud = Rc::new(UserData::new(Box::new(0u8), Some(meta)));
        let alias = ud.clone();
        drop(ud);
        assert_eq!(runs.get(), 0, "finalizer must wait for the last reference");
        drop(alias);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn no_metatable_means_no_finalizer() {
        let ud = UserData::new(Box::new(0u8), None);
        drop(ud);
    }
}
