use std::sync::{Arc, Mutex};

use crate::util::lock;

/// A single-slot event observer.
///
/// Registering a handler replaces the previous one; handlers are never stacked. The handler is cloned out of the slot
/// before it is invoked so that a handler may re-register, clear the slot, or call back into its owner.
pub(crate) struct Slot<F: ?Sized> {
    handler: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Slot<F> {
    pub fn new() -> Self {
        Slot {
            handler: Mutex::new(None),
        }
    }

    /// Installs `handler`, returning the handler it replaced.
    pub fn set(&self, handler: Arc<F>) -> Option<Arc<F>> {
        lock(&self.handler).replace(handler)
    }

    pub fn clear(&self) -> Option<Arc<F>> {
        lock(&self.handler).take()
    }

    pub fn get(&self) -> Option<Arc<F>> {
        lock(&self.handler).clone()
    }

    pub fn is_set(&self) -> bool {
        lock(&self.handler).is_some()
    }
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> std::fmt::Debug for Slot<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("is_set", &self.is_set()).finish()
    }
}
