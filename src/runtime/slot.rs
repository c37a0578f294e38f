//! The engine's single active-request slot.
//!
//! Script callbacks have no access to the [`Context`](super::context::Context)
//! that started them; they find the running request through this slot, which
//! the engine also stores in the isolate. At most one request is registered
//! at a time.

use super::error::{Error, Result};
use super::request::RequestState;
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) type SharedRequest = Rc<RefCell<RequestState>>;

#[derive(Clone, Default)]
pub(crate) struct ActiveSlot {
    current: Rc<RefCell<Option<SharedRequest>>>,
}

impl ActiveSlot {
    /// Claim the slot for `request` until the returned guard drops.
    pub fn register(&self, request: SharedRequest) -> Result<ActiveGuard> {
        let mut current = self.current.borrow_mut();
        if current.is_some() {
            return Err(Error::ContextBusy);
        }
        *current = Some(request);
        Ok(ActiveGuard { slot: self.clone() })
    }

    pub fn current(&self) -> Option<SharedRequest> {
        self.current.borrow().clone()
    }

    pub fn is_occupied(&self) -> bool {
        self.current.borrow().is_some()
    }
}

/// Registration in an [`ActiveSlot`]; clears the slot on drop.
pub(crate) struct ActiveGuard {
    slot: ActiveSlot,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.slot.current.borrow_mut().take();
        tracing::debug!("request unregistered from active slot");
    }
}
