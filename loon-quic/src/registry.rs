//! Loop-thread-local endpoint registry.
//!
//! Endpoint state is confined to the loop thread. Handles carry only an
//! endpoint id; the jobs they dispatch resolve it here. Entries are
//! `Rc<RefCell<…>>` so a lookup can release the map borrow before borrowing
//! the state — and so a mid-callback removal cannot invalidate a state that
//! is still being worked on higher up the stack.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::endpoint::EndpointState;

thread_local! {
    static ENDPOINTS: RefCell<HashMap<u64, Rc<RefCell<EndpointState>>>> =
        RefCell::new(HashMap::new());
}

pub(crate) fn install(id: u64, state: EndpointState) {
    ENDPOINTS.with(|map| {
        map.borrow_mut().insert(id, Rc::new(RefCell::new(state)));
    });
}

pub(crate) fn remove(id: u64) {
    ENDPOINTS.with(|map| {
        map.borrow_mut().remove(&id);
    });
}

/// Run `f` against an endpoint's state. Returns `None` if the endpoint is
/// gone or we are not on its loop thread.
///
/// `f` must not run user callbacks: the state is borrowed for the duration
/// of the call and user code is free to re-enter the public API.
pub(crate) fn with_endpoint<R>(id: u64, f: impl FnOnce(&mut EndpointState) -> R) -> Option<R> {
    let state = ENDPOINTS.with(|map| map.borrow().get(&id).cloned())?;
    let mut state = state.borrow_mut();
    Some(f(&mut state))
}
