//! Process-wide registry of open handles.
//!
//! Registering a handle returns a [`Registration`] guard; the handle stays
//! listed until the guard is dropped. [`close_all`] closes every listed
//! handle, which is what a process does on shutdown or after a fork.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::handle::{Handle, HandleId};

static HANDLES: Lazy<Mutex<HashMap<HandleId, Handle>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn handles() -> MutexGuard<'static, HashMap<HandleId, Handle>> {
    HANDLES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a handle listed in the registry while alive.
#[derive(Debug)]
#[must_use = "the handle is unregistered when the guard is dropped"]
pub struct Registration {
    id: HandleId,
}

impl Registration {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if handles().remove(&self.id).is_some() {
            log::debug!("handle {} unregistered", self.id);
        }
    }
}

/// List `handle` until the returned guard is dropped. Registering the same
/// handle twice keeps one entry, removed by whichever guard drops first.
pub fn register(handle: &Handle) -> Registration {
    let id = handle.id();
    handles().insert(id, handle.clone());
    log::debug!("handle {} registered", id);
    Registration { id }
}

/// Registered handles, ordered by id.
pub fn live_handles() -> Vec<Handle> {
    let mut list: Vec<Handle> = handles().values().cloned().collect();
    list.sort_by_key(Handle::id);
    list
}

pub fn get(id: HandleId) -> Option<Handle> {
    handles().get(&id).cloned()
}

/// Close every registered handle. Registrations stay in place; a closed
/// handle reconnects when it is used again.
pub fn close_all() {
    let list = live_handles();
    log::debug!("closing {} registered handle(s)", list.len());
    for handle in list {
        handle.close();
    }
}

pub fn len() -> usize {
    handles().len()
}

pub fn is_empty() -> bool {
    len() == 0
}
