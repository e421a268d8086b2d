//! A shared handle for a group of descriptors and records.
//!
//! A [`Context`] opens its handle on first use and reopens it when it was
//! closed. Every descriptor and record built through the context runs on
//! that handle, so they share one transaction.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{self, DatabaseConfig, HandleFactory};
use crate::error::Result;
use crate::handle::Handle;
use crate::model::{ModelDef, Record};
use crate::query::{Args, Descriptor};

#[derive(Clone)]
pub struct Context {
    factory: HandleFactory,
    handle: Arc<Mutex<Option<Handle>>>,
}

impl Context {
    /// Open the handle with the process-wide handle factory.
    pub fn new() -> Self {
        Self::with_factory(config::new_handle)
    }

    pub fn from_config(config: DatabaseConfig) -> Self {
        Self::with_factory(move || Handle::from_config(&config))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Handle> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Use an existing handle. It is still reopened when found closed.
    pub fn with_handle(handle: Handle) -> Self {
        let context = Self::with_factory(config::new_handle);
        *context.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        context
    }

    /// The context's handle, created on first use and reconnected if closed.
    pub fn handle(&self) -> Result<Handle> {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = match slot.as_ref() {
            Some(handle) => handle.clone(),
            None => {
                let handle = (self.factory)()?;
                log::debug!("context opened handle {}", handle.id());
                *slot = Some(handle.clone());
                handle
            }
        };
        drop(slot);
        if handle.is_closed() {
            log::debug!("context handle {} was closed, reopening", handle.id());
            handle.backend_pid()?;
        }
        Ok(handle)
    }

    pub fn raw(&self, sql: impl Into<String>, args: &[&str]) -> Result<Descriptor> {
        Ok(Descriptor::raw(sql, args).with_handle(self.handle()?))
    }

    pub fn query(&self, table: impl Into<String>, args: &[&str]) -> Result<Descriptor> {
        Ok(Descriptor::query(table, args).with_handle(self.handle()?))
    }

    pub fn function(&self, function: impl Into<String>, args: &[&str]) -> Result<Descriptor> {
        Ok(Descriptor::function(function, args).with_handle(self.handle()?))
    }

    /// Bind an already built descriptor to the context's handle.
    pub fn bind(&self, descriptor: Descriptor) -> Result<Descriptor> {
        Ok(descriptor.with_handle(self.handle()?))
    }

    /// An empty record of `model` on the context's handle.
    pub fn record(&self, model: &Arc<ModelDef>) -> Result<Record> {
        Ok(Record::with_handle(Arc::clone(model), self.handle()?))
    }

    /// Load a record of `model` on the context's handle. A handle passed in
    /// `args` is replaced.
    pub fn load(&self, model: &Arc<ModelDef>, args: Args) -> Result<Record> {
        Record::load(Arc::clone(model), args.handle(self.handle()?))
    }

    pub fn commit(&self) -> Result<()> {
        self.handle()?.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.handle()?.rollback()
    }

    /// Close the handle if one was opened. The next use reopens it.
    pub fn close(&self) {
        let slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            handle.close();
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Context")
            .field("handle", &slot.as_ref().map(Handle::id))
            .finish_non_exhaustive()
    }
}
