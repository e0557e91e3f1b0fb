//! Process-wide registry of native resources handed to the host as integers.
//!
//! Every resource the host can name is registered here together with the closure that
//! frees it. The tracker guarantees each destructor runs exactly once: on `release`, or
//! at `teardown_all` / drop. Destructors never run while the registry lock is held.

use crate::utils::error::{CommError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Opaque integer handle, wide enough to hold a native pointer.
pub type Handle = usize;

/// Never a live handle; returned through the host channel on failure.
pub const NULL_HANDLE: Handle = 0;

type Destructor = Box<dyn FnOnce(Handle) + Send>;

struct TrackedResource {
    object: Option<Arc<dyn Any + Send + Sync>>,
    destructor: Destructor,
}

pub struct ResourceTracker {
    next_handle: AtomicUsize,
    entries: Mutex<HashMap<Handle, TrackedResource>>,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicUsize::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Handle, TrackedResource>> {
        // A destructor never runs under this lock, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register ownership of an externally allocated `handle`.
    pub fn track<F>(&self, handle: Handle, destructor: F) -> Result<()>
    where
        F: FnOnce(Handle) + Send + 'static,
    {
        if handle == NULL_HANDLE {
            return Err(CommError::InvalidArgument("cannot track the null handle".into()));
        }
        let mut entries = self.lock();
        if entries.contains_key(&handle) {
            return Err(CommError::AlreadyTracked(handle));
        }
        entries.insert(
            handle,
            TrackedResource {
                object: None,
                destructor: Box::new(destructor),
            },
        );
        debug!(handle, "Tracking resource");
        Ok(())
    }

    /// Register `object` under a freshly allocated handle.
    ///
    /// The object stays reachable through [`get`](Self::get) until the handle is released.
    pub fn track_object<T, F>(&self, object: Arc<T>, destructor: F) -> Result<Handle>
    where
        T: Any + Send + Sync,
        F: FnOnce(Handle) + Send + 'static,
    {
        let mut entries = self.lock();
        // Skip values an external `track` already claimed.
        let handle = loop {
            let candidate = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if candidate != NULL_HANDLE && !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            handle,
            TrackedResource {
                object: Some(object as Arc<dyn Any + Send + Sync>),
                destructor: Box::new(destructor),
            },
        );
        debug!(handle, "Tracking resource");
        Ok(handle)
    }

    /// Look up the object registered under `handle`.
    pub fn get<T: Any + Send + Sync>(&self, handle: Handle) -> Option<Arc<T>> {
        let object = self.lock().get(&handle)?.object.clone()?;
        object.downcast::<T>().ok()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `handle` and run its destructor.
    ///
    /// Releasing an unknown or already released handle is `NotFound`.
    pub fn release(&self, handle: Handle) -> Result<()> {
        let entry = self.lock().remove(&handle);
        match entry {
            Some(entry) => {
                debug!(handle, "Releasing resource");
                drop(entry.object);
                (entry.destructor)(handle);
                Ok(())
            }
            None => Err(CommError::NotFound(handle)),
        }
    }

    /// Release every remaining resource. Returns how many destructors ran.
    pub fn teardown_all(&self) -> usize {
        let drained: Vec<(Handle, TrackedResource)> = self.lock().drain().collect();
        let count = drained.len();
        if count > 0 {
            warn!(count, "Tearing down resources that were never released");
        }
        for (handle, entry) in drained {
            drop(entry.object);
            (entry.destructor)(handle);
        }
        count
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
