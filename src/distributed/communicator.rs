//! Communicator creation, splitting and teardown.

use super::backend::CollectiveBackend;
use super::identity::GroupIdentity;
use super::nccl_sys::{NativeComm, MIN_SPLIT_VERSION};
use super::tracker::{Handle, ResourceTracker};
use crate::utils::error::{CommError, Result};
use crate::utils::metrics::CollectiveMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One participant's membership in a communication group.
#[derive(Debug)]
pub struct Communicator {
    native: NativeComm,
    rank: i32,
    size: i32,
}

impl Communicator {
    pub fn native(&self) -> NativeComm {
        self.native
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn size(&self) -> i32 {
        self.size
    }
}

/// Creates communicators and registers each one with the tracker.
///
/// A tracked communicator is destroyed exactly once, by finalizing it and then releasing
/// the native handle. Construction failures never leave a tracker entry behind.
pub struct CommunicatorFactory {
    backend: Arc<dyn CollectiveBackend>,
    tracker: Arc<ResourceTracker>,
    metrics: Option<Arc<CollectiveMetrics>>,
}

impl CommunicatorFactory {
    pub fn new(backend: Arc<dyn CollectiveBackend>, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            backend,
            tracker,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CollectiveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &Arc<dyn CollectiveBackend> {
        &self.backend
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// Bind to `device` and join the group named by `identity`.
    ///
    /// Blocks until all `size` participants have joined.
    pub fn join(&self, identity: &GroupIdentity, rank: i32, size: i32, device: i32) -> Result<Handle> {
        if size < 1 || rank < 0 || rank >= size {
            return Err(CommError::InvalidArgument(format!(
                "rank {} is not within a group of {}",
                rank, size
            )));
        }

        self.backend.set_device(device).map_err(CommError::Device)?;

        let started = Instant::now();
        let native = self
            .backend
            .comm_init_rank(size, identity.as_unique_id(), rank)
            .map_err(CommError::Init)?;
        self.observe_rendezvous(started);

        let handle = self.register(Communicator { native, rank, size })?;
        debug!(handle, rank, size, device, "Communicator joined");
        Ok(handle)
    }

    /// Split `parent` into sub-groups by `color`, ranked by ascending `key`.
    ///
    /// A participant passing `NCCL_SPLIT_NOCOLOR` (-1) opts out and gets `Ok(None)`. Any
    /// other negative color is rejected by the library as a `Split` error.
    pub fn split(&self, parent: Handle, color: i32, key: i32) -> Result<Option<Handle>> {
        let version = self.backend.version().map_err(CommError::Split)?;
        if version < MIN_SPLIT_VERSION {
            return Err(CommError::UnsupportedOperation(format!(
                "communicator split requires {} version {} or newer, found {}",
                self.backend.name(),
                MIN_SPLIT_VERSION,
                version
            )));
        }

        let parent_comm = self.communicator(parent)?;

        let started = Instant::now();
        let native = self
            .backend
            .comm_split(parent_comm.native, color, key)
            .map_err(CommError::Split)?;
        self.observe_rendezvous(started);

        if native.is_null() {
            debug!(parent, color, "Opted out of communicator split");
            return Ok(None);
        }

        // The new rank and size are local to the sub-group.
        let queried = self
            .backend
            .comm_user_rank(native)
            .and_then(|rank| Ok((rank, self.backend.comm_count(native)?)));
        let (rank, size) = match queried {
            Ok(pair) => pair,
            Err(e) => {
                destroy_native(self.backend.as_ref(), native);
                return Err(CommError::Split(e));
            }
        };

        let handle = self.register(Communicator { native, rank, size })?;
        debug!(handle, parent, color, key, rank, size, "Communicator split");
        Ok(Some(handle))
    }

    /// Look up the live communicator behind `handle`.
    pub fn communicator(&self, handle: Handle) -> Result<Arc<Communicator>> {
        self.tracker
            .get::<Communicator>(handle)
            .ok_or(CommError::NotFound(handle))
    }

    pub fn rank(&self, handle: Handle) -> Result<i32> {
        Ok(self.communicator(handle)?.rank)
    }

    pub fn size(&self, handle: Handle) -> Result<i32> {
        Ok(self.communicator(handle)?.size)
    }

    /// Destroy the communicator behind `handle` now.
    pub fn release(&self, handle: Handle) -> Result<()> {
        self.tracker.release(handle)?;
        if let Some(metrics) = &self.metrics {
            metrics.tracker_releases.inc();
        }
        Ok(())
    }

    fn register(&self, comm: Communicator) -> Result<Handle> {
        let native = comm.native;
        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let tracked = self.tracker.track_object(Arc::new(comm), move |handle| {
            debug!(handle, "Destroying communicator");
            destroy_native(backend.as_ref(), native);
            if let Some(metrics) = &metrics {
                metrics.live_communicators.dec();
            }
        });
        match tracked {
            Ok(handle) => {
                if let Some(metrics) = &self.metrics {
                    metrics.live_communicators.inc();
                }
                Ok(handle)
            }
            Err(e) => {
                destroy_native(self.backend.as_ref(), native);
                Err(e)
            }
        }
    }

    fn observe_rendezvous(&self, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rendezvous(started.elapsed());
        }
    }
}

/// Finalize then destroy `native`. Failures are logged, never propagated.
fn destroy_native(backend: &dyn CollectiveBackend, native: NativeComm) {
    if native.is_null() {
        return;
    }
    if let Err(e) = backend.comm_finalize(native) {
        warn!(native = native.0, error = %e, "Communicator finalize failed");
    }
    if let Err(e) = backend.comm_destroy(native) {
        warn!(native = native.0, error = %e, "Communicator destroy failed");
    }
}
