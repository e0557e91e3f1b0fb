//! Collective communication for SPMD device programs.
//!
//! Layers, leaves first:
//! - `tracker`: integer handles for native resources, destroyed exactly once
//! - `identity`: the opaque token participants share to form a group
//! - `communicator`: joining, splitting and tearing down groups
//! - `dispatch`: reductions and data movement on a caller-supplied stream
//! - `binding`: the name-indexed entry points the host calls
//!
//! The collective library itself sits behind [`CollectiveBackend`]. `NcclBackend` links
//! the real library (requires the `cuda` feature); `SimulatedBackend` runs every rank as
//! a thread in one process.

pub mod backend;
pub mod binding;
pub mod communicator;
pub mod dispatch;
pub mod identity;
#[cfg(feature = "cuda")]
pub mod nccl_backend;
pub mod nccl_sys;
pub mod sim_backend;
pub mod tracker;

// Re-export commonly used items
pub use backend::{BackendResult, CollectiveBackend};
pub use binding::{EntryPoint, HostValue, NcclModule, IDENTITY_PROVIDER};
pub use communicator::{Communicator, CommunicatorFactory};
pub use dispatch::{CollectiveGroup, Collectives, ElementType, ReduceOp, NO_PEER};
pub use identity::{GroupIdentity, IdentityExchange};
#[cfg(feature = "cuda")]
pub use nccl_backend::NcclBackend;
pub use nccl_sys::{DevicePtr, NativeComm, Stream};
pub use sim_backend::{SimCall, SimulatedBackend};
pub use tracker::{Handle, ResourceTracker, NULL_HANDLE};
