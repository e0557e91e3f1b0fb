//! Communicator lifecycle and collective dispatch for an SPMD device runtime.

pub mod distributed;
pub mod utils;

pub use distributed::{
    CollectiveBackend, Collectives, CommunicatorFactory, GroupIdentity, HostValue, NcclModule,
    ResourceTracker, SimulatedBackend,
};
pub use utils::error::{CommError, Result};
