//! The seam between this crate and the collective-communication library.
//!
//! Implementations include:
//! - `NcclBackend`: NCCL + CUDA over FFI (requires the `cuda` feature)
//! - `SimulatedBackend`: in-process, thread-per-rank simulation over host memory

use super::nccl_sys::{DevicePtr, NativeComm, NcclDataType, NcclRedOp, NcclUniqueId, Stream};
use crate::utils::error::NativeError;

pub type BackendResult<T> = std::result::Result<T, NativeError>;

/// Calls the collective library exposes, one method per native entry point.
///
/// Every data-movement method is asynchronous with respect to `stream`: it enqueues work
/// and returns once enqueuing has succeeded or failed.
///
/// # Safety
///
/// The `unsafe` methods take raw device addresses. Callers must guarantee that every
/// address is valid device memory of at least the implied byte length and stays valid
/// until the enqueued work on `stream` has completed.
pub trait CollectiveBackend: Send + Sync {
    /// Short library name used in error reports.
    fn name(&self) -> &'static str;

    /// Library version code, in `nccl_version_code` form.
    fn version(&self) -> BackendResult<i32>;

    /// Generate a fresh group identity.
    fn get_unique_id(&self) -> BackendResult<NcclUniqueId>;

    /// Bind the calling thread to `device`.
    fn set_device(&self, device: i32) -> BackendResult<()>;

    /// Blocking rendezvous of `nranks` participants sharing `id`.
    fn comm_init_rank(&self, nranks: i32, id: &NcclUniqueId, rank: i32) -> BackendResult<NativeComm>;

    /// Blocking split of `comm`. Returns `NativeComm::NULL` for `NCCL_SPLIT_NOCOLOR`.
    fn comm_split(&self, comm: NativeComm, color: i32, key: i32) -> BackendResult<NativeComm>;

    fn comm_user_rank(&self, comm: NativeComm) -> BackendResult<i32>;

    fn comm_count(&self, comm: NativeComm) -> BackendResult<i32>;

    /// Drain outstanding work on `comm`.
    fn comm_finalize(&self, comm: NativeComm) -> BackendResult<()>;

    /// Release the native resources of `comm`.
    fn comm_destroy(&self, comm: NativeComm) -> BackendResult<()>;

    /// # Safety
    /// See the trait-level contract.
    #[allow(clippy::too_many_arguments)]
    unsafe fn all_reduce(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()>;

    /// # Safety
    /// See the trait-level contract.
    #[allow(clippy::too_many_arguments)]
    unsafe fn reduce_scatter(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        recv_count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()>;

    /// # Safety
    /// See the trait-level contract.
    unsafe fn all_gather(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        send_count: usize,
        dtype: NcclDataType,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()>;

    /// # Safety
    /// See the trait-level contract.
    unsafe fn send(
        &self,
        send: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()>;

    /// # Safety
    /// See the trait-level contract.
    unsafe fn recv(
        &self,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()>;

    /// Open a group bracket on the calling thread.
    fn group_start(&self) -> BackendResult<()>;

    /// Close the innermost group bracket on the calling thread, issuing its operations.
    fn group_end(&self) -> BackendResult<()>;

    /// Asynchronously set `len` bytes at `dst` to `value` on `stream`.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        len: usize,
        stream: Stream,
    ) -> BackendResult<()>;
}
