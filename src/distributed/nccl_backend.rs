//! NCCL-backed implementation of `CollectiveBackend`.
//!
//! Every call goes straight to the linked NCCL, CUDA runtime or CUDA driver library.
//! Failures carry the library's own code and error string.

use super::backend::{BackendResult, CollectiveBackend};
use super::nccl_sys::{
    cuGetErrorString, cuMemsetD8Async, cudaGetErrorString, cudaSetDevice, ncclAllGather,
    ncclAllReduce, ncclCommCount, ncclCommDestroy, ncclCommFinalize, ncclCommInitRank,
    ncclCommSplit, ncclCommUserRank, ncclGetErrorString, ncclGetLastError, ncclGetUniqueId,
    ncclGetVersion, ncclGroupEnd, ncclGroupStart, ncclRecv, ncclReduceScatter, ncclSend,
    CudaError, DevicePtr, NativeComm, NcclComm, NcclDataType, NcclRedOp, NcclResult,
    NcclUniqueId, Stream, CUDA_SUCCESS,
};
use crate::utils::error::NativeError;
use std::ffi::CStr;
use std::os::raw::c_char;
use tracing::debug;

unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Check an NCCL result, attaching the last error message of `comm` when there is one.
fn check_nccl(result: NcclResult, comm: NativeComm) -> BackendResult<()> {
    if result == NcclResult::Success {
        return Ok(());
    }
    let mut message = unsafe { c_string(ncclGetErrorString(result)) };
    let detail = unsafe { c_string(ncclGetLastError(comm.as_ptr())) };
    if !detail.is_empty() {
        message = format!("{}: {}", message, detail);
    }
    Err(NativeError::new("nccl", result as i32, message))
}

fn check_cudart(error: CudaError) -> BackendResult<()> {
    if error == CUDA_SUCCESS {
        return Ok(());
    }
    let message = unsafe { c_string(cudaGetErrorString(error)) };
    Err(NativeError::new("cuda", error, message))
}

fn check_driver(error: CudaError) -> BackendResult<()> {
    if error == CUDA_SUCCESS {
        return Ok(());
    }
    let mut ptr: *const c_char = std::ptr::null();
    let message = unsafe {
        cuGetErrorString(error, &mut ptr);
        c_string(ptr)
    };
    Err(NativeError::new("cuda", error, message))
}

/// The linked NCCL library.
#[derive(Debug, Default)]
pub struct NcclBackend;

impl NcclBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CollectiveBackend for NcclBackend {
    fn name(&self) -> &'static str {
        "nccl"
    }

    fn version(&self) -> BackendResult<i32> {
        let mut version: i32 = 0;
        check_nccl(unsafe { ncclGetVersion(&mut version) }, NativeComm::NULL)?;
        Ok(version)
    }

    fn get_unique_id(&self) -> BackendResult<NcclUniqueId> {
        let mut id = NcclUniqueId::default();
        check_nccl(unsafe { ncclGetUniqueId(&mut id) }, NativeComm::NULL)?;
        Ok(id)
    }

    fn set_device(&self, device: i32) -> BackendResult<()> {
        check_cudart(unsafe { cudaSetDevice(device) })
    }

    fn comm_init_rank(&self, nranks: i32, id: &NcclUniqueId, rank: i32) -> BackendResult<NativeComm> {
        let mut comm: *mut NcclComm = std::ptr::null_mut();
        let result = unsafe { ncclCommInitRank(&mut comm, nranks, *id, rank) };
        check_nccl(result, NativeComm(comm as usize))?;
        debug!(comm = comm as usize, rank, nranks, "Created NCCL communicator");
        Ok(NativeComm(comm as usize))
    }

    fn comm_split(&self, comm: NativeComm, color: i32, key: i32) -> BackendResult<NativeComm> {
        let mut new_comm: *mut NcclComm = std::ptr::null_mut();
        let result = unsafe {
            ncclCommSplit(comm.as_ptr(), color, key, &mut new_comm, std::ptr::null_mut())
        };
        check_nccl(result, comm)?;
        debug!(parent = comm.0, comm = new_comm as usize, color, key, "Split NCCL communicator");
        Ok(NativeComm(new_comm as usize))
    }

    fn comm_user_rank(&self, comm: NativeComm) -> BackendResult<i32> {
        let mut rank: i32 = 0;
        check_nccl(unsafe { ncclCommUserRank(comm.as_ptr(), &mut rank) }, comm)?;
        Ok(rank)
    }

    fn comm_count(&self, comm: NativeComm) -> BackendResult<i32> {
        let mut count: i32 = 0;
        check_nccl(unsafe { ncclCommCount(comm.as_ptr(), &mut count) }, comm)?;
        Ok(count)
    }

    fn comm_finalize(&self, comm: NativeComm) -> BackendResult<()> {
        check_nccl(unsafe { ncclCommFinalize(comm.as_ptr()) }, comm)
    }

    fn comm_destroy(&self, comm: NativeComm) -> BackendResult<()> {
        // The communicator is gone afterwards; its last error cannot be queried.
        check_nccl(unsafe { ncclCommDestroy(comm.as_ptr()) }, NativeComm::NULL)
    }

    unsafe fn all_reduce(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()> {
        let result = ncclAllReduce(
            send.as_ptr(),
            recv.as_mut_ptr(),
            count,
            dtype,
            op,
            comm.as_ptr(),
            stream.as_raw(),
        );
        check_nccl(result, comm)
    }

    unsafe fn reduce_scatter(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        recv_count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()> {
        let result = ncclReduceScatter(
            send.as_ptr(),
            recv.as_mut_ptr(),
            recv_count,
            dtype,
            op,
            comm.as_ptr(),
            stream.as_raw(),
        );
        check_nccl(result, comm)
    }

    unsafe fn all_gather(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        send_count: usize,
        dtype: NcclDataType,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()> {
        let result = ncclAllGather(
            send.as_ptr(),
            recv.as_mut_ptr(),
            send_count,
            dtype,
            comm.as_ptr(),
            stream.as_raw(),
        );
        check_nccl(result, comm)
    }

    unsafe fn send(
        &self,
        send: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()> {
        let result = ncclSend(send.as_ptr(), count, dtype, peer, comm.as_ptr(), stream.as_raw());
        check_nccl(result, comm)
    }

    unsafe fn recv(
        &self,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        comm: NativeComm,
        stream: Stream,
    ) -> BackendResult<()> {
        let result = ncclRecv(recv.as_mut_ptr(), count, dtype, peer, comm.as_ptr(), stream.as_raw());
        check_nccl(result, comm)
    }

    fn group_start(&self) -> BackendResult<()> {
        check_nccl(unsafe { ncclGroupStart() }, NativeComm::NULL)
    }

    fn group_end(&self) -> BackendResult<()> {
        check_nccl(unsafe { ncclGroupEnd() }, NativeComm::NULL)
    }

    unsafe fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        len: usize,
        stream: Stream,
    ) -> BackendResult<()> {
        check_driver(cuMemsetD8Async(dst.0 as u64, value, len, stream.as_raw()))
    }
}
