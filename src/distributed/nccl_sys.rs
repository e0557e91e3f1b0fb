//! NCCL and CUDA boundary types.
//!
//! The enums mirror `ncclResult_t`, `ncclDataType_t` and `ncclRedOp_t` so they can be
//! passed straight through the C ABI. The raw `extern "C"` declarations are only compiled
//! with the `cuda` feature; everything else is usable by any backend.

use std::ffi::c_void;
use std::fmt;

/// Size of `ncclUniqueId::internal`.
pub const NCCL_UNIQUE_ID_BYTES: usize = 128;

/// `NCCL_SPLIT_NOCOLOR`: a participant passing this color does not join any sub-group.
pub const NCCL_SPLIT_NOCOLOR: i32 = -1;

/// Equivalent of the `NCCL_VERSION(X, Y, Z)` macro for 2.9+.
pub const fn nccl_version_code(major: i32, minor: i32, patch: i32) -> i32 {
    major * 10000 + minor * 100 + patch
}

/// First library release that ships `ncclCommSplit`.
pub const MIN_SPLIT_VERSION: i32 = nccl_version_code(2, 18, 1);

/// NCCL result codes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcclResult {
    Success = 0,
    UnhandledCudaError = 1,
    SystemError = 2,
    InternalError = 3,
    InvalidArgument = 4,
    InvalidUsage = 5,
    RemoteError = 6,
    InProgress = 7,
    NumResults = 8,
}

impl NcclResult {
    /// Fallback description, used when the library itself is not linked.
    pub fn description(self) -> &'static str {
        match self {
            NcclResult::Success => "no error",
            NcclResult::UnhandledCudaError => "unhandled cuda error",
            NcclResult::SystemError => "unhandled system error",
            NcclResult::InternalError => "internal error",
            NcclResult::InvalidArgument => "invalid argument",
            NcclResult::InvalidUsage => "invalid usage",
            NcclResult::RemoteError => "remote process exited or there was a network error",
            NcclResult::InProgress => "NCCL operation in progress",
            NcclResult::NumResults => "unknown result code",
        }
    }
}

/// NCCL data types (matches ncclDataType_t)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NcclDataType {
    Int8 = 0,
    Uint8 = 1,
    Int32 = 2,
    Uint32 = 3,
    Int64 = 4,
    Uint64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    Bfloat16 = 9,
}

impl NcclDataType {
    /// Width of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            NcclDataType::Int8 | NcclDataType::Uint8 => 1,
            NcclDataType::Float16 | NcclDataType::Bfloat16 => 2,
            NcclDataType::Int32 | NcclDataType::Uint32 | NcclDataType::Float32 => 4,
            NcclDataType::Int64 | NcclDataType::Uint64 | NcclDataType::Float64 => 8,
        }
    }
}

/// NCCL reduction operations
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NcclRedOp {
    Sum = 0,
    Prod = 1,
    Max = 2,
    Min = 3,
    Avg = 4,
}

/// Opaque NCCL communicator handle
#[repr(C)]
pub struct NcclComm {
    _private: [u8; 0],
}

/// NCCL unique ID for initialization
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NcclUniqueId {
    pub internal: [u8; NCCL_UNIQUE_ID_BYTES],
}

impl Default for NcclUniqueId {
    fn default() -> Self {
        Self {
            internal: [0u8; NCCL_UNIQUE_ID_BYTES],
        }
    }
}

impl fmt::Debug for NcclUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NcclUniqueId({})", super::identity::hex_string(&self.internal[..8]))
    }
}

/// A backend-native communicator handle, stored as an integer.
///
/// For the NCCL backend this is the `ncclComm_t` pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeComm(pub usize);

impl NativeComm {
    pub const NULL: NativeComm = NativeComm(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr(self) -> *mut NcclComm {
        self.0 as *mut NcclComm
    }
}

/// A device address passed across the host boundary as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    /// Address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }

    pub fn as_mut_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// A CUDA stream handle passed across the host boundary as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream(pub usize);

impl Stream {
    /// The legacy default stream.
    pub const DEFAULT: Stream = Stream(0);

    pub fn as_raw(self) -> CudaStream {
        self.0 as CudaStream
    }
}

/// CUDA stream handle (opaque pointer)
pub type CudaStream = *mut c_void;

/// `cudaError_t` / `CUresult` are plain C enums.
pub type CudaError = i32;

pub const CUDA_SUCCESS: CudaError = 0;

/// `cudaErrorInvalidDevice`
pub const CUDA_ERROR_INVALID_DEVICE: CudaError = 101;

#[cfg(feature = "cuda")]
mod ffi {
    use super::*;
    use std::os::raw::c_char;

    #[link(name = "nccl")]
    extern "C" {
        pub fn ncclGetUniqueId(uniqueId: *mut NcclUniqueId) -> NcclResult;

        pub fn ncclCommInitRank(
            comm: *mut *mut NcclComm,
            nranks: i32,
            commId: NcclUniqueId,
            rank: i32,
        ) -> NcclResult;

        pub fn ncclCommSplit(
            comm: *mut NcclComm,
            color: i32,
            key: i32,
            newcomm: *mut *mut NcclComm,
            config: *mut c_void,
        ) -> NcclResult;

        pub fn ncclCommFinalize(comm: *mut NcclComm) -> NcclResult;

        pub fn ncclCommDestroy(comm: *mut NcclComm) -> NcclResult;

        pub fn ncclCommCount(comm: *mut NcclComm, count: *mut i32) -> NcclResult;

        pub fn ncclCommUserRank(comm: *mut NcclComm, rank: *mut i32) -> NcclResult;

        pub fn ncclAllReduce(
            sendbuff: *const c_void,
            recvbuff: *mut c_void,
            count: usize,
            datatype: NcclDataType,
            op: NcclRedOp,
            comm: *mut NcclComm,
            stream: CudaStream,
        ) -> NcclResult;

        pub fn ncclAllGather(
            sendbuff: *const c_void,
            recvbuff: *mut c_void,
            sendcount: usize,
            datatype: NcclDataType,
            comm: *mut NcclComm,
            stream: CudaStream,
        ) -> NcclResult;

        pub fn ncclReduceScatter(
            sendbuff: *const c_void,
            recvbuff: *mut c_void,
            recvcount: usize,
            datatype: NcclDataType,
            op: NcclRedOp,
            comm: *mut NcclComm,
            stream: CudaStream,
        ) -> NcclResult;

        pub fn ncclSend(
            sendbuff: *const c_void,
            count: usize,
            datatype: NcclDataType,
            peer: i32,
            comm: *mut NcclComm,
            stream: CudaStream,
        ) -> NcclResult;

        pub fn ncclRecv(
            recvbuff: *mut c_void,
            count: usize,
            datatype: NcclDataType,
            peer: i32,
            comm: *mut NcclComm,
            stream: CudaStream,
        ) -> NcclResult;

        pub fn ncclGroupStart() -> NcclResult;

        pub fn ncclGroupEnd() -> NcclResult;

        pub fn ncclGetErrorString(result: NcclResult) -> *const c_char;

        pub fn ncclGetLastError(comm: *mut NcclComm) -> *const c_char;

        pub fn ncclGetVersion(version: *mut i32) -> NcclResult;
    }

    #[link(name = "cudart")]
    extern "C" {
        pub fn cudaSetDevice(device: i32) -> CudaError;

        pub fn cudaGetErrorString(error: CudaError) -> *const c_char;
    }

    #[link(name = "cuda")]
    extern "C" {
        pub fn cuMemsetD8Async(
            dst_device: u64,
            uc: u8,
            n: usize,
            stream: CudaStream,
        ) -> CudaError;

        pub fn cuGetErrorString(error: CudaError, p_str: *mut *const c_char) -> CudaError;
    }
}

#[cfg(feature = "cuda")]
pub use ffi::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_version_gate() {
        assert_eq!(MIN_SPLIT_VERSION, 21801);
        assert!(nccl_version_code(2, 18, 0) < MIN_SPLIT_VERSION);
        assert!(nccl_version_code(2, 21, 5) > MIN_SPLIT_VERSION);
    }

    #[test]
    fn test_dtype_size() {
        assert_eq!(NcclDataType::Float32.size_in_bytes(), 4);
        assert_eq!(NcclDataType::Float16.size_in_bytes(), 2);
        assert_eq!(NcclDataType::Bfloat16.size_in_bytes(), 2);
        assert_eq!(NcclDataType::Float64.size_in_bytes(), 8);
        assert_eq!(NcclDataType::Int8.size_in_bytes(), 1);
        assert_eq!(NcclDataType::Uint64.size_in_bytes(), 8);
    }

    #[test]
    fn test_abi_discriminants() {
        assert_eq!(NcclDataType::Int8 as i32, 0);
        assert_eq!(NcclDataType::Bfloat16 as i32, 9);
        assert_eq!(NcclRedOp::Max as i32, 2);
        assert_eq!(NcclRedOp::Min as i32, 3);
        assert_eq!(NcclRedOp::Avg as i32, 4);
    }

    #[test]
    fn test_native_comm_null() {
        assert!(NativeComm::NULL.is_null());
        assert!(!NativeComm(0x1000).is_null());
        assert_eq!(DevicePtr(0x1000).offset(16), DevicePtr(0x1010));
    }
}
