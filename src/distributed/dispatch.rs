//! Reduction and data-movement collectives over a live communicator.
//!
//! Every operation enqueues its work on the caller's stream and returns once enqueuing
//! has succeeded or failed. Completion is observed by synchronizing the stream.

use super::backend::{BackendResult, CollectiveBackend};
use super::communicator::Communicator;
use super::nccl_sys::{DevicePtr, NcclDataType, NcclRedOp, Stream};
use crate::utils::error::{CommError, Result};
use tracing::{trace, warn};

/// Peer id meaning "no transfer in this direction" for [`Collectives::permute`].
pub const NO_PEER: i32 = -1;

/// Element-wise reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Avg,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 5] = [
        ReduceOp::Sum,
        ReduceOp::Prod,
        ReduceOp::Min,
        ReduceOp::Max,
        ReduceOp::Avg,
    ];

    /// Suffix used in entry-point names.
    pub fn suffix(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::Avg => "avg",
        }
    }

    pub fn to_nccl(self) -> NcclRedOp {
        match self {
            ReduceOp::Sum => NcclRedOp::Sum,
            ReduceOp::Prod => NcclRedOp::Prod,
            ReduceOp::Min => NcclRedOp::Min,
            ReduceOp::Max => NcclRedOp::Max,
            ReduceOp::Avg => NcclRedOp::Avg,
        }
    }
}

/// Element type of a reduction. There is no implicit promotion between types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I8,
    UI8,
    I32,
    UI32,
    I64,
    UI64,
    F16,
    F32,
    F64,
    BF16,
}

impl ElementType {
    pub const ALL: [ElementType; 10] = [
        ElementType::I8,
        ElementType::UI8,
        ElementType::I32,
        ElementType::UI32,
        ElementType::I64,
        ElementType::UI64,
        ElementType::F16,
        ElementType::F32,
        ElementType::F64,
        ElementType::BF16,
    ];

    /// Suffix used in entry-point names.
    pub fn suffix(self) -> &'static str {
        match self {
            ElementType::I8 => "i8",
            ElementType::UI8 => "ui8",
            ElementType::I32 => "i32",
            ElementType::UI32 => "ui32",
            ElementType::I64 => "i64",
            ElementType::UI64 => "ui64",
            ElementType::F16 => "f16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::BF16 => "bf16",
        }
    }

    pub fn to_nccl(self) -> NcclDataType {
        match self {
            ElementType::I8 => NcclDataType::Int8,
            ElementType::UI8 => NcclDataType::Uint8,
            ElementType::I32 => NcclDataType::Int32,
            ElementType::UI32 => NcclDataType::Uint32,
            ElementType::I64 => NcclDataType::Int64,
            ElementType::UI64 => NcclDataType::Uint64,
            ElementType::F16 => NcclDataType::Float16,
            ElementType::F32 => NcclDataType::Float32,
            ElementType::F64 => NcclDataType::Float64,
            ElementType::BF16 => NcclDataType::Bfloat16,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        self.to_nccl().size_in_bytes()
    }
}

/// A group bracket on the calling thread.
///
/// Creating it issues the start marker. The end marker is issued by [`finish`], or by
/// drop on any early exit, so the bracket is always balanced.
///
/// [`finish`]: CollectiveGroup::finish
pub struct CollectiveGroup<'a> {
    backend: &'a dyn CollectiveBackend,
    open: bool,
}

impl<'a> CollectiveGroup<'a> {
    pub fn start(backend: &'a dyn CollectiveBackend) -> BackendResult<Self> {
        backend.group_start()?;
        Ok(Self {
            backend,
            open: true,
        })
    }

    /// Close the bracket and issue the grouped operations.
    pub fn finish(mut self) -> BackendResult<()> {
        self.open = false;
        self.backend.group_end()
    }
}

impl Drop for CollectiveGroup<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.backend.group_end() {
                warn!(error = %e, "Closing abandoned collective group failed");
            }
        }
    }
}

/// Collectives issued by one participant on one stream.
pub struct Collectives<'a> {
    backend: &'a dyn CollectiveBackend,
    comm: &'a Communicator,
    stream: Stream,
}

impl<'a> Collectives<'a> {
    pub fn new(backend: &'a dyn CollectiveBackend, comm: &'a Communicator, stream: Stream) -> Self {
        Self {
            backend,
            comm,
            stream,
        }
    }

    /// Combine `count` elements across all ranks; every rank receives the result.
    ///
    /// # Safety
    /// `send` and `recv` must each address `count` elements of device memory that stay
    /// valid until the stream has executed the operation. They may be equal.
    pub unsafe fn all_reduce(
        &self,
        op: ReduceOp,
        dtype: ElementType,
        send: DevicePtr,
        recv: DevicePtr,
        count: usize,
    ) -> Result<()> {
        trace!(op = op.suffix(), dtype = dtype.suffix(), count, "all_reduce");
        self.backend
            .all_reduce(
                send,
                recv,
                count,
                dtype.to_nccl(),
                op.to_nccl(),
                self.comm.native(),
                self.stream,
            )
            .map_err(|e| CommError::collective("all_reduce", e))
    }

    /// Combine `size * recv_count` elements and give rank `r` the `r`-th shard.
    ///
    /// # Safety
    /// `send` must address `size * recv_count` elements and `recv` must address
    /// `recv_count` elements, both valid until the stream has executed the operation.
    pub unsafe fn reduce_scatter(
        &self,
        op: ReduceOp,
        dtype: ElementType,
        send: DevicePtr,
        recv: DevicePtr,
        recv_count: usize,
    ) -> Result<()> {
        trace!(op = op.suffix(), dtype = dtype.suffix(), count = recv_count, "reduce_scatter");
        self.backend
            .reduce_scatter(
                send,
                recv,
                recv_count,
                dtype.to_nccl(),
                op.to_nccl(),
                self.comm.native(),
                self.stream,
            )
            .map_err(|e| CommError::collective("reduce_scatter", e))
    }

    /// Concatenate every rank's `send_bytes` bytes, in rank order, on every rank.
    ///
    /// # Safety
    /// `send` must address `send_bytes` bytes and `recv` at least `size * send_bytes`
    /// bytes, both valid until the stream has executed the operation.
    pub unsafe fn all_gather(&self, send: DevicePtr, recv: DevicePtr, send_bytes: usize) -> Result<()> {
        trace!(count = send_bytes, "all_gather");
        self.backend
            .all_gather(
                send,
                recv,
                send_bytes,
                NcclDataType::Int8,
                self.comm.native(),
                self.stream,
            )
            .map_err(|e| CommError::collective("all_gather", e))
    }

    /// Exchange shard `k` of every rank's input with rank `k`.
    ///
    /// Both buffers are split into `size` shards of `num_bytes / size` bytes. Rank `r`
    /// sends its shard `k` to rank `k` and receives rank `k`'s shard `r` into its slot `k`.
    /// All transfers are issued as one group.
    ///
    /// # Safety
    /// `send` and `recv` must each address `num_bytes` bytes valid until the stream has
    /// executed the operation. `num_bytes` must be a multiple of the group size; see
    /// [`all_to_all_checked`](Self::all_to_all_checked).
    pub unsafe fn all_to_all(&self, send: DevicePtr, recv: DevicePtr, num_bytes: usize) -> Result<()> {
        let size = self.comm.size() as usize;
        let shard = num_bytes / size;
        trace!(count = num_bytes, shard, "all_to_all");

        let map_err = |e| CommError::collective("all_to_all", e);
        let group = CollectiveGroup::start(self.backend).map_err(map_err)?;
        for peer in 0..size {
            let offset = peer * shard;
            self.backend
                .send(
                    send.offset(offset),
                    shard,
                    NcclDataType::Int8,
                    peer as i32,
                    self.comm.native(),
                    self.stream,
                )
                .map_err(map_err)?;
            self.backend
                .recv(
                    recv.offset(offset),
                    shard,
                    NcclDataType::Int8,
                    peer as i32,
                    self.comm.native(),
                    self.stream,
                )
                .map_err(map_err)?;
        }
        group.finish().map_err(map_err)
    }

    /// [`all_to_all`](Self::all_to_all) that rejects a `num_bytes` not divisible by the
    /// group size instead of dropping the remainder.
    ///
    /// # Safety
    /// As for `all_to_all`.
    pub unsafe fn all_to_all_checked(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        num_bytes: usize,
    ) -> Result<()> {
        let size = self.comm.size() as usize;
        if num_bytes % size != 0 {
            return Err(CommError::InvalidArgument(format!(
                "all_to_all of {} bytes does not split into {} equal shards",
                num_bytes, size
            )));
        }
        self.all_to_all(send, recv, num_bytes)
    }

    /// Send `num_bytes` to `send_id` and receive `num_bytes` from `recv_id`, as one group.
    ///
    /// Either peer may be [`NO_PEER`]. Without a receive, `recv` is zero-filled on the
    /// stream instead.
    ///
    /// # Safety
    /// `send` (when sending) and `recv` must each address `num_bytes` bytes valid until
    /// the stream has executed the operation.
    pub unsafe fn permute(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        send_id: i32,
        recv_id: i32,
        num_bytes: usize,
    ) -> Result<()> {
        trace!(send_id, recv_id, count = num_bytes, "permute");
        let map_err = |e| CommError::collective("permute", e);

        let group = CollectiveGroup::start(self.backend).map_err(map_err)?;
        if send_id != NO_PEER {
            self.backend
                .send(
                    send,
                    num_bytes,
                    NcclDataType::Int8,
                    send_id,
                    self.comm.native(),
                    self.stream,
                )
                .map_err(map_err)?;
        }
        if recv_id != NO_PEER {
            self.backend
                .recv(
                    recv,
                    num_bytes,
                    NcclDataType::Int8,
                    recv_id,
                    self.comm.native(),
                    self.stream,
                )
                .map_err(map_err)?;
        } else {
            self.backend
                .memset_d8_async(recv, 0, num_bytes, self.stream)
                .map_err(CommError::Device)?;
        }
        group.finish().map_err(map_err)
    }
}
