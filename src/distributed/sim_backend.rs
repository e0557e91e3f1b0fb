//! In-process collective backend for hosts without GPUs.
//!
//! Each participant is a thread sharing one `SimulatedBackend`. Device pointers are host
//! addresses and streams complete eagerly: every call has finished its data movement by
//! the time it returns. Rendezvous calls (`comm_init_rank`, `comm_split`) and collectives
//! block until every member of the group has arrived, like the real library.

use super::backend::{BackendResult, CollectiveBackend};
use super::nccl_sys::{
    DevicePtr, NativeComm, NcclDataType, NcclRedOp, NcclResult, NcclUniqueId, Stream,
    CUDA_ERROR_INVALID_DEVICE, MIN_SPLIT_VERSION, NCCL_SPLIT_NOCOLOR, NCCL_UNIQUE_ID_BYTES,
};
use crate::utils::error::NativeError;
use half::{bf16, f16};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

/// Library calls that can be made to fail with [`SimulatedBackend::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    GetUniqueId,
    SetDevice,
    CommInitRank,
    CommSplit,
    CommUserRank,
    CommCount,
    CommFinalize,
    CommDestroy,
    AllReduce,
    ReduceScatter,
    AllGather,
    Send,
    Recv,
    GroupStart,
    GroupEnd,
    MemsetAsync,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn nccl_error(code: NcclResult, detail: impl AsRef<str>) -> NativeError {
    NativeError::new(
        "nccl",
        code as i32,
        format!("{}: {}", code.description(), detail.as_ref()),
    )
}

unsafe fn read_device(ptr: DevicePtr, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr.0 as *const u8, len).to_vec()
}

unsafe fn write_device(ptr: DevicePtr, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    std::ptr::copy(data.as_ptr(), ptr.0 as *mut u8, data.len());
}

// ============================================================================
// Groups and rendezvous
// ============================================================================

#[derive(Default)]
struct Round {
    deposits: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    result: Option<Arc<Vec<Vec<u8>>>>,
}

/// Shared state of one communication group.
struct SimGroup {
    size: usize,
    claimed: Mutex<Vec<bool>>,
    round: Mutex<Round>,
    round_cv: Condvar,
    mailbox: Mutex<HashMap<(usize, usize), VecDeque<Vec<u8>>>>,
    mailbox_cv: Condvar,
    /// Sub-groups being formed by a split, keyed by (split sequence, color), with the
    /// number of members that still have to pick the group up.
    children: Mutex<HashMap<(u64, i32), (Arc<SimGroup>, usize)>>,
}

impl SimGroup {
    fn new(size: usize) -> Self {
        Self {
            size,
            claimed: Mutex::new(vec![false; size]),
            round: Mutex::new(Round {
                deposits: vec![None; size],
                ..Default::default()
            }),
            round_cv: Condvar::new(),
            mailbox: Mutex::new(HashMap::new()),
            mailbox_cv: Condvar::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Deposit `data` for `rank` and block until every rank has deposited.
    ///
    /// Returns all contributions in rank order.
    fn exchange(&self, rank: usize, data: Vec<u8>) -> Arc<Vec<Vec<u8>>> {
        let mut round = lock(&self.round);
        // The previous round must be fully drained before this one can start.
        while round.result.is_some() {
            round = self.round_cv.wait(round).unwrap_or_else(|e| e.into_inner());
        }

        round.deposits[rank] = Some(data);
        round.arrived += 1;
        if round.arrived == self.size {
            let all = round
                .deposits
                .iter_mut()
                .map(|d| d.take().unwrap_or_default())
                .collect();
            round.result = Some(Arc::new(all));
            self.round_cv.notify_all();
        }

        let result = loop {
            if let Some(result) = &round.result {
                break result.clone();
            }
            round = self.round_cv.wait(round).unwrap_or_else(|e| e.into_inner());
        };

        round.departed += 1;
        if round.departed == self.size {
            round.result = None;
            round.arrived = 0;
            round.departed = 0;
            self.round_cv.notify_all();
        }
        result
    }

    fn post(&self, src: usize, dst: usize, data: Vec<u8>) {
        lock(&self.mailbox)
            .entry((src, dst))
            .or_default()
            .push_back(data);
        self.mailbox_cv.notify_all();
    }

    fn take(&self, src: usize, dst: usize) -> Vec<u8> {
        let mut mailbox = lock(&self.mailbox);
        loop {
            if let Some(data) = mailbox.get_mut(&(src, dst)).and_then(VecDeque::pop_front) {
                return data;
            }
            mailbox = self.mailbox_cv.wait(mailbox).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Fetch (or create) the sub-group for `color` formed by split number `seq`.
    fn child(&self, seq: u64, color: i32, size: usize) -> Arc<SimGroup> {
        let mut children = lock(&self.children);
        let entry = children
            .entry((seq, color))
            .or_insert_with(|| (Arc::new(SimGroup::new(size)), size));
        let group = entry.0.clone();
        entry.1 -= 1;
        if entry.1 == 0 {
            children.remove(&(seq, color));
        }
        group
    }
}

struct SimComm {
    group: Arc<SimGroup>,
    rank: usize,
    splits: AtomicU64,
    finalized: AtomicBool,
}

impl SimComm {
    fn new(group: Arc<SimGroup>, rank: usize) -> Self {
        Self {
            group,
            rank,
            splits: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn peer(&self, peer: i32) -> BackendResult<usize> {
        usize::try_from(peer)
            .ok()
            .filter(|&p| p < self.size())
            .ok_or_else(|| {
                nccl_error(
                    NcclResult::InvalidArgument,
                    format!("peer {} out of range for group of {}", peer, self.size()),
                )
            })
    }
}

enum PendingP2p {
    Send {
        comm: Arc<SimComm>,
        src: DevicePtr,
        len: usize,
        peer: usize,
    },
    Recv {
        comm: Arc<SimComm>,
        dst: DevicePtr,
        len: usize,
        peer: usize,
    },
}

#[derive(Default)]
struct GroupBracket {
    depth: usize,
    pending: Vec<PendingP2p>,
    /// First failure inside the bracket; the queued work is dropped at `group_end`.
    failed: Option<NativeError>,
}

// ============================================================================
// Reductions
// ============================================================================

trait SimElement: Copy {
    const SIZE: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut [u8]);
    fn combine(self, other: Self, op: NcclRedOp) -> Self;
    fn average(self, n: usize) -> Self;
}

macro_rules! impl_sim_int {
    ($($t:ty),*) => {$(
        impl SimElement for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }
            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
            fn combine(self, other: Self, op: NcclRedOp) -> Self {
                match op {
                    NcclRedOp::Sum | NcclRedOp::Avg => self.wrapping_add(other),
                    NcclRedOp::Prod => self.wrapping_mul(other),
                    NcclRedOp::Max => self.max(other),
                    NcclRedOp::Min => self.min(other),
                }
            }
            fn average(self, n: usize) -> Self {
                ((self as i128) / (n as i128)) as $t
            }
        }
    )*};
}

macro_rules! impl_sim_float {
    ($($t:ty),*) => {$(
        impl SimElement for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }
            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
            fn combine(self, other: Self, op: NcclRedOp) -> Self {
                match op {
                    NcclRedOp::Sum | NcclRedOp::Avg => self + other,
                    NcclRedOp::Prod => self * other,
                    NcclRedOp::Max => self.max(other),
                    NcclRedOp::Min => self.min(other),
                }
            }
            fn average(self, n: usize) -> Self {
                self / n as $t
            }
        }
    )*};
}

macro_rules! impl_sim_half {
    ($($t:ty),*) => {$(
        impl SimElement for $t {
            const SIZE: usize = 2;
            fn read(bytes: &[u8]) -> Self {
                <$t>::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]]))
            }
            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_bits().to_ne_bytes());
            }
            fn combine(self, other: Self, op: NcclRedOp) -> Self {
                <$t>::from_f32(self.to_f32().combine(other.to_f32(), op))
            }
            fn average(self, n: usize) -> Self {
                <$t>::from_f32(self.to_f32() / n as f32)
            }
        }
    )*};
}

impl_sim_int!(i8, u8, i32, u32, i64, u64);
impl_sim_float!(f32, f64);
impl_sim_half!(f16, bf16);

fn reduce_typed<T: SimElement>(inputs: &[Vec<u8>], op: NcclRedOp) -> Vec<u8> {
    let mut acc = inputs.first().cloned().unwrap_or_default();
    for other in inputs.iter().skip(1) {
        for (a, b) in acc.chunks_exact_mut(T::SIZE).zip(other.chunks_exact(T::SIZE)) {
            T::read(a).combine(T::read(b), op).write(a);
        }
    }
    if op == NcclRedOp::Avg {
        for a in acc.chunks_exact_mut(T::SIZE) {
            T::read(a).average(inputs.len()).write(a);
        }
    }
    acc
}

/// Element-wise reduction of equally sized contributions.
fn reduce_bytes(inputs: &[Vec<u8>], dtype: NcclDataType, op: NcclRedOp) -> Vec<u8> {
    match dtype {
        NcclDataType::Int8 => reduce_typed::<i8>(inputs, op),
        NcclDataType::Uint8 => reduce_typed::<u8>(inputs, op),
        NcclDataType::Int32 => reduce_typed::<i32>(inputs, op),
        NcclDataType::Uint32 => reduce_typed::<u32>(inputs, op),
        NcclDataType::Int64 => reduce_typed::<i64>(inputs, op),
        NcclDataType::Uint64 => reduce_typed::<u64>(inputs, op),
        NcclDataType::Float16 => reduce_typed::<f16>(inputs, op),
        NcclDataType::Float32 => reduce_typed::<f32>(inputs, op),
        NcclDataType::Float64 => reduce_typed::<f64>(inputs, op),
        NcclDataType::Bfloat16 => reduce_typed::<bf16>(inputs, op),
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct SimulatedBackend {
    version: i32,
    num_devices: i32,
    next_id: AtomicU64,
    next_comm: AtomicUsize,
    pending_joins: Mutex<HashMap<[u8; NCCL_UNIQUE_ID_BYTES], Arc<SimGroup>>>,
    comms: Mutex<HashMap<usize, Arc<SimComm>>>,
    brackets: Mutex<HashMap<ThreadId, GroupBracket>>,
    faults: Mutex<HashMap<SimCall, NcclResult>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            version: MIN_SPLIT_VERSION,
            num_devices: 8,
            next_id: AtomicU64::new(1),
            next_comm: AtomicUsize::new(1),
            pending_joins: Mutex::new(HashMap::new()),
            comms: Mutex::new(HashMap::new()),
            brackets: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Report `version` instead of the first split-capable release.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_devices(mut self, num_devices: i32) -> Self {
        self.num_devices = num_devices;
        self
    }

    /// Make the next call of `call` fail with `result`.
    pub fn inject_fault(&self, call: SimCall, result: NcclResult) {
        lock(&self.faults).insert(call, result);
    }

    /// Number of communicators created and not yet destroyed.
    pub fn live_comms(&self) -> usize {
        lock(&self.comms).len()
    }

    fn check_fault(&self, call: SimCall) -> BackendResult<()> {
        match lock(&self.faults).remove(&call) {
            Some(result) => Err(nccl_error(result, format!("injected fault in {:?}", call))),
            None => Ok(()),
        }
    }

    fn register(&self, comm: SimComm) -> NativeComm {
        // Keep handles pointer-shaped and distinct from tracker handles.
        let native = self.next_comm.fetch_add(1, Ordering::Relaxed) << 4;
        lock(&self.comms).insert(native, Arc::new(comm));
        NativeComm(native)
    }

    fn comm(&self, native: NativeComm) -> BackendResult<Arc<SimComm>> {
        if native.is_null() {
            return Err(nccl_error(NcclResult::InvalidArgument, "null communicator"));
        }
        lock(&self.comms)
            .get(&native.0)
            .cloned()
            .ok_or_else(|| nccl_error(NcclResult::InvalidArgument, "unknown communicator"))
    }

    fn active_comm(&self, native: NativeComm) -> BackendResult<Arc<SimComm>> {
        let comm = self.comm(native)?;
        if comm.finalized.load(Ordering::Acquire) {
            return Err(nccl_error(NcclResult::InvalidUsage, "communicator is finalized"));
        }
        Ok(comm)
    }

    /// Record a failure against the calling thread's open bracket, if any.
    fn note_failure<T>(&self, result: BackendResult<T>) -> BackendResult<T> {
        if let Err(e) = &result {
            let mut brackets = lock(&self.brackets);
            if let Some(bracket) = brackets
                .get_mut(&thread::current().id())
                .filter(|b| b.depth > 0)
            {
                bracket.failed.get_or_insert_with(|| e.clone());
            }
        }
        result
    }

    /// Queue `op` if the calling thread is inside a group bracket.
    fn defer(&self, op: PendingP2p) -> Option<PendingP2p> {
        let mut brackets = lock(&self.brackets);
        match brackets.get_mut(&thread::current().id()) {
            Some(bracket) if bracket.depth > 0 => {
                bracket.pending.push(op);
                None
            }
            _ => Some(op),
        }
    }

    unsafe fn issue(op: PendingP2p) -> BackendResult<()> {
        match op {
            PendingP2p::Send {
                comm,
                src,
                len,
                peer,
            } => {
                comm.group.post(comm.rank, peer, read_device(src, len));
                Ok(())
            }
            PendingP2p::Recv {
                comm,
                dst,
                len,
                peer,
            } => {
                let data = comm.group.take(peer, comm.rank);
                if data.len() != len {
                    return Err(nccl_error(
                        NcclResult::InvalidUsage,
                        format!("recv of {} bytes matched a send of {}", len, data.len()),
                    ));
                }
                write_device(dst, &data);
                Ok(())
            }
        }
    }

    fn check_uniform(op: &str, contributions: &[Vec<u8>]) -> BackendResult<()> {
        let expected = contributions.first().map(Vec::len).unwrap_or_default();
        if contributions.iter().any(|c| c.len() != expected) {
            return Err(nccl_error(
                NcclResult::InvalidUsage,
                format!("{} called with mismatched counts across ranks", op),
            ));
        }
        Ok(())
    }
}

impl CollectiveBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "nccl-sim"
    }

    fn version(&self) -> BackendResult<i32> {
        Ok(self.version)
    }

    fn get_unique_id(&self) -> BackendResult<NcclUniqueId> {
        self.check_fault(SimCall::GetUniqueId)?;
        let serial = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut id = NcclUniqueId::default();
        id.internal[..8].copy_from_slice(&serial.to_le_bytes());
        id.internal[8..12].copy_from_slice(&std::process::id().to_le_bytes());
        id.internal[12..16].copy_from_slice(b"SIM\0");
        Ok(id)
    }

    fn set_device(&self, device: i32) -> BackendResult<()> {
        self.check_fault(SimCall::SetDevice)?;
        if device < 0 || device >= self.num_devices {
            return Err(NativeError::new(
                "cuda",
                CUDA_ERROR_INVALID_DEVICE,
                format!("invalid device ordinal {}", device),
            ));
        }
        trace!(device, "Bound simulated device");
        Ok(())
    }

    fn comm_init_rank(&self, nranks: i32, id: &NcclUniqueId, rank: i32) -> BackendResult<NativeComm> {
        self.check_fault(SimCall::CommInitRank)?;
        if nranks < 1 || rank < 0 || rank >= nranks {
            return Err(nccl_error(
                NcclResult::InvalidArgument,
                format!("rank {} invalid for {} ranks", rank, nranks),
            ));
        }
        let (size, rank) = (nranks as usize, rank as usize);

        let group = {
            let mut pending = lock(&self.pending_joins);
            let group = pending
                .entry(id.internal)
                .or_insert_with(|| Arc::new(SimGroup::new(size)))
                .clone();
            if group.size != size {
                return Err(nccl_error(
                    NcclResult::InvalidArgument,
                    format!("group formed with {} ranks, joined with {}", group.size, size),
                ));
            }
            let mut claimed = lock(&group.claimed);
            if claimed[rank] {
                return Err(nccl_error(
                    NcclResult::InvalidUsage,
                    format!("rank {} already joined this group", rank),
                ));
            }
            claimed[rank] = true;
            drop(claimed);
            group
        };

        group.exchange(rank, Vec::new());

        {
            let mut pending = lock(&self.pending_joins);
            if pending
                .get(&id.internal)
                .is_some_and(|g| Arc::ptr_eq(g, &group))
            {
                pending.remove(&id.internal);
            }
        }

        let native = self.register(SimComm::new(group, rank));
        debug!(rank, size, native = native.0, "Simulated communicator joined");
        Ok(native)
    }

    fn comm_split(&self, native: NativeComm, color: i32, key: i32) -> BackendResult<NativeComm> {
        self.check_fault(SimCall::CommSplit)?;
        let parent = self.active_comm(native)?;
        let seq = parent.splits.fetch_add(1, Ordering::Relaxed);

        let mut payload = color.to_le_bytes().to_vec();
        payload.extend_from_slice(&key.to_le_bytes());
        let all = parent.group.exchange(parent.rank, payload);

        if color == NCCL_SPLIT_NOCOLOR {
            return Ok(NativeComm::NULL);
        }
        if color < 0 {
            return Err(nccl_error(
                NcclResult::InvalidArgument,
                format!("split color {} must be non-negative", color),
            ));
        }

        let mut members: Vec<(i32, usize)> = all
            .iter()
            .enumerate()
            .filter_map(|(parent_rank, entry)| {
                let c = i32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                let k = i32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
                (c == color).then_some((k, parent_rank))
            })
            .collect();
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, parent_rank)| parent_rank == parent.rank)
            .ok_or_else(|| nccl_error(NcclResult::InternalError, "split lost the caller"))?;
        let child = parent.group.child(seq, color, members.len());

        Ok(self.register(SimComm::new(child, new_rank)))
    }

    fn comm_user_rank(&self, native: NativeComm) -> BackendResult<i32> {
        self.check_fault(SimCall::CommUserRank)?;
        Ok(self.comm(native)?.rank as i32)
    }

    fn comm_count(&self, native: NativeComm) -> BackendResult<i32> {
        self.check_fault(SimCall::CommCount)?;
        Ok(self.comm(native)?.size() as i32)
    }

    fn comm_finalize(&self, native: NativeComm) -> BackendResult<()> {
        self.check_fault(SimCall::CommFinalize)?;
        self.comm(native)?.finalized.store(true, Ordering::Release);
        Ok(())
    }

    fn comm_destroy(&self, native: NativeComm) -> BackendResult<()> {
        self.check_fault(SimCall::CommDestroy)?;
        lock(&self.comms)
            .remove(&native.0)
            .map(|_| ())
            .ok_or_else(|| nccl_error(NcclResult::InvalidArgument, "unknown communicator"))
    }

    unsafe fn all_reduce(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        native: NativeComm,
        _stream: Stream,
    ) -> BackendResult<()> {
        self.note_failure(self.check_fault(SimCall::AllReduce))?;
        let comm = self.note_failure(self.active_comm(native))?;
        let data = read_device(send, count * dtype.size_in_bytes());
        let all = comm.group.exchange(comm.rank, data);
        self.note_failure(Self::check_uniform("all_reduce", &all))?;
        write_device(recv, &reduce_bytes(&all, dtype, op));
        Ok(())
    }

    unsafe fn reduce_scatter(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        recv_count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        native: NativeComm,
        _stream: Stream,
    ) -> BackendResult<()> {
        self.note_failure(self.check_fault(SimCall::ReduceScatter))?;
        let comm = self.note_failure(self.active_comm(native))?;
        let shard = recv_count * dtype.size_in_bytes();
        let data = read_device(send, comm.size() * shard);
        let all = comm.group.exchange(comm.rank, data);
        self.note_failure(Self::check_uniform("reduce_scatter", &all))?;
        let reduced = reduce_bytes(&all, dtype, op);
        let start = comm.rank * shard;
        write_device(recv, &reduced[start..start + shard]);
        Ok(())
    }

    unsafe fn all_gather(
        &self,
        send: DevicePtr,
        recv: DevicePtr,
        send_count: usize,
        dtype: NcclDataType,
        native: NativeComm,
        _stream: Stream,
    ) -> BackendResult<()> {
        self.note_failure(self.check_fault(SimCall::AllGather))?;
        let comm = self.note_failure(self.active_comm(native))?;
        let data = read_device(send, send_count * dtype.size_in_bytes());
        let all = comm.group.exchange(comm.rank, data);
        self.note_failure(Self::check_uniform("all_gather", &all))?;
        write_device(recv, &all.concat());
        Ok(())
    }

    unsafe fn send(
        &self,
        send: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        native: NativeComm,
        _stream: Stream,
    ) -> BackendResult<()> {
        let op = self.note_failure(self.check_fault(SimCall::Send).and_then(|_| {
            let comm = self.active_comm(native)?;
            let peer = comm.peer(peer)?;
            Ok(PendingP2p::Send {
                comm,
                src: send,
                len: count * dtype.size_in_bytes(),
                peer,
            })
        }))?;
        match self.defer(op) {
            Some(op) => Self::issue(op),
            None => Ok(()),
        }
    }

    unsafe fn recv(
        &self,
        recv: DevicePtr,
        count: usize,
        dtype: NcclDataType,
        peer: i32,
        native: NativeComm,
        _stream: Stream,
    ) -> BackendResult<()> {
        let op = self.note_failure(self.check_fault(SimCall::Recv).and_then(|_| {
            let comm = self.active_comm(native)?;
            let peer = comm.peer(peer)?;
            Ok(PendingP2p::Recv {
                comm,
                dst: recv,
                len: count * dtype.size_in_bytes(),
                peer,
            })
        }))?;
        match self.defer(op) {
            Some(op) => Self::issue(op),
            None => Ok(()),
        }
    }

    fn group_start(&self) -> BackendResult<()> {
        self.check_fault(SimCall::GroupStart)?;
        lock(&self.brackets)
            .entry(thread::current().id())
            .or_default()
            .depth += 1;
        Ok(())
    }

    fn group_end(&self) -> BackendResult<()> {
        let bracket = {
            let mut brackets = lock(&self.brackets);
            let id = thread::current().id();
            let Some(bracket) = brackets.get_mut(&id).filter(|b| b.depth > 0) else {
                return Err(nccl_error(NcclResult::InvalidUsage, "group end without group start"));
            };
            bracket.depth -= 1;
            if bracket.depth > 0 {
                drop(brackets);
                return self.note_failure(self.check_fault(SimCall::GroupEnd));
            }
            brackets.remove(&id).unwrap_or_default()
        };
        if let Some(e) = bracket.failed {
            debug!(dropped = bracket.pending.len(), error = %e, "Aborting failed group");
            return Err(e);
        }
        self.check_fault(SimCall::GroupEnd)?;

        // Post every send before blocking on any receive so fused exchanges cannot deadlock.
        let (sends, recvs): (Vec<_>, Vec<_>) = bracket
            .pending
            .into_iter()
            .partition(|op| matches!(op, PendingP2p::Send { .. }));
        // A failing receive still consumes its message; the rest of the batch runs so no
        // matched message is left behind for a later receive.
        let mut first_error = None;
        for op in sends.into_iter().chain(recvs) {
            // SAFETY: the addresses were handed to `send`/`recv` under the trait contract,
            // which keeps them valid until the stream work completes.
            if let Err(e) = unsafe { Self::issue(op) } {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    unsafe fn memset_d8_async(
        &self,
        dst: DevicePtr,
        value: u8,
        len: usize,
        _stream: Stream,
    ) -> BackendResult<()> {
        self.note_failure(self.check_fault(SimCall::MemsetAsync))?;
        if len > 0 {
            std::ptr::write_bytes(dst.0 as *mut u8, value, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_all(backend: &Arc<SimulatedBackend>, size: i32) -> Vec<NativeComm> {
        let id = backend.get_unique_id().unwrap();
        let workers: Vec<_> = (0..size)
            .map(|rank| {
                let backend = backend.clone();
                thread::spawn(move || backend.comm_init_rank(size, &id, rank).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    }

    #[test]
    fn test_unique_ids_differ() {
        let backend = SimulatedBackend::new();
        let a = backend.get_unique_id().unwrap();
        let b = backend.get_unique_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_init_rank_rendezvous() {
        let backend = Arc::new(SimulatedBackend::new());
        let comms = join_all(&backend, 3);
        for (rank, comm) in comms.iter().enumerate() {
            assert_eq!(backend.comm_user_rank(*comm).unwrap(), rank as i32);
            assert_eq!(backend.comm_count(*comm).unwrap(), 3);
        }
        assert_eq!(backend.live_comms(), 3);
        for comm in comms {
            backend.comm_finalize(comm).unwrap();
            backend.comm_destroy(comm).unwrap();
        }
        assert_eq!(backend.live_comms(), 0);
    }

    #[test]
    fn test_init_rank_rejects_bad_rank() {
        let backend = SimulatedBackend::new();
        let id = backend.get_unique_id().unwrap();
        let err = backend.comm_init_rank(2, &id, 2).unwrap_err();
        assert_eq!(err.code, NcclResult::InvalidArgument as i32);
    }

    #[test]
    fn test_set_device_range() {
        let backend = SimulatedBackend::new().with_devices(2);
        assert!(backend.set_device(1).is_ok());
        let err = backend.set_device(2).unwrap_err();
        assert_eq!(err.library, "cuda");
        assert_eq!(err.code, CUDA_ERROR_INVALID_DEVICE);
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let backend = SimulatedBackend::new();
        backend.inject_fault(SimCall::GetUniqueId, NcclResult::SystemError);
        let err = backend.get_unique_id().unwrap_err();
        assert_eq!(err.code, NcclResult::SystemError as i32);
        assert!(backend.get_unique_id().is_ok());
    }

    #[test]
    fn test_reduce_bytes_all_ops_f32() {
        let inputs: Vec<Vec<u8>> = [2.0f32, 3.0, 5.0]
            .iter()
            .map(|v| v.to_ne_bytes().to_vec())
            .collect();
        let value = |op| f32::read(&reduce_bytes(&inputs, NcclDataType::Float32, op));
        assert_eq!(value(NcclRedOp::Sum), 10.0);
        assert_eq!(value(NcclRedOp::Prod), 30.0);
        assert_eq!(value(NcclRedOp::Min), 2.0);
        assert_eq!(value(NcclRedOp::Max), 5.0);
        assert!((value(NcclRedOp::Avg) - 10.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reduce_bytes_integers_and_halves() {
        let ints: Vec<Vec<u8>> = [7i32, -3, 4].iter().map(|v| v.to_ne_bytes().to_vec()).collect();
        assert_eq!(i32::read(&reduce_bytes(&ints, NcclDataType::Int32, NcclRedOp::Avg)), 2);
        assert_eq!(i32::read(&reduce_bytes(&ints, NcclDataType::Int32, NcclRedOp::Min)), -3);

        let bytes: Vec<Vec<u8>> = vec![vec![200u8], vec![100u8]];
        assert_eq!(reduce_bytes(&bytes, NcclDataType::Uint8, NcclRedOp::Sum), vec![44u8]);

        let halves: Vec<Vec<u8>> = [1.5f32, 2.5]
            .iter()
            .map(|v| bf16::from_f32(*v).to_bits().to_ne_bytes().to_vec())
            .collect();
        let sum = bf16::read(&reduce_bytes(&halves, NcclDataType::Bfloat16, NcclRedOp::Sum));
        assert_eq!(sum.to_f32(), 4.0);
    }

    #[test]
    fn test_group_end_without_start() {
        let backend = SimulatedBackend::new();
        let err = backend.group_end().unwrap_err();
        assert_eq!(err.code, NcclResult::InvalidUsage as i32);
    }

    #[test]
    fn test_mismatched_recv_in_group_drains_batch() {
        let backend = Arc::new(SimulatedBackend::new());
        let comm = join_all(&backend, 1)[0];
        let (first, second) = ([1u8; 4], [2u8; 4]);
        let mut wide = [0u8; 8];
        let mut narrow = [0u8; 4];

        backend.group_start().unwrap();
        unsafe {
            let int8 = NcclDataType::Int8;
            backend.send(DevicePtr(first.as_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
            backend.send(DevicePtr(second.as_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
            backend.recv(DevicePtr(wide.as_mut_ptr() as usize), 8, int8, 0, comm, Stream::DEFAULT).unwrap();
            backend.recv(DevicePtr(narrow.as_mut_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
        }
        let err = backend.group_end().unwrap_err();
        assert_eq!(err.code, NcclResult::InvalidUsage as i32);
        // The receive after the mismatch still ran.
        assert_eq!(narrow, [2u8; 4]);

        let fresh = [9u8; 4];
        let mut out = [0u8; 4];
        backend.group_start().unwrap();
        unsafe {
            let int8 = NcclDataType::Int8;
            backend.send(DevicePtr(fresh.as_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
            backend.recv(DevicePtr(out.as_mut_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
        }
        backend.group_end().unwrap();
        assert_eq!(out, [9u8; 4]);
    }

    #[test]
    fn test_failed_group_discards_queued_sends() {
        let backend = Arc::new(SimulatedBackend::new());
        let comm = join_all(&backend, 1)[0];
        let stale = [0x11u8; 4];
        let mut out = [0u8; 4];

        backend.inject_fault(SimCall::Recv, NcclResult::RemoteError);
        backend.group_start().unwrap();
        unsafe {
            let int8 = NcclDataType::Int8;
            backend.send(DevicePtr(stale.as_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
            assert!(backend.recv(DevicePtr(out.as_mut_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).is_err());
        }
        let err = backend.group_end().unwrap_err();
        assert_eq!(err.code, NcclResult::RemoteError as i32);

        // Nothing from the aborted group is left in the mailbox.
        assert!(lock(&backend.brackets).is_empty());
        let fresh = [0x22u8; 4];
        unsafe {
            let int8 = NcclDataType::Int8;
            backend.send(DevicePtr(fresh.as_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
            backend.recv(DevicePtr(out.as_mut_ptr() as usize), 4, int8, 0, comm, Stream::DEFAULT).unwrap();
        }
        assert_eq!(out, [0x22u8; 4]);
    }

    #[test]
    fn test_split_orders_by_key() {
        let backend = Arc::new(SimulatedBackend::new());
        let comms = join_all(&backend, 4);
        // Reverse order within each parity class.
        let workers: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let backend = backend.clone();
                thread::spawn(move || {
                    let child = backend
                        .comm_split(comm, (rank % 2) as i32, -(rank as i32))
                        .unwrap();
                    (
                        rank,
                        backend.comm_user_rank(child).unwrap(),
                        backend.comm_count(child).unwrap(),
                    )
                })
            })
            .collect();
        for w in workers {
            let (rank, child_rank, child_size) = w.join().unwrap();
            assert_eq!(child_size, 2);
            let expected = if rank < 2 { 1 } else { 0 };
            assert_eq!(child_rank, expected, "parent rank {}", rank);
        }
    }
}
