//! Flat, name-indexed entry points for an embedding scripting layer.
//!
//! The host calls functions by name with integer or byte-string arguments. Buffer
//! addresses, stream handles and communicator handles all cross the boundary as integers.
//! A failure is returned as `Err`, which the host surfaces through its own error channel.

use super::backend::CollectiveBackend;
use super::communicator::CommunicatorFactory;
use super::dispatch::{Collectives, ElementType, ReduceOp};
use super::identity::{GroupIdentity, IdentityExchange};
use super::nccl_sys::{DevicePtr, Stream};
use super::tracker::{Handle, ResourceTracker, NULL_HANDLE};
use crate::utils::error::{CommError, Result};
use crate::utils::metrics::CollectiveMetrics;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Function the host calls to obtain the group identity for a rank.
pub const IDENTITY_PROVIDER: &str = "_get_nccl_unique_id";

/// A value crossing the host boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    Int(i64),
    Bytes(Vec<u8>),
    Nil,
}

impl HostValue {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            HostValue::Int(v) => Ok(*v),
            other => Err(CommError::InvalidArgument(format!("expected an integer, got {:?}", other))),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            HostValue::Bytes(b) => Ok(b),
            other => Err(CommError::InvalidArgument(format!("expected bytes, got {:?}", other))),
        }
    }
}

impl From<Handle> for HostValue {
    fn from(handle: Handle) -> Self {
        HostValue::Int(handle as i64)
    }
}

pub type EntryPoint = Arc<dyn Fn(&[HostValue]) -> Result<HostValue> + Send + Sync>;

type FunctionTable = Arc<RwLock<HashMap<String, EntryPoint>>>;

fn lookup(functions: &FunctionTable, name: &str) -> Option<EntryPoint> {
    functions
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

fn expect_arity(name: &str, args: &[HostValue], arity: usize) -> Result<()> {
    if args.len() != arity {
        return Err(CommError::InvalidArgument(format!(
            "{} takes {} arguments, got {}",
            name,
            arity,
            args.len()
        )));
    }
    Ok(())
}

fn i32_arg(args: &[HostValue], index: usize) -> Result<i32> {
    let value = args[index].as_int()?;
    i32::try_from(value)
        .map_err(|_| CommError::InvalidArgument(format!("argument {} out of range: {}", index, value)))
}

fn usize_arg(args: &[HostValue], index: usize) -> Result<usize> {
    let value = args[index].as_int()?;
    usize::try_from(value)
        .map_err(|_| CommError::InvalidArgument(format!("argument {} out of range: {}", index, value)))
}

/// Addresses keep their bit pattern; the host has no unsigned integers.
fn address_arg(args: &[HostValue], index: usize) -> Result<usize> {
    Ok(args[index].as_int()? as u64 as usize)
}

/// The collective module as seen by the host.
pub struct NcclModule {
    backend: Option<Arc<dyn CollectiveBackend>>,
    factory: Option<Arc<CommunicatorFactory>>,
    identity: IdentityExchange,
    metrics: Option<Arc<CollectiveMetrics>>,
    functions: FunctionTable,
}

impl NcclModule {
    /// `backend` is `None` when collective support is unavailable; the management and
    /// collective entry points are then never registered.
    pub fn new(
        backend: Option<Arc<dyn CollectiveBackend>>,
        tracker: Arc<ResourceTracker>,
        metrics: Option<Arc<CollectiveMetrics>>,
    ) -> Self {
        let factory = backend.clone().map(|backend| {
            let factory = CommunicatorFactory::new(backend, tracker);
            Arc::new(match &metrics {
                Some(metrics) => factory.with_metrics(metrics.clone()),
                None => factory,
            })
        });
        Self {
            identity: IdentityExchange::new(backend.clone()),
            backend,
            factory,
            metrics,
            functions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Add or replace the entry point `name`.
    pub fn register(&self, name: impl Into<String>, entry: EntryPoint) {
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        lookup(&self.functions, name).is_some()
    }

    /// Registered entry-point names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Invoke the entry point `name`.
    pub fn call(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let entry = lookup(&self.functions, name)
            .ok_or_else(|| CommError::InvalidArgument(format!("no entry point named {}", name)))?;
        entry(args)
    }

    /// Generate a fresh group identity for the host to distribute. Empty when collective
    /// support is unavailable.
    pub fn get_communicator_unique_id(&self) -> Result<Vec<u8>> {
        self.identity.generate_bytes()
    }

    pub fn identity(&self) -> &IdentityExchange {
        &self.identity
    }

    /// Destroy the communicator behind `handle`.
    pub fn release(&self, handle: Handle) -> Result<()> {
        match &self.factory {
            Some(factory) => factory.release(handle),
            None => Err(CommError::NotFound(handle)),
        }
    }

    /// Expose the launch topology, and the precomputed group identity if one was supplied.
    ///
    /// An empty `unique_id` registers no identity accessor.
    pub fn register_device_dependent_methods(
        &self,
        num_ranks: i32,
        rank: i32,
        unique_id: &[u8],
    ) -> Result<()> {
        self.register(
            "__spmd_global_num_ranks",
            Arc::new(move |_: &[HostValue]| -> Result<HostValue> { Ok(HostValue::Int(num_ranks as i64)) }),
        );
        self.register(
            "__spmd_global_rank",
            Arc::new(move |_: &[HostValue]| -> Result<HostValue> { Ok(HostValue::Int(rank as i64)) }),
        );

        if self.backend.is_some() && !unique_id.is_empty() {
            let identity = GroupIdentity::from_bytes(unique_id)?;
            self.identity.store(identity);
            self.register(
                IDENTITY_PROVIDER,
                Arc::new(move |_: &[HostValue]| -> Result<HostValue> {
                    Ok(HostValue::Bytes(identity.as_bytes().to_vec()))
                }),
            );
        }
        debug!(num_ranks, rank, "Registered device-dependent methods");
        Ok(())
    }

    /// Register the communicator management entry points and the full collective
    /// catalogue. Returns how many entry points were registered.
    pub fn register_collective_ops(&self) -> usize {
        let Some(factory) = self.factory.clone() else {
            return 0;
        };
        let before = self.functions.read().unwrap_or_else(|e| e.into_inner()).len();

        self.register_management_ops(&factory);

        for op in ReduceOp::ALL {
            for dtype in ElementType::ALL {
                let suffix = format!("{}_{}", op.suffix(), dtype.suffix());
                // SAFETY: the host passes device addresses sized for the call.
                self.register_collective(
                    format!("__nccl_all_reduce_{}", suffix),
                    "all_reduce",
                    5,
                    &factory,
                    move |c, args| unsafe {
                        c.all_reduce(
                            op,
                            dtype,
                            DevicePtr(address_arg(args, 0)?),
                            DevicePtr(address_arg(args, 1)?),
                            usize_arg(args, 2)?,
                        )
                    },
                );
                // SAFETY: as above.
                self.register_collective(
                    format!("__nccl_reduce_scatter_{}", suffix),
                    "reduce_scatter",
                    5,
                    &factory,
                    move |c, args| unsafe {
                        c.reduce_scatter(
                            op,
                            dtype,
                            DevicePtr(address_arg(args, 0)?),
                            DevicePtr(address_arg(args, 1)?),
                            usize_arg(args, 2)?,
                        )
                    },
                );
            }
        }

        // SAFETY: the host passes device addresses sized for the call.
        self.register_collective("__nccl_all_gather".into(), "all_gather", 5, &factory, |c, args| unsafe {
            c.all_gather(
                DevicePtr(address_arg(args, 0)?),
                DevicePtr(address_arg(args, 1)?),
                usize_arg(args, 2)?,
            )
        });
        // SAFETY: as above; `num_bytes` divisible by the group size is the host's contract.
        self.register_collective("__nccl_all_to_all".into(), "all_to_all", 5, &factory, |c, args| unsafe {
            c.all_to_all(
                DevicePtr(address_arg(args, 0)?),
                DevicePtr(address_arg(args, 1)?),
                usize_arg(args, 2)?,
            )
        });
        // SAFETY: as above.
        self.register_collective("__nccl_permute".into(), "permute", 7, &factory, |c, args| unsafe {
            c.permute(
                DevicePtr(address_arg(args, 0)?),
                DevicePtr(address_arg(args, 1)?),
                i32_arg(args, 2)?,
                i32_arg(args, 3)?,
                usize_arg(args, 4)?,
            )
        });

        let registered = self.functions.read().unwrap_or_else(|e| e.into_inner()).len() - before;
        info!(
            backend = factory.backend().name(),
            entry_points = registered,
            "Registered collective entry points"
        );
        registered
    }

    fn register_management_ops(&self, factory: &Arc<CommunicatorFactory>) {
        // Weak, since this entry point is itself stored in the table.
        let functions = Arc::downgrade(&self.functions);
        let metrics = self.metrics.clone();
        let f = factory.clone();
        self.register(
            "__nccl_comm_init_rank",
            Arc::new(move |args: &[HostValue]| -> Result<HostValue> {
                let result = (|| -> Result<HostValue> {
                    expect_arity("__nccl_comm_init_rank", args, 3)?;
                    let (rank, size, device) = (i32_arg(args, 0)?, i32_arg(args, 1)?, i32_arg(args, 2)?);
                    let provider = functions
                        .upgrade()
                        .and_then(|table| lookup(&table, IDENTITY_PROVIDER))
                        .ok_or_else(|| {
                            CommError::InvalidArgument("no group identity provider registered".into())
                        })?;
                    let bytes = provider(&[HostValue::Int(rank as i64)])?.into_bytes()?;
                    let identity = GroupIdentity::from_bytes(&bytes)?;
                    f.join(&identity, rank, size, device).map(HostValue::from)
                })();
                record(&metrics, "comm_init_rank", &result);
                result
            }),
        );

        let metrics = self.metrics.clone();
        let f = factory.clone();
        self.register(
            "__nccl_comm_split",
            Arc::new(move |args: &[HostValue]| -> Result<HostValue> {
                let result = (|| -> Result<HostValue> {
                    expect_arity("__nccl_comm_split", args, 3)?;
                    let child = f.split(usize_arg(args, 0)?, i32_arg(args, 1)?, i32_arg(args, 2)?)?;
                    Ok(HostValue::from(child.unwrap_or(NULL_HANDLE)))
                })();
                record(&metrics, "comm_split", &result);
                result
            }),
        );

        let f = factory.clone();
        self.register(
            "__nccl_comm_rank",
            Arc::new(move |args: &[HostValue]| -> Result<HostValue> {
                expect_arity("__nccl_comm_rank", args, 1)?;
                Ok(HostValue::Int(f.rank(usize_arg(args, 0)?)? as i64))
            }),
        );

        let f = factory.clone();
        self.register(
            "__nccl_comm_num_ranks",
            Arc::new(move |args: &[HostValue]| -> Result<HostValue> {
                expect_arity("__nccl_comm_num_ranks", args, 1)?;
                Ok(HostValue::Int(f.size(usize_arg(args, 0)?)? as i64))
            }),
        );
    }

    /// Register a collective taking `(..., comm, stream)` as its last two arguments.
    fn register_collective<F>(
        &self,
        name: String,
        op: &'static str,
        arity: usize,
        factory: &Arc<CommunicatorFactory>,
        body: F,
    ) where
        F: Fn(&Collectives<'_>, &[HostValue]) -> Result<()> + Send + Sync + 'static,
    {
        let factory = factory.clone();
        let metrics = self.metrics.clone();
        let entry_name = name.clone();
        self.register(
            name,
            Arc::new(move |args: &[HostValue]| -> Result<HostValue> {
                let result = (|| -> Result<HostValue> {
                    expect_arity(&entry_name, args, arity)?;
                    let comm = factory.communicator(usize_arg(args, arity - 2)?)?;
                    let stream = Stream(address_arg(args, arity - 1)?);
                    let collectives = Collectives::new(factory.backend().as_ref(), &comm, stream);
                    body(&collectives, args).map(|()| HostValue::Nil)
                })();
                record(&metrics, op, &result);
                result
            }),
        );
    }
}

fn record<T>(metrics: &Option<Arc<CollectiveMetrics>>, op: &str, result: &Result<T>) {
    if let Some(metrics) = metrics {
        metrics.record_call(op, result.is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::sim_backend::SimulatedBackend;

    fn module() -> NcclModule {
        let backend: Arc<dyn CollectiveBackend> = Arc::new(SimulatedBackend::new());
        NcclModule::new(Some(backend), Arc::new(ResourceTracker::new()), None)
    }

    #[test]
    fn test_catalogue_is_complete() {
        let module = module();
        // 50 all_reduce + 50 reduce_scatter + 3 data movement + 4 management.
        assert_eq!(module.register_collective_ops(), 107);
        assert!(module.contains("__nccl_all_reduce_sum_i8"));
        assert!(module.contains("__nccl_all_reduce_avg_bf16"));
        assert!(module.contains("__nccl_reduce_scatter_min_ui64"));
        assert!(module.contains("__nccl_permute"));
        assert!(!module.contains("__nccl_all_reduce_sum_f8"));
    }

    #[test]
    fn test_unavailable_backend_registers_nothing() {
        let module = NcclModule::new(None, Arc::new(ResourceTracker::new()), None);
        assert!(!module.is_available());
        assert_eq!(module.register_collective_ops(), 0);
        assert!(module.get_communicator_unique_id().unwrap().is_empty());

        // Topology constants are still exposed; the identity accessor is not.
        module
            .register_device_dependent_methods(4, 2, &[0u8; 128])
            .unwrap();
        assert_eq!(module.call("__spmd_global_num_ranks", &[]).unwrap(), HostValue::Int(4));
        assert_eq!(module.call("__spmd_global_rank", &[]).unwrap(), HostValue::Int(2));
        assert!(!module.contains(IDENTITY_PROVIDER));
    }

    #[test]
    fn test_device_dependent_identity_accessor() {
        let module = module();
        let id = module.get_communicator_unique_id().unwrap();
        assert_eq!(id.len(), GroupIdentity::LEN);

        module.register_device_dependent_methods(1, 0, &id).unwrap();
        let returned = module.call(IDENTITY_PROVIDER, &[HostValue::Int(0)]).unwrap();
        assert_eq!(returned, HostValue::Bytes(id));

        let err = module.register_device_dependent_methods(1, 0, &[1u8; 16]).unwrap_err();
        assert!(matches!(err, CommError::InvalidArgument(_)));
    }

    #[test]
    fn test_single_rank_round_trip() {
        let module = module();
        module.register_collective_ops();
        let id = module.get_communicator_unique_id().unwrap();
        module.register_device_dependent_methods(1, 0, &id).unwrap();

        let handle = module
            .call("__nccl_comm_init_rank", &[HostValue::Int(0), HostValue::Int(1), HostValue::Int(0)])
            .unwrap();
        assert_eq!(module.call("__nccl_comm_rank", &[handle.clone()]).unwrap(), HostValue::Int(0));
        assert_eq!(module.call("__nccl_comm_num_ranks", &[handle.clone()]).unwrap(), HostValue::Int(1));

        let send = [3i32, 4];
        let mut recv = [0i32; 2];
        let args = [
            HostValue::Int(send.as_ptr() as i64),
            HostValue::Int(recv.as_mut_ptr() as i64),
            HostValue::Int(2),
            handle.clone(),
            HostValue::Int(0),
        ];
        assert_eq!(module.call("__nccl_all_reduce_prod_i32", &args).unwrap(), HostValue::Nil);
        assert_eq!(recv, [3, 4]);

        let HostValue::Int(raw) = &handle else { unreachable!() };
        module.release(*raw as Handle).unwrap();
        assert!(module.call("__nccl_comm_rank", &[handle]).is_err());
    }

    #[test]
    fn test_init_without_identity_provider_fails() {
        let module = module();
        module.register_collective_ops();
        let err = module
            .call("__nccl_comm_init_rank", &[HostValue::Int(0), HostValue::Int(1), HostValue::Int(0)])
            .unwrap_err();
        assert!(matches!(err, CommError::InvalidArgument(_)));
    }

    #[test]
    fn test_argument_validation() {
        let module = module();
        module.register_collective_ops();
        assert!(module.call("__nccl_all_gather", &[HostValue::Int(0)]).is_err());
        assert!(module.call("__nccl_comm_rank", &[HostValue::Bytes(vec![])]).is_err());
        assert!(module.call("__nccl_comm_rank", &[HostValue::Int(-5)]).is_err());
        assert!(module.call("__nccl_missing", &[]).is_err());
    }

    #[test]
    fn test_metrics_count_calls_and_failures() {
        let backend: Arc<dyn CollectiveBackend> = Arc::new(SimulatedBackend::new());
        let metrics = Arc::new(CollectiveMetrics::new().unwrap());
        let module = NcclModule::new(Some(backend), Arc::new(ResourceTracker::new()), Some(metrics.clone()));
        module.register_collective_ops();

        // Unknown communicator handle.
        let args = vec![HostValue::Int(0); 5];
        assert!(module.call("__nccl_all_gather", &args).is_err());

        let calls = metrics.collective_calls.with_label_values(&["all_gather"]).get();
        let failures = metrics.collective_failures.with_label_values(&["all_gather"]).get();
        assert_eq!((calls, failures), (1, 1));
    }
}
