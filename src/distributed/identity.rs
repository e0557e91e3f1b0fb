//! Group identity generation and storage.
//!
//! Rank 0 asks the library for a fresh identity; the embedding layer ships the bytes to
//! every other participant out of band before anyone joins.

use super::backend::CollectiveBackend;
use super::nccl_sys::{NcclUniqueId, NCCL_UNIQUE_ID_BYTES};
use crate::utils::error::{CommError, Result};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Lowercase hex rendering of `bytes`.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The fixed-length opaque token participants use to join the same group.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupIdentity(NcclUniqueId);

impl GroupIdentity {
    pub const LEN: usize = NCCL_UNIQUE_ID_BYTES;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(CommError::InvalidArgument(format!(
                "group identity must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut id = NcclUniqueId::default();
        id.internal.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.len() % 2 != 0 || !text.is_ascii() {
            return Err(CommError::InvalidArgument("group identity is not hex".into()));
        }
        let bytes = (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|e| CommError::InvalidArgument(format!("group identity is not hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex_string(&self.0.internal)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0.internal
    }

    pub fn as_unique_id(&self) -> &NcclUniqueId {
        &self.0
    }
}

impl From<NcclUniqueId> for GroupIdentity {
    fn from(id: NcclUniqueId) -> Self {
        Self(id)
    }
}

impl fmt::Debug for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupIdentity({}..)", hex_string(&self.0.internal[..8]))
    }
}

/// Generates group identities and keeps the most recent one for retrieval.
pub struct IdentityExchange {
    backend: Option<Arc<dyn CollectiveBackend>>,
    current: RwLock<Option<GroupIdentity>>,
}

impl IdentityExchange {
    /// `backend` is `None` when collective support is compiled out.
    pub fn new(backend: Option<Arc<dyn CollectiveBackend>>) -> Self {
        Self {
            backend,
            current: RwLock::new(None),
        }
    }

    /// Ask the library for a fresh identity and remember it.
    ///
    /// Without a backend this is the empty placeholder: `Ok(None)`.
    pub fn generate(&self) -> Result<Option<GroupIdentity>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let id = backend.get_unique_id().map_err(CommError::Init)?;
        let identity = GroupIdentity::from(id);
        debug!(identity = %identity.to_hex(), "Generated group identity");
        self.store(identity);
        Ok(Some(identity))
    }

    /// Generate an identity as raw bytes; empty when collectives are unavailable.
    pub fn generate_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .generate()?
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default())
    }

    /// Remember an identity received from another participant.
    pub fn store(&self, identity: GroupIdentity) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(identity);
    }

    pub fn current(&self) -> Option<GroupIdentity> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}
