//! Persisted replacement-strategy bookkeeping
//!
//! Every stack keeps one meta data blob under a reserved key in its meta
//! data storage. The blob is tagged with the strategy kind that produced
//! it; a stack configured with a different strategy refuses to interpret
//! the blob and demands a reset first. Inside the blob, bookkeeping is
//! sectioned per tier and keyed by tier name, so tiers sharing one backend
//! never clobber each other's sections.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strategy::{LfuMetaData, LruMetaData, StrategyKind};

/// Strategy-private bookkeeping persisted under the reserved meta data key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StackMetaData {
    /// Recency bookkeeping for the least-recently-used strategy
    Lru(LruMetaData),
    /// Frequency bookkeeping for the least-frequently-used strategy
    Lfu(LfuMetaData),
}

impl StackMetaData {
    /// Strategy variant that produced this blob.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Lru(_) => StrategyKind::Lru,
            Self::Lfu(_) => StrategyKind::Lfu,
        }
    }

    /// Encode for persistence under the reserved key.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::MetaDataEncoding(e.to_string()))
    }

    /// Decode a persisted blob.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::MetaDataEncoding(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
