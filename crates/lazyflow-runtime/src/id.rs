//! Identifier types.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::{Debug, Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an operator, preserved across snapshots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Debug, Display, From, Into)]
#[debug("{_0}")]
#[display("{_0}")]
#[serde(transparent)]
pub struct OperatorId(Uuid);

impl OperatorId {
    /// Creates a new time-ordered operator ID.
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an operator ID from an existing UUID.
    #[inline]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[inline]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for OperatorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Process-unique identifier of a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Debug, Display)]
#[debug("#{_0}")]
#[display("#{_0}")]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of a cache registered with the memory manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Debug, Display)]
#[debug("cache#{_0}")]
#[display("cache#{_0}")]
pub struct CacheId(pub(crate) u64);

/// Identifier of a registered dirty callback.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Debug, Display)]
#[debug("callback#{_0}")]
#[display("callback#{_0}")]
pub struct DirtyCallbackId(pub(crate) u64);
