//! Shared identifiers for the SoulBridge remote action bridge.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use uuid::Uuid;

const TENANT_ID_MAX_LEN: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantIdError {
    #[error("tenant id is empty")]
    Empty,
    #[error("tenant id exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("tenant id contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Externally issued identifier of one end-user browser session.
///
/// Tenant ids are opaque: they are validated but never rewritten, so two
/// distinct ids can never collapse onto the same connection slot.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(try_from = "String", into = "String"))]
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TenantIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if raw.len() > TENANT_ID_MAX_LEN {
            return Err(TenantIdError::TooLong {
                max: TENANT_ID_MAX_LEN,
            });
        }
        if let Some(ch) = raw
            .chars()
            .find(|ch| ch.is_whitespace() || ch.is_control() || *ch == '/')
        {
            return Err(TenantIdError::ForbiddenChar(ch));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation key of one in-flight command. Generated by the bridge, never reused.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(transparent))]
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Connection generation. Drawn from one process-wide counter, so it is also
/// strictly increasing for every individual tenant.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-full", serde(transparent))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next() -> Self {
        Self(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
