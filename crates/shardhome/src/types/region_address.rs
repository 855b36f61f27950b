use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of a cluster node hosting shard regions (host:port).
///
/// Ordering is lexicographic on host then port; allocation uses it as the
/// stable tie-breaker between equally loaded regions.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RegionAddress {
    pub host: String,
    pub port: u16,
}

impl RegionAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RegionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
