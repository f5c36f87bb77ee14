pub mod aggregator;
pub mod digest;
pub mod percentiles;
pub mod stream;
pub mod window;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aggregator::{DistBucket, EndpointSnapshot, MetricsAggregator, MetricsSnapshot, Summary};
pub use digest::PercentileEstimator;
pub use percentiles::PercentileSet;
pub use window::RollingWindow;

/// Identity of one logical route: HTTP method plus normalized path
/// template, e.g. `GET /api/items/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    pub method: String,
    pub path: String,
}

impl EndpointKey {
    pub fn new(method: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            path: path.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_normalizes_method() {
        let key = EndpointKey::new("get", "/api/items/:id");
        assert_eq!(key.method, "GET");
        assert_eq!(key.to_string(), "GET /api/items/:id");
        assert_eq!(key, EndpointKey::new("GET", "/api/items/:id"));
    }
}
