use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Correlation id joining a request's synchronous response with its later
/// caption and detection deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Draws a fresh random 128-bit id.
pub fn new_id() -> RequestId {
    RequestId::new()
}
