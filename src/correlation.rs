use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier linking a request to its reply.
///
/// Generated per call and carried as transport metadata on both the request
/// and the reply. Compared as an opaque string; no ordering or structure is
/// implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new identifier (UUID v4, hyphenated).
    pub fn generate() -> Self {
        // ---
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared string form, as stored in message metadata.
    pub fn to_shared(&self) -> Arc<str> {
        self.0.clone()
    }

    /// `true` if `candidate` carries exactly this identifier.
    pub fn matches(&self, candidate: Option<&str>) -> bool {
        candidate == Some(self.as_str())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
