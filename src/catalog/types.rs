use serde::Serialize;
use std::fmt;

/// Stable capture-device identifier.
///
/// On Windows this is the DirectShow moniker device path — the value the
/// pipeline builder binds by. Virtual devices without a device path get a
/// `name:`-prefixed fallback derived from their friendly name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a `DeviceId` from a raw identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identifier for a device that exposes no device path.
    pub fn from_name(name: &str) -> Self {
        Self(format!("name:{name}"))
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discovered capture device.
///
/// An immutable snapshot taken at enumeration time. The set goes stale when
/// devices are added or removed — callers re-enumerate rather than caching
/// descriptors indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
}
