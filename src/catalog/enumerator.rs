use tracing::debug;

use crate::catalog::types::DeviceDescriptor;
use crate::error::Result;

/// Platform device enumeration seam.
///
/// Implemented by the DirectShow enumerator on Windows and by simulated /
/// null enumerators elsewhere, so the catalog is unit-testable without COM.
pub trait DeviceEnumerator: Send + Sync {
    /// Query the platform for capture-class devices.
    ///
    /// Returns an empty list (not an error) when no devices are present;
    /// fails with `CaptureError::Enumeration` when the device-category query
    /// itself fails. The platform's enumeration order is preserved.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Enumerator for platforms without a native capture backend.
pub struct NullEnumerator;

impl DeviceEnumerator for NullEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![])
    }
}

/// Snapshot of the devices seen at the most recent enumeration.
///
/// Indices handed to `CaptureSession::start` refer to positions in this
/// snapshot, so the order returned by the enumerator is kept as-is.
pub struct DeviceCatalog {
    enumerator: Box<dyn DeviceEnumerator>,
    devices: Vec<DeviceDescriptor>,
}

impl DeviceCatalog {
    /// Create a catalog backed by the platform's native enumerator.
    pub fn new() -> Self {
        Self::with_enumerator(crate::catalog::platform::native_enumerator())
    }

    /// Create a catalog with a custom enumerator (for testing).
    pub fn with_enumerator(enumerator: Box<dyn DeviceEnumerator>) -> Self {
        Self {
            enumerator,
            devices: Vec::new(),
        }
    }

    /// Re-query the platform and replace the cached snapshot.
    pub fn refresh(&mut self) -> Result<&[DeviceDescriptor]> {
        let devices = self.enumerator.enumerate()?;
        debug!("catalog refreshed: {} device(s)", devices.len());
        self.devices = devices;
        Ok(&self.devices)
    }

    /// Devices from the last refresh, in platform order.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Look up a device by its position in the last refreshed snapshot.
    pub fn get(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::DeviceId;
    use crate::error::CaptureError;

    struct FixedEnumerator {
        names: Vec<&'static str>,
    }

    impl DeviceEnumerator for FixedEnumerator {
        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(self
                .names
                .iter()
                .map(|n| DeviceDescriptor {
                    id: DeviceId::from_name(n),
                    name: (*n).to_string(),
                })
                .collect())
        }
    }

    struct FailingEnumerator;

    impl DeviceEnumerator for FailingEnumerator {
        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Err(CaptureError::Enumeration("subsystem unavailable".into()))
        }
    }

    #[test]
    fn catalog_starts_empty_before_refresh() {
        let catalog = DeviceCatalog::with_enumerator(Box::new(FixedEnumerator {
            names: vec!["Cam A"],
        }));
        assert!(catalog.is_empty());
        assert!(catalog.get(0).is_none());
    }

    #[test]
    fn refresh_preserves_platform_order() {
        let mut catalog = DeviceCatalog::with_enumerator(Box::new(FixedEnumerator {
            names: vec!["Cam B", "Cam A", "Cam C"],
        }));
        let devices = catalog.refresh().unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Cam B", "Cam A", "Cam C"]);
    }

    #[test]
    fn refresh_with_no_devices_is_ok_and_empty() {
        let mut catalog =
            DeviceCatalog::with_enumerator(Box::new(FixedEnumerator { names: vec![] }));
        assert!(catalog.refresh().unwrap().is_empty());
    }

    #[test]
    fn refresh_surfaces_enumeration_failure() {
        let mut catalog = DeviceCatalog::with_enumerator(Box::new(FailingEnumerator));
        assert!(matches!(
            catalog.refresh(),
            Err(CaptureError::Enumeration(_))
        ));
    }

    #[test]
    fn null_enumerator_returns_empty() {
        assert!(NullEnumerator.enumerate().unwrap().is_empty());
    }

    #[test]
    fn get_indexes_into_last_snapshot() {
        let mut catalog = DeviceCatalog::with_enumerator(Box::new(FixedEnumerator {
            names: vec!["Cam A", "Cam B"],
        }));
        catalog.refresh().unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(1).unwrap().name, "Cam B");
        assert!(catalog.get(2).is_none());
    }
}
