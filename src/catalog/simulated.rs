use crate::catalog::enumerator::DeviceEnumerator;
use crate::catalog::types::{DeviceDescriptor, DeviceId};
use crate::error::{CaptureError, Result};

/// Simulated enumerator for testing and development without hardware.
///
/// Returns a fixed device list in construction order; can be configured to
/// fail the category query itself to exercise `Enumeration` error paths.
pub struct SimulatedEnumerator {
    devices: Vec<DeviceDescriptor>,
    fail: bool,
}

impl SimulatedEnumerator {
    /// One simulated device named "Simulated Capture Device".
    pub fn single() -> Self {
        Self::with_names(&["Simulated Capture Device"])
    }

    /// Simulated devices with the given friendly names.
    pub fn with_names(names: &[&str]) -> Self {
        let devices = names
            .iter()
            .enumerate()
            .map(|(i, name)| DeviceDescriptor {
                id: DeviceId::new(format!("sim:{i:04}")),
                name: (*name).to_string(),
            })
            .collect();
        Self {
            devices,
            fail: false,
        }
    }

    /// No devices present.
    pub fn empty() -> Self {
        Self::with_names(&[])
    }

    /// An enumerator whose category query fails outright.
    pub fn failing() -> Self {
        Self {
            devices: vec![],
            fail: true,
        }
    }
}

impl DeviceEnumerator for SimulatedEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.fail {
            return Err(CaptureError::Enumeration(
                "simulated capture subsystem unavailable".into(),
            ));
        }
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_yields_one_device() {
        let devices = SimulatedEnumerator::single().enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Simulated Capture Device");
    }

    #[test]
    fn ids_are_stable_across_enumerations() {
        let enumerator = SimulatedEnumerator::with_names(&["A", "B"]);
        let first = enumerator.enumerate().unwrap();
        let second = enumerator.enumerate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn failing_reports_enumeration_error() {
        assert!(matches!(
            SimulatedEnumerator::failing().enumerate(),
            Err(CaptureError::Enumeration(_))
        ));
    }
}
