// Per-platform device enumeration.

#[cfg(target_os = "windows")]
pub mod windows;

use crate::catalog::enumerator::DeviceEnumerator;

/// Enumerator for the current platform.
///
/// DirectShow on Windows; a null enumerator (no devices) elsewhere.
pub fn native_enumerator() -> Box<dyn DeviceEnumerator> {
    #[cfg(target_os = "windows")]
    {
        Box::new(windows::DirectShowEnumerator::new())
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(crate::catalog::enumerator::NullEnumerator)
    }
}
