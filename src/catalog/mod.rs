// Device catalog — discovery of capture-class devices.

pub mod enumerator;
pub mod platform;
pub mod simulated;
pub mod types;

pub use enumerator::{DeviceCatalog, DeviceEnumerator, NullEnumerator};
pub use simulated::SimulatedEnumerator;
pub use types::{DeviceDescriptor, DeviceId};
