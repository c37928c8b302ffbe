//! Video-capture sessions with a thread-safe snapshot path.
//!
//! The crate discovers capture devices, assembles a live pipeline against
//! the platform's multimedia framework (DirectShow on Windows), receives
//! raw RGB24 frames on the pipeline's own delivery thread, and exposes a
//! safe "take a snapshot" operation to callers on other threads. UI layers
//! sit on top of [`CaptureSession`] and poll its state; nothing is pushed.

pub mod capture;
pub mod catalog;
pub mod diagnostics;
pub mod error;
pub mod snapshot;

pub use capture::driver::{FaultSlot, NullBackend, PipelineBackend, PipelineHandle, SurfaceHandle};
pub use capture::session::{CaptureSession, SessionState};
pub use capture::simulated::{BuildStage, SimulatedBackend};
pub use capture::sink::{Frame, FrameFormat, FrameSink, PixelFormat};
pub use catalog::{
    DeviceCatalog, DeviceDescriptor, DeviceEnumerator, DeviceId, SimulatedEnumerator,
};
pub use diagnostics::{DeliverySnapshot, DeliveryStats};
pub use error::{CaptureError, Result};
pub use snapshot::{encode_to_file, save_to_dir, snapshot_filename, SnapshotImage};

#[cfg(target_os = "windows")]
pub use capture::graph::DirectShowBackend;
