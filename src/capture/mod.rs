// Capture core — pipeline seams, frame delivery, and the session state machine.

pub mod driver;
pub mod session;
pub mod simulated;
pub mod sink;

#[cfg(target_os = "windows")]
pub mod graph;

pub use driver::{FaultSlot, NullBackend, PipelineBackend, PipelineHandle, SurfaceHandle};
pub use session::{CaptureSession, SessionState};
pub use simulated::{BuildStage, SimulatedBackend};
pub use sink::{Frame, FrameFormat, FrameSink, PixelFormat};
