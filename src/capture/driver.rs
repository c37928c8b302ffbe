use parking_lot::Mutex;
use std::sync::Arc;

use crate::capture::sink::{FrameFormat, FrameSink};
use crate::catalog::types::DeviceDescriptor;
use crate::error::{CaptureError, Result};

/// Shared fault slot for asynchronous pipeline failures.
///
/// The delivery side raises at most one fault; the session watchdog polls
/// the slot and drives the state machine to `Faulted` when it fires.
#[derive(Clone, Default)]
pub struct FaultSlot(Arc<Mutex<Option<String>>>);

impl FaultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. The first raised fault wins; later ones are ignored.
    pub fn raise(&self, message: impl Into<String>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    pub fn is_raised(&self) -> bool {
        self.0.lock().is_some()
    }
}

/// Opaque platform window reference.
///
/// Handed to `start` by the UI collaborator and passed through to the
/// pipeline builder unexamined; backends that render nowhere ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceHandle(pub isize);

impl SurfaceHandle {
    /// A handle for callers with no display surface.
    pub fn null() -> Self {
        Self(0)
    }
}

/// Builds capture pipelines against a platform multimedia framework.
///
/// DirectShow on Windows, a frame generator in the simulated backend.
pub trait PipelineBackend: Send + Sync {
    /// Assemble a fully wired, not-yet-running pipeline for `device`,
    /// delivering raw frames into `sink`.
    ///
    /// Each assembly stage reports its own error kind (`GraphCreation`,
    /// `SinkInsert`, `MediaNegotiation`, `DeviceBind`, `Connection`) so the
    /// failing stage is never ambiguous. Building does not start delivery.
    fn build(
        &self,
        device: &DeviceDescriptor,
        surface: SurfaceHandle,
        sink: Arc<FrameSink>,
    ) -> Result<Box<dyn PipelineHandle>>;
}

/// An owned, non-shareable handle to an assembled pipeline.
///
/// Dropping the handle releases the underlying graph exactly once, sink
/// node before graph. Handles are released only after `halt`.
pub trait PipelineHandle: Send {
    /// Begin frame delivery on the pipeline's own thread.
    fn run(&mut self) -> Result<()>;

    /// Halt delivery synchronously.
    ///
    /// Errors are reported but never abort teardown: after `halt` returns,
    /// dropping the handle must still release every native resource.
    fn halt(&mut self) -> Result<()>;

    /// The format negotiated with the source.
    fn format(&self) -> FrameFormat;

    /// Clone of the fault slot the delivery side raises into.
    fn fault_slot(&self) -> FaultSlot;
}

/// Backend for platforms without a native capture pipeline.
pub struct NullBackend;

impl PipelineBackend for NullBackend {
    fn build(
        &self,
        device: &DeviceDescriptor,
        _surface: SurfaceHandle,
        _sink: Arc<FrameSink>,
    ) -> Result<Box<dyn PipelineHandle>> {
        Err(CaptureError::DeviceBind(format!(
            "no native capture backend on this platform (device {})",
            device.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::DeviceId;

    #[test]
    fn surface_handle_null_is_zero() {
        assert_eq!(SurfaceHandle::null(), SurfaceHandle(0));
    }

    #[test]
    fn null_backend_reports_device_bind_failure() {
        let device = DeviceDescriptor {
            id: DeviceId::new("dev"),
            name: "Cam".to_string(),
        };
        let result = NullBackend.build(&device, SurfaceHandle::null(), Arc::new(FrameSink::new()));
        assert!(matches!(result, Err(CaptureError::DeviceBind(_))));
    }

    #[test]
    fn backend_trait_object_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Box<dyn PipelineBackend>>();
    }

    #[test]
    fn fault_slot_keeps_the_first_fault() {
        let slot = FaultSlot::new();
        assert!(!slot.is_raised());

        slot.raise("first");
        slot.raise("second");
        assert_eq!(slot.get().as_deref(), Some("first"));
    }

    #[test]
    fn fault_slot_clones_share_state() {
        let slot = FaultSlot::new();
        let observer = slot.clone();
        slot.raise("graph stalled");
        assert!(observer.is_raised());
    }
}
