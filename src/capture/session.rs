use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::capture::driver::{FaultSlot, PipelineBackend, PipelineHandle, SurfaceHandle};
use crate::capture::sink::{FrameFormat, FrameSink};
use crate::catalog::enumerator::DeviceCatalog;
use crate::catalog::types::DeviceDescriptor;
use crate::diagnostics::stats::DeliverySnapshot;
use crate::error::{CaptureError, Result};
use crate::snapshot::image::SnapshotImage;

/// Lifecycle of a capture session.
///
/// `Idle → Starting → Running → Stopping → Idle`, with `Faulted` reachable
/// from `Running` when the pipeline fails asynchronously. From `Faulted`
/// only `stop` is valid; it performs best-effort release back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Faulted,
}

/// Atomic cell for the session state, readable without the control lock.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Idle,
            1 => SessionState::Starting,
            2 => SessionState::Running,
            3 => SessionState::Stopping,
            _ => SessionState::Faulted,
        }
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Sink handle and negotiated format for the active pipeline, shared with
/// the snapshot path under its own short-lived lock.
struct ActiveShared {
    sink: Arc<FrameSink>,
    format: FrameFormat,
    device: DeviceDescriptor,
}

/// Start/stop-owned resources. Guarded by the control mutex so the two
/// operations serialize; contention is a caller bug, not a wait.
struct ControlBlock {
    pipeline: Option<Box<dyn PipelineHandle>>,
    watchdog: Option<JoinHandle<()>>,
    watchdog_shutdown: Arc<AtomicBool>,
}

/// A video-capture session: owns the device catalog, at most one pipeline
/// and one frame sink at a time, and the state machine around them.
///
/// `start`/`stop` are called from the UI thread and serialize on an internal
/// lock; `capture_snapshot` and `state` only touch atomics and short-lived
/// locks, so they are safe from any thread while frames are being delivered.
pub struct CaptureSession {
    backend: Arc<dyn PipelineBackend>,
    catalog: Mutex<DeviceCatalog>,
    state: Arc<StateCell>,
    shared: Mutex<Option<ActiveShared>>,
    control: Mutex<ControlBlock>,
    last_fault: Arc<Mutex<Option<String>>>,
    watchdog_poll: Duration,
}

impl CaptureSession {
    /// Session against the current platform's native backend.
    pub fn new() -> Self {
        let backend: Arc<dyn PipelineBackend> = {
            #[cfg(target_os = "windows")]
            {
                Arc::new(crate::capture::graph::DirectShowBackend::new())
            }

            #[cfg(not(target_os = "windows"))]
            {
                Arc::new(crate::capture::driver::NullBackend)
            }
        };
        Self::with_parts(DeviceCatalog::new(), backend)
    }

    /// Session with explicit catalog and pipeline backend (tests, embedding).
    pub fn with_parts(catalog: DeviceCatalog, backend: Arc<dyn PipelineBackend>) -> Self {
        Self {
            backend,
            catalog: Mutex::new(catalog),
            state: Arc::new(StateCell::new()),
            shared: Mutex::new(None),
            control: Mutex::new(ControlBlock {
                pipeline: None,
                watchdog: None,
                watchdog_shutdown: Arc::new(AtomicBool::new(false)),
            }),
            last_fault: Arc::new(Mutex::new(None)),
            watchdog_poll: Duration::from_millis(100),
        }
    }

    /// Override the watchdog poll interval (tests use short intervals).
    pub fn with_watchdog_poll(mut self, poll: Duration) -> Self {
        self.watchdog_poll = poll;
        self
    }

    /// Re-enumerate capture devices and return the fresh snapshot.
    ///
    /// The returned order is the platform's and is what `start` indices
    /// refer to.
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.catalog.lock().refresh().map(<[DeviceDescriptor]>::to_vec)
    }

    /// Current lifecycle state. UIs poll this before enabling controls.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Message of the fault that drove the session to `Faulted`, if any.
    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.lock().clone()
    }

    /// Build and run a pipeline for the device at `index` in the last
    /// enumerated catalog. Valid only from `Idle`.
    ///
    /// On any builder failure every partially-created resource is released
    /// and the session is back in `Idle` with the staged error — never
    /// half-constructed.
    pub fn start(&self, index: usize, surface: SurfaceHandle) -> Result<()> {
        let mut control = self
            .control
            .try_lock()
            .ok_or(CaptureError::ConcurrentState)?;

        match self.state.get() {
            SessionState::Idle => {}
            SessionState::Faulted => {
                return Err(CaptureError::PipelineFault(
                    "session is faulted; stop() it before restarting".into(),
                ))
            }
            _ => return Err(CaptureError::AlreadyRunning),
        }

        let device = {
            let catalog = self.catalog.lock();
            catalog
                .get(index)
                .cloned()
                .ok_or(CaptureError::InvalidDeviceIndex {
                    index,
                    count: catalog.len(),
                })?
        };

        self.state.set(SessionState::Starting);
        self.last_fault.lock().take();
        info!("starting capture for {} ({})", device.name, device.id);

        let sink = Arc::new(FrameSink::new());
        let mut pipeline = match self.backend.build(&device, surface, Arc::clone(&sink)) {
            Ok(p) => p,
            Err(e) => {
                // partial resources die with their RAII scopes
                self.state.set(SessionState::Idle);
                error!("pipeline build failed: {e}");
                return Err(e);
            }
        };

        // Open the gate before delivery begins so the first frames are kept.
        sink.set_accepting(true);

        if let Err(e) = pipeline.run() {
            sink.set_accepting(false);
            let _ = pipeline.halt();
            drop(pipeline);
            self.state.set(SessionState::Idle);
            error!("pipeline start failed: {e}");
            return Err(e);
        }

        let format = pipeline.format();
        *self.shared.lock() = Some(ActiveShared {
            sink: Arc::clone(&sink),
            format,
            device,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let watchdog = spawn_watchdog(
            pipeline.fault_slot(),
            Arc::clone(&self.state),
            sink,
            Arc::clone(&self.last_fault),
            Arc::clone(&shutdown),
            self.watchdog_poll,
        );

        control.pipeline = Some(pipeline);
        control.watchdog = watchdog;
        control.watchdog_shutdown = shutdown;

        self.state.set(SessionState::Running);
        info!("capture running at {}x{}", format.width, format.height);
        Ok(())
    }

    /// Halt delivery and release the sink, then the graph, in that order.
    ///
    /// Idempotent from `Idle`. Always reaches `Idle` with resources
    /// released; an error from the underlying halt is returned only after
    /// teardown has completed.
    pub fn stop(&self) -> Result<()> {
        let mut control = self
            .control
            .try_lock()
            .ok_or(CaptureError::ConcurrentState)?;

        if self.state.get() == SessionState::Idle {
            return Ok(());
        }

        self.state.set(SessionState::Stopping);

        // Gate the sink first so frames arriving mid-teardown are discarded.
        if let Some(shared) = self.shared.lock().take() {
            shared.sink.set_accepting(false);
        }

        control.watchdog_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = control.watchdog.take() {
            let _ = handle.join();
        }

        let mut halt_result = Ok(());
        if let Some(mut pipeline) = control.pipeline.take() {
            if let Err(e) = pipeline.halt() {
                warn!("pipeline halt reported an error: {e}");
                halt_result = Err(e);
            }
            // drop releases sink node before graph
            drop(pipeline);
        }

        self.state.set(SessionState::Idle);
        info!("capture session stopped");
        halt_result
    }

    /// Deep-copy the most recent frame into an independent still image.
    ///
    /// Valid only while `Running`. Before the first frame arrives, a
    /// synthetic test pattern in the negotiated dimensions is returned
    /// instead of failing; it is flagged via `SnapshotImage::is_synthetic`.
    pub fn capture_snapshot(&self) -> Result<SnapshotImage> {
        if self.state.get() != SessionState::Running {
            return Err(CaptureError::NotRunning);
        }

        let (sink, format) = {
            let shared = self.shared.lock();
            let active = shared.as_ref().ok_or(CaptureError::NotRunning)?;
            (Arc::clone(&active.sink), active.format)
        };

        match sink.latest() {
            Some(frame) => Ok(SnapshotImage::from_frame(&frame)),
            None => Ok(SnapshotImage::test_pattern(format)),
        }
    }

    /// Delivery counters for the active pipeline.
    pub fn delivery_stats(&self) -> Result<DeliverySnapshot> {
        let shared = self.shared.lock();
        let active = shared.as_ref().ok_or(CaptureError::NotRunning)?;
        Ok(active.sink.stats())
    }

    /// Descriptor of the device the session is bound to, if any.
    pub fn active_device(&self) -> Option<DeviceDescriptor> {
        self.shared.lock().as_ref().map(|a| a.device.clone())
    }
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // Best-effort release without the caller having to stop() first.
        let control = self.control.get_mut();
        control.watchdog_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = control.watchdog.take() {
            let _ = handle.join();
        }
        if let Some(mut pipeline) = control.pipeline.take() {
            let _ = pipeline.halt();
        }
    }
}

/// Poll the pipeline's fault slot; on a fault, gate the sink and drive the
/// session to `Faulted`.
fn spawn_watchdog(
    fault: FaultSlot,
    state: Arc<StateCell>,
    sink: Arc<FrameSink>,
    last_fault: Arc<Mutex<Option<String>>>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) -> Option<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("capture-watchdog".to_string())
        .spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Some(message) = fault.get() {
                error!("pipeline fault detected: {message}");
                sink.set_accepting(false);
                *last_fault.lock() = Some(message);
                state.set(SessionState::Faulted);
                return;
            }
            std::thread::sleep(poll);
        })
        .ok()
}
