use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::capture::driver::{FaultSlot, PipelineBackend, PipelineHandle, SurfaceHandle};
use crate::capture::sink::{FrameFormat, FrameSink};
use crate::catalog::types::DeviceDescriptor;
use crate::error::{CaptureError, Result};

/// Pipeline assembly stages a simulated build can be told to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    GraphCreation,
    SinkInsert,
    MediaNegotiation,
    DeviceBind,
    Connection,
}

/// Fake pipeline backend for testing and development without hardware.
///
/// Builds pipelines whose delivery thread generates uniform-fill RGB24
/// frames, so readers can detect torn buffers by checking that every byte of
/// a frame is equal. Build-stage failures, halt failures, and asynchronous
/// faults are injectable, and a live-handle counter makes resource leaks
/// observable across start/stop cycles.
pub struct SimulatedBackend {
    format: FrameFormat,
    frame_interval: Duration,
    fail_at: Option<BuildStage>,
    fail_halt: bool,
    halt_delay: Duration,
    fault_after: Option<u64>,
    starve: bool,
    live: Arc<AtomicUsize>,
}

impl SimulatedBackend {
    /// A backend delivering VGA frames at roughly 30 fps.
    pub fn new() -> Self {
        Self {
            format: FrameFormat::vga(),
            frame_interval: Duration::from_millis(33),
            fail_at: None,
            fail_halt: false,
            halt_delay: Duration::ZERO,
            fault_after: None,
            starve: false,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the delivery interval (tests use short intervals).
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Make every build fail at the given stage.
    pub fn fail_at(mut self, stage: BuildStage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Make `halt` report an error (teardown still completes).
    pub fn fail_halt(mut self) -> Self {
        self.fail_halt = true;
        self
    }

    /// Make `halt` take this long, simulating a slow platform stop call.
    pub fn with_halt_delay(mut self, delay: Duration) -> Self {
        self.halt_delay = delay;
        self
    }

    /// Raise an asynchronous pipeline fault after delivering `frames`.
    pub fn fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    /// Run without ever delivering a frame (cold-start behaviour).
    pub fn starve(mut self) -> Self {
        self.starve = true;
        self
    }

    /// Number of built pipelines not yet released.
    pub fn live_pipelines(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBackend for SimulatedBackend {
    fn build(
        &self,
        device: &DeviceDescriptor,
        _surface: SurfaceHandle,
        sink: Arc<FrameSink>,
    ) -> Result<Box<dyn PipelineHandle>> {
        if let Some(stage) = self.fail_at {
            let msg = format!("injected failure for {}", device.id);
            return Err(match stage {
                BuildStage::GraphCreation => CaptureError::GraphCreation(msg),
                BuildStage::SinkInsert => CaptureError::SinkInsert(msg),
                BuildStage::MediaNegotiation => CaptureError::MediaNegotiation(msg),
                BuildStage::DeviceBind => CaptureError::DeviceBind(msg),
                BuildStage::Connection => CaptureError::Connection(msg),
            });
        }

        sink.configure(self.format);
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!("simulated pipeline built for {}", device.id);

        Ok(Box::new(SimulatedPipeline {
            sink,
            format: self.format,
            frame_interval: self.frame_interval,
            fail_halt: self.fail_halt,
            halt_delay: self.halt_delay,
            fault_after: self.fault_after,
            starve: self.starve,
            running: Arc::new(AtomicBool::new(false)),
            fault: FaultSlot::new(),
            thread: None,
            live: Arc::clone(&self.live),
        }))
    }
}

/// A built simulated pipeline; `run` spawns the generator thread that plays
/// the role of the platform's delivery thread.
struct SimulatedPipeline {
    sink: Arc<FrameSink>,
    format: FrameFormat,
    frame_interval: Duration,
    fail_halt: bool,
    halt_delay: Duration,
    fault_after: Option<u64>,
    starve: bool,
    running: Arc<AtomicBool>,
    fault: FaultSlot,
    thread: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

impl SimulatedPipeline {
    fn stop_generator(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl PipelineHandle for SimulatedPipeline {
    fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);

        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        let fault = self.fault.clone();
        let fault_after = self.fault_after;
        let starve = self.starve;
        let interval = self.frame_interval;
        let len = self.format.byte_len();

        let handle = std::thread::Builder::new()
            .name("sim-delivery".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut seq: u64 = 0;
                while running.load(Ordering::Relaxed) {
                    if starve {
                        std::thread::sleep(interval);
                        continue;
                    }
                    if let Some(limit) = fault_after {
                        if seq >= limit {
                            fault.raise(format!(
                                "simulated pipeline fault after {limit} frames"
                            ));
                            break;
                        }
                    }
                    // uniform fill per frame so readers can detect tearing
                    let frame = vec![(seq % 256) as u8; len];
                    sink.on_buffer(started.elapsed().as_micros() as u64, &frame);
                    seq += 1;
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| CaptureError::PipelineFault(format!("spawn failed: {e}")))?;

        self.thread = Some(handle);
        info!("simulated delivery running at {:?}/frame", self.frame_interval);
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        if !self.halt_delay.is_zero() {
            std::thread::sleep(self.halt_delay);
        }
        self.stop_generator();
        if self.fail_halt {
            return Err(CaptureError::PipelineFault(
                "injected halt failure".into(),
            ));
        }
        Ok(())
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn fault_slot(&self) -> FaultSlot {
        self.fault.clone()
    }
}

impl Drop for SimulatedPipeline {
    fn drop(&mut self) {
        self.stop_generator();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::DeviceId;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new("sim:0000"),
            name: "Simulated Capture Device".to_string(),
        }
    }

    fn fast_backend() -> SimulatedBackend {
        SimulatedBackend::new().with_frame_interval(Duration::from_millis(1))
    }

    #[test]
    fn build_configures_sink_and_counts_handle() {
        let backend = fast_backend();
        let sink = Arc::new(FrameSink::new());

        let pipeline = backend
            .build(&device(), SurfaceHandle::null(), Arc::clone(&sink))
            .unwrap();
        assert_eq!(sink.format(), FrameFormat::vga());
        assert_eq!(backend.live_pipelines(), 1);

        drop(pipeline);
        assert_eq!(backend.live_pipelines(), 0);
    }

    #[test]
    fn injected_build_failures_use_the_right_kind() {
        let cases = [
            (BuildStage::GraphCreation, "filter graph creation"),
            (BuildStage::SinkInsert, "frame sink insertion"),
            (BuildStage::MediaNegotiation, "media type negotiation"),
            (BuildStage::DeviceBind, "device binding"),
            (BuildStage::Connection, "pin connection"),
        ];
        for (stage, phrase) in cases {
            let backend = SimulatedBackend::new().fail_at(stage);
            let err = match backend.build(&device(), SurfaceHandle::null(), Arc::new(FrameSink::new())) {
                Ok(_) => panic!("stage {stage:?} unexpectedly built a pipeline"),
                Err(err) => err,
            };
            assert!(
                err.to_string().contains(phrase),
                "stage {stage:?} produced: {err}"
            );
        }
    }

    #[test]
    fn running_pipeline_delivers_frames_into_open_sink() {
        let backend = fast_backend();
        let sink = Arc::new(FrameSink::new());
        let mut pipeline = backend
            .build(&device(), SurfaceHandle::null(), Arc::clone(&sink))
            .unwrap();

        sink.set_accepting(true);
        pipeline.run().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.sequence() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(sink.sequence() > 0, "no frames delivered");

        let frame = sink.latest().unwrap();
        assert_eq!(frame.data.len(), FrameFormat::vga().byte_len());
        pipeline.halt().unwrap();
    }

    #[test]
    fn halt_is_synchronous_and_stops_delivery() {
        let backend = fast_backend();
        let sink = Arc::new(FrameSink::new());
        let mut pipeline = backend
            .build(&device(), SurfaceHandle::null(), Arc::clone(&sink))
            .unwrap();
        sink.set_accepting(true);
        pipeline.run().unwrap();
        pipeline.halt().unwrap();

        let seq = sink.sequence();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.sequence(), seq, "delivery continued after halt");
    }

    #[test]
    fn fault_after_limit_raises_fault() {
        let backend = fast_backend().fault_after(3);
        let sink = Arc::new(FrameSink::new());
        let mut pipeline = backend
            .build(&device(), SurfaceHandle::null(), Arc::clone(&sink))
            .unwrap();
        sink.set_accepting(true);
        pipeline.run().unwrap();

        let fault = pipeline.fault_slot();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !fault.is_raised() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(fault.get().unwrap().contains("after 3 frames"));
        let _ = pipeline.halt();
    }

    #[test]
    fn fail_halt_reports_error_but_still_releases() {
        let backend = fast_backend().fail_halt();
        let sink = Arc::new(FrameSink::new());
        let mut pipeline = backend
            .build(&device(), SurfaceHandle::null(), Arc::clone(&sink))
            .unwrap();
        pipeline.run().unwrap();

        assert!(matches!(
            pipeline.halt(),
            Err(CaptureError::PipelineFault(_))
        ));
        drop(pipeline);
        assert_eq!(backend.live_pipelines(), 0);
    }
}
