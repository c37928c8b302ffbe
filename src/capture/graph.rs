// DirectShow capture pipeline.
//
// Builds a Source -> SampleGrabber -> NullRenderer graph negotiated to
// uncompressed RGB24 and delivers raw frames into the shared FrameSink via
// an ISampleGrabberCB callback. All COM objects live on a dedicated capture
// thread; the PipelineHandle talks to it over a command channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use windows::core::{Interface, GUID, HRESULT};
use windows::Win32::Media::DirectShow::{
    IBaseFilter, ICreateDevEnum, IFilterGraph2, IGraphBuilder, IMediaControl, IMediaEvent, IPin,
};
use windows::Win32::Media::MediaFoundation::{
    CLSID_SystemDeviceEnum, CLSID_VideoInputDeviceCategory, VIDEOINFOHEADER,
};
use windows::Win32::System::Com::StructuredStorage::IPropertyBag;
use windows::Win32::System::Com::{
    CoCreateInstance, CoTaskMemFree, IMoniker, CLSCTX_INPROC_SERVER,
};
use windows::Win32::System::Variant::VARIANT;

use crate::capture::driver::{FaultSlot, PipelineBackend, PipelineHandle, SurfaceHandle};
use crate::capture::sink::{FrameFormat, FrameSink};
use crate::catalog::platform::windows::ComGuard;
use crate::catalog::types::DeviceDescriptor;
use crate::error::{CaptureError, Result};

// --- Manually defined types not in windows-rs metadata ---

/// AM_MEDIA_TYPE — DirectShow media type descriptor.
/// Layout matches the C struct from dshow.h / strmif.h.
#[repr(C)]
#[derive(Clone)]
struct AmMediaType {
    major_type: GUID,
    sub_type: GUID,
    fixed_size_samples: i32,
    temporal_compression: i32,
    sample_size: u32,
    format_type: GUID,
    unk: usize, // IUnknown* (unused)
    cb_format: u32,
    pb_format: *mut u8,
}

impl Default for AmMediaType {
    fn default() -> Self {
        Self {
            major_type: GUID::zeroed(),
            sub_type: GUID::zeroed(),
            fixed_size_samples: 0,
            temporal_compression: 0,
            sample_size: 0,
            format_type: GUID::zeroed(),
            unk: 0,
            cb_format: 0,
            pb_format: std::ptr::null_mut(),
        }
    }
}

// --- COM GUIDs ---

// IUnknown: {00000000-0000-0000-C000-000000000046}
const IID_IUNKNOWN: GUID = GUID::from_u128(0x00000000_0000_0000_C000_000000000046);

// ISampleGrabberCB: {0579154A-2B53-4994-B0D0-E773148EFF85}
const IID_ISAMPLEGRABBER_CB: GUID = GUID::from_u128(0x0579154A_2B53_4994_B0D0_E773148EFF85);

// ISampleGrabber: {6B652FFF-11FE-4FCE-92AD-0266B5D7C78F}
const IID_ISAMPLEGRABBER: GUID = GUID::from_u128(0x6B652FFF_11FE_4FCE_92AD_0266B5D7C78F);

// CLSID_SampleGrabber: {C1F400A0-3F08-11D3-9F0B-006008039E37}
const CLSID_SAMPLE_GRABBER: GUID = GUID::from_u128(0xC1F400A0_3F08_11D3_9F0B_006008039E37);

// CLSID_NullRenderer: {C1F400A4-3F08-11D3-9F0B-006008039E37}
const CLSID_NULL_RENDERER: GUID = GUID::from_u128(0xC1F400A4_3F08_11D3_9F0B_006008039E37);

// CLSID_FilterGraph: {E436EBB3-524F-11CE-9F53-0020AF0BA770}
const CLSID_FILTER_GRAPH: GUID = GUID::from_u128(0xE436EBB3_524F_11CE_9F53_0020AF0BA770);

// MEDIATYPE_Video: {73646976-0000-0010-8000-00AA00389B71}
const MEDIATYPE_VIDEO: GUID = GUID::from_u128(0x73646976_0000_0010_8000_00AA00389B71);

// MEDIASUBTYPE_RGB24: {e436eb7d-524f-11ce-9f53-0020af0ba770}
const MEDIASUBTYPE_RGB24: GUID = GUID::from_u128(0xe436eb7d_524f_11ce_9f53_0020af0ba770);

// DirectShow event codes surfaced as pipeline faults.
const EC_ERRORABORT: i32 = 0x03;
const EC_DEVICE_LOST: i32 = 0x1F;

// --- ISampleGrabber raw COM interface ---

/// ISampleGrabber vtable layout matching the C++ interface.
#[repr(C)]
struct ISampleGrabberVtbl {
    // IUnknown (3 methods)
    query_interface: unsafe extern "system" fn(
        *mut core::ffi::c_void,
        *const GUID,
        *mut *mut core::ffi::c_void,
    ) -> HRESULT,
    add_ref: unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
    release: unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
    // ISampleGrabber methods
    set_one_shot: unsafe extern "system" fn(*mut core::ffi::c_void, i32) -> HRESULT,
    set_media_type:
        unsafe extern "system" fn(*mut core::ffi::c_void, *const AmMediaType) -> HRESULT,
    get_connected_media_type:
        unsafe extern "system" fn(*mut core::ffi::c_void, *mut AmMediaType) -> HRESULT,
    set_buffer_samples: unsafe extern "system" fn(*mut core::ffi::c_void, i32) -> HRESULT,
    get_current_buffer:
        unsafe extern "system" fn(*mut core::ffi::c_void, *mut i32, *mut u8) -> HRESULT,
    get_current_sample: unsafe extern "system" fn(
        *mut core::ffi::c_void,
        *mut *mut core::ffi::c_void,
    ) -> HRESULT,
    set_callback: unsafe extern "system" fn(
        *mut core::ffi::c_void,
        *mut core::ffi::c_void,
        i32,
    ) -> HRESULT,
}

/// Owned wrapper for the raw ISampleGrabber COM pointer. Dropping releases
/// the interface — the wrapper is declared after the graph so the sink node
/// goes first.
struct SampleGrabber {
    ptr: *mut core::ffi::c_void,
}

impl SampleGrabber {
    /// Query ISampleGrabber from an IBaseFilter via raw QueryInterface.
    unsafe fn from_filter(filter: &IBaseFilter) -> Option<Self> {
        let unk_ptr = std::mem::transmute_copy::<IBaseFilter, *mut core::ffi::c_void>(filter);
        if unk_ptr.is_null() {
            return None;
        }

        let vtbl = *(unk_ptr as *const *const usize);
        let qi: unsafe extern "system" fn(
            *mut core::ffi::c_void,
            *const GUID,
            *mut *mut core::ffi::c_void,
        ) -> HRESULT = std::mem::transmute(*vtbl);

        let mut result: *mut core::ffi::c_void = std::ptr::null_mut();
        let hr = qi(unk_ptr, &IID_ISAMPLEGRABBER, &mut result);

        if hr.is_ok() && !result.is_null() {
            Some(Self { ptr: result })
        } else {
            None
        }
    }

    unsafe fn vtbl(&self) -> &ISampleGrabberVtbl {
        &*(*(self.ptr as *const *const ISampleGrabberVtbl))
    }

    unsafe fn set_media_type(&self, mt: &AmMediaType) -> HRESULT {
        (self.vtbl().set_media_type)(self.ptr, mt)
    }

    unsafe fn set_one_shot(&self, one_shot: bool) -> HRESULT {
        (self.vtbl().set_one_shot)(self.ptr, i32::from(one_shot))
    }

    unsafe fn set_buffer_samples(&self, buffer: bool) -> HRESULT {
        (self.vtbl().set_buffer_samples)(self.ptr, i32::from(buffer))
    }

    unsafe fn set_callback(&self, callback: *mut core::ffi::c_void, which: i32) -> HRESULT {
        (self.vtbl().set_callback)(self.ptr, callback, which)
    }

    unsafe fn get_connected_media_type(&self, mt: &mut AmMediaType) -> HRESULT {
        (self.vtbl().get_connected_media_type)(self.ptr, mt)
    }
}

impl Drop for SampleGrabber {
    fn drop(&mut self) {
        unsafe {
            let vtbl = self.vtbl();
            (vtbl.release)(self.ptr);
        }
    }
}

// --- ISampleGrabberCB implementation ---

/// ISampleGrabberCB vtable layout.
#[repr(C)]
struct ISampleGrabberCBVtbl {
    query_interface: unsafe extern "system" fn(
        *mut core::ffi::c_void,
        *const GUID,
        *mut *mut core::ffi::c_void,
    ) -> HRESULT,
    add_ref: unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
    release: unsafe extern "system" fn(*mut core::ffi::c_void) -> u32,
    sample_cb: unsafe extern "system" fn(
        *mut core::ffi::c_void,
        f64,
        *mut core::ffi::c_void,
    ) -> HRESULT,
    buffer_cb: unsafe extern "system" fn(*mut core::ffi::c_void, f64, *mut u8, i32) -> HRESULT,
}

/// COM object data for our ISampleGrabberCB implementation.
#[repr(C)]
struct FrameCallbackData {
    vtbl: *const ISampleGrabberCBVtbl,
    ref_count: AtomicU32,
    sink: Arc<FrameSink>,
}

static FRAME_CALLBACK_VTBL: ISampleGrabberCBVtbl = ISampleGrabberCBVtbl {
    query_interface: frame_cb_query_interface,
    add_ref: frame_cb_add_ref,
    release: frame_cb_release,
    sample_cb: frame_cb_sample_cb,
    buffer_cb: frame_cb_buffer_cb,
};

unsafe extern "system" fn frame_cb_query_interface(
    this: *mut core::ffi::c_void,
    riid: *const GUID,
    ppv: *mut *mut core::ffi::c_void,
) -> HRESULT {
    let iid = &*riid;
    if *iid == IID_ISAMPLEGRABBER_CB || *iid == IID_IUNKNOWN {
        *ppv = this;
        frame_cb_add_ref(this);
        HRESULT(0) // S_OK
    } else {
        *ppv = std::ptr::null_mut();
        HRESULT(0x80004002u32 as i32) // E_NOINTERFACE
    }
}

unsafe extern "system" fn frame_cb_add_ref(this: *mut core::ffi::c_void) -> u32 {
    let data = &*(this as *const FrameCallbackData);
    data.ref_count
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_add(1)
}

unsafe extern "system" fn frame_cb_release(this: *mut core::ffi::c_void) -> u32 {
    let data = &*(this as *const FrameCallbackData);
    let prev = data.ref_count.fetch_sub(1, Ordering::Relaxed);
    if prev == 1 {
        drop(Box::from_raw(this as *mut FrameCallbackData));
        return 0;
    }
    prev - 1
}

/// Structured-sample entry point — pass-through, raw buffers are
/// authoritative (callback mode 1).
unsafe extern "system" fn frame_cb_sample_cb(
    this: *mut core::ffi::c_void,
    sample_time: f64,
    _sample: *mut core::ffi::c_void,
) -> HRESULT {
    let data = &*(this as *const FrameCallbackData);
    data.sink.on_sample((sample_time * 1_000_000.0) as u64);
    HRESULT(0)
}

/// Raw-buffer entry point. Executes on the graph's delivery thread, never
/// the application's — no blocking, no UI work, one frame-sized copy.
unsafe extern "system" fn frame_cb_buffer_cb(
    this: *mut core::ffi::c_void,
    sample_time: f64,
    buffer: *mut u8,
    buffer_len: i32,
) -> HRESULT {
    let data = &*(this as *const FrameCallbackData);

    if buffer.is_null() || buffer_len <= 0 {
        warn!("frame callback received null/empty buffer (len={buffer_len})");
        return HRESULT(0);
    }

    let raw = std::slice::from_raw_parts(buffer, buffer_len as usize);
    let format = data.sink.format();

    // DirectShow hands RGB24 as BGR, bottom-up; normalise before the sink.
    let rgb = convert_bgr_bottom_up_to_rgb(raw, format.width as usize, format.height as usize);
    if rgb.is_empty() {
        warn!(
            "frame size mismatch: got {} bytes for {}x{}",
            raw.len(),
            format.width,
            format.height
        );
        return HRESULT(0);
    }

    data.sink
        .on_buffer((sample_time * 1_000_000.0) as u64, &rgb);
    HRESULT(0)
}

/// Allocate the callback COM object with one owning reference.
fn create_frame_callback(sink: Arc<FrameSink>) -> *mut core::ffi::c_void {
    let data = Box::new(FrameCallbackData {
        vtbl: &FRAME_CALLBACK_VTBL,
        ref_count: AtomicU32::new(1),
        sink,
    });
    Box::into_raw(data) as *mut core::ffi::c_void
}

/// Convert BGR24 bottom-up data to RGB24 top-down.
///
/// Returns an empty vec when the input is shorter than one full frame.
fn convert_bgr_bottom_up_to_rgb(bgr: &[u8], width: usize, height: usize) -> Vec<u8> {
    let stride = width * 3;
    let expected = stride * height;
    if bgr.len() < expected || width == 0 || height == 0 {
        return Vec::new();
    }

    let mut rgb = vec![0u8; expected];
    for y in 0..height {
        let src_row = &bgr[(height - 1 - y) * stride..(height - y) * stride];
        let dst_row = &mut rgb[y * stride..(y + 1) * stride];
        for x in 0..width {
            dst_row[x * 3] = src_row[x * 3 + 2]; // R
            dst_row[x * 3 + 1] = src_row[x * 3 + 1]; // G
            dst_row[x * 3 + 2] = src_row[x * 3]; // B
        }
    }
    rgb
}

// --- Backend ---

/// Commands the pipeline handle sends to the capture thread.
enum Command {
    Run(mpsc::Sender<Result<()>>),
    Halt(mpsc::Sender<Result<()>>),
}

/// DirectShow pipeline backend.
pub struct DirectShowBackend {
    requested: FrameFormat,
}

impl DirectShowBackend {
    /// Backend requesting the default VGA RGB24 contract.
    pub fn new() -> Self {
        Self {
            requested: FrameFormat::vga(),
        }
    }
}

impl Default for DirectShowBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBackend for DirectShowBackend {
    fn build(
        &self,
        device: &DeviceDescriptor,
        _surface: SurfaceHandle,
        sink: Arc<FrameSink>,
    ) -> Result<Box<dyn PipelineHandle>> {
        let fault = FaultSlot::new();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (built_tx, built_rx) = mpsc::channel();

        let thread = {
            let device = device.clone();
            let requested = self.requested;
            let fault = fault.clone();
            std::thread::Builder::new()
                .name(format!("dshow-{}", device.name))
                .spawn(move || {
                    serve_graph(&device, requested, sink, fault, cmd_rx, built_tx);
                })
                .map_err(|e| CaptureError::GraphCreation(format!("spawn failed: {e}")))?
        };

        // The capture thread reports the staged build result synchronously.
        let format = built_rx.recv().map_err(|_| {
            CaptureError::GraphCreation("capture thread exited before reporting".into())
        })??;

        Ok(Box::new(DirectShowPipeline {
            format,
            fault,
            commands: Some(cmd_tx),
            thread: Some(thread),
        }))
    }
}

/// Handle to a graph living on its capture thread. Dropping the handle
/// closes the command channel, which tears the graph down in dependency
/// order and joins the thread.
struct DirectShowPipeline {
    format: FrameFormat,
    fault: FaultSlot,
    commands: Option<mpsc::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl DirectShowPipeline {
    fn send(&self, make: impl FnOnce(mpsc::Sender<Result<()>>) -> Command) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| CaptureError::PipelineFault("pipeline already released".into()))?;
        let (reply_tx, reply_rx) = mpsc::channel();
        commands
            .send(make(reply_tx))
            .map_err(|_| CaptureError::PipelineFault("capture thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| CaptureError::PipelineFault("capture thread is gone".into()))?
    }
}

impl PipelineHandle for DirectShowPipeline {
    fn run(&mut self) -> Result<()> {
        self.send(Command::Run)
    }

    fn halt(&mut self) -> Result<()> {
        let result = self.send(Command::Halt);
        // The serving loop exits after Halt; join so stop() is synchronous.
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn fault_slot(&self) -> FaultSlot {
        self.fault.clone()
    }
}

impl Drop for DirectShowPipeline {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Build the graph, report the result, then serve run/halt commands until
/// told to stop or the handle is dropped.
///
/// Declaration order matters for teardown: the graph is created before the
/// grabber wrapper and filters, so Rust's reverse-order drop releases the
/// sink node (and the other filters) before the graph itself, and the COM
/// guard deinitialises last.
fn serve_graph(
    device: &DeviceDescriptor,
    requested: FrameFormat,
    sink: Arc<FrameSink>,
    fault: FaultSlot,
    commands: mpsc::Receiver<Command>,
    built: mpsc::Sender<std::result::Result<FrameFormat, CaptureError>>,
) {
    let _com = match ComGuard::init() {
        Ok(guard) => guard,
        Err(e) => {
            let _ = built.send(Err(CaptureError::GraphCreation(e)));
            return;
        }
    };

    unsafe {
        // Stage 1: empty processing graph.
        let graph: IGraphBuilder =
            match CoCreateInstance(&CLSID_FILTER_GRAPH, None, CLSCTX_INPROC_SERVER) {
                Ok(g) => g,
                Err(e) => {
                    let _ = built.send(Err(CaptureError::GraphCreation(format!(
                        "CoCreateInstance(FilterGraph) failed: {e}"
                    ))));
                    return;
                }
            };
        let graph2: IFilterGraph2 = match graph.cast() {
            Ok(g) => g,
            Err(e) => {
                let _ = built.send(Err(CaptureError::GraphCreation(format!(
                    "IFilterGraph2 unavailable: {e}"
                ))));
                return;
            }
        };

        // Stage 2: frame-sampling sink node into the graph.
        let grabber_filter: IBaseFilter =
            match CoCreateInstance(&CLSID_SAMPLE_GRABBER, None, CLSCTX_INPROC_SERVER) {
                Ok(f) => f,
                Err(e) => {
                    let _ = built.send(Err(CaptureError::SinkInsert(format!(
                        "CoCreateInstance(SampleGrabber) failed: {e}"
                    ))));
                    return;
                }
            };
        if let Err(e) = graph2.AddFilter(&grabber_filter, windows::core::w!("SampleGrabber")) {
            let _ = built.send(Err(CaptureError::SinkInsert(format!(
                "AddFilter(SampleGrabber) failed: {e}"
            ))));
            return;
        }
        let Some(grabber) = SampleGrabber::from_filter(&grabber_filter) else {
            let _ = built.send(Err(CaptureError::SinkInsert(
                "ISampleGrabber interface unavailable".into(),
            )));
            return;
        };

        // Stage 3: media contract — video / RGB24, fixed-size samples, no
        // temporal compression, sample size auto-computed.
        let contract = AmMediaType {
            major_type: MEDIATYPE_VIDEO,
            sub_type: MEDIASUBTYPE_RGB24,
            fixed_size_samples: 1,
            temporal_compression: 0,
            sample_size: 0,
            ..AmMediaType::default()
        };
        let hr = grabber.set_media_type(&contract);
        if hr.is_err() {
            let _ = built.send(Err(CaptureError::MediaNegotiation(format!(
                "SetMediaType(RGB24) rejected: {hr:?}"
            ))));
            return;
        }

        // Stage 4: bind the source device and connect it to the sink. The
        // most device-quirk-exposed stage, so bind and connect report
        // separately.
        let source = match find_source_filter(device) {
            Ok(f) => f,
            Err(e) => {
                let _ = built.send(Err(e));
                return;
            }
        };
        if let Err(e) = graph2.AddFilter(&source, windows::core::w!("Source")) {
            let _ = built.send(Err(CaptureError::DeviceBind(format!(
                "AddFilter(Source) failed: {e}"
            ))));
            return;
        }

        let source_out = match find_unconnected_pin(&source, 1) {
            Ok(pin) => pin,
            Err(e) => {
                let _ = built.send(Err(e));
                return;
            }
        };
        let grabber_in = match find_unconnected_pin(&grabber_filter, 0) {
            Ok(pin) => pin,
            Err(e) => {
                let _ = built.send(Err(e));
                return;
            }
        };
        if let Err(e) = graph2.Connect(&source_out, &grabber_in) {
            let _ = built.send(Err(CaptureError::Connection(format!(
                "source -> grabber: {e}"
            ))));
            return;
        }

        // Terminate the grabber in a NullRenderer so delivery needs no window.
        let null_renderer: IBaseFilter =
            match CoCreateInstance(&CLSID_NULL_RENDERER, None, CLSCTX_INPROC_SERVER) {
                Ok(f) => f,
                Err(e) => {
                    let _ = built.send(Err(CaptureError::Connection(format!(
                        "CoCreateInstance(NullRenderer) failed: {e}"
                    ))));
                    return;
                }
            };
        if let Err(e) = graph2.AddFilter(&null_renderer, windows::core::w!("NullRenderer")) {
            let _ = built.send(Err(CaptureError::Connection(format!(
                "AddFilter(NullRenderer): {e}"
            ))));
            return;
        }
        let grabber_out = match find_unconnected_pin(&grabber_filter, 1) {
            Ok(pin) => pin,
            Err(e) => {
                let _ = built.send(Err(e));
                return;
            }
        };
        let null_in = match find_unconnected_pin(&null_renderer, 0) {
            Ok(pin) => pin,
            Err(e) => {
                let _ = built.send(Err(e));
                return;
            }
        };
        if let Err(e) = graph2.Connect(&grabber_out, &null_in) {
            let _ = built.send(Err(CaptureError::Connection(format!(
                "grabber -> renderer: {e}"
            ))));
            return;
        }

        // Stage 5: continuous buffered delivery, raw-buffer callback.
        let hr = grabber.set_buffer_samples(true);
        if hr.is_err() {
            let _ = built.send(Err(CaptureError::MediaNegotiation(format!(
                "SetBufferSamples failed: {hr:?}"
            ))));
            return;
        }
        let hr = grabber.set_one_shot(false);
        if hr.is_err() {
            let _ = built.send(Err(CaptureError::MediaNegotiation(format!(
                "SetOneShot failed: {hr:?}"
            ))));
            return;
        }

        // The connected media type tells us what the device actually agreed
        // to; trust it over the request.
        let format = negotiated_format(&grabber, requested);
        sink.configure(format);

        let callback = create_frame_callback(Arc::clone(&sink));
        let hr = grabber.set_callback(callback, 1);
        // Drop our owning reference; the grabber add-reffed its own.
        frame_cb_release(callback);
        if hr.is_err() {
            let _ = built.send(Err(CaptureError::SinkInsert(format!(
                "SetCallback failed: {hr:?}"
            ))));
            return;
        }

        let media_control: IMediaControl = match graph.cast() {
            Ok(c) => c,
            Err(e) => {
                let _ = built.send(Err(CaptureError::GraphCreation(format!(
                    "IMediaControl unavailable: {e}"
                ))));
                return;
            }
        };
        let media_event: Option<IMediaEvent> = graph.cast().ok();

        info!(
            "capture graph wired for {} at {}x{}",
            device.name, format.width, format.height
        );
        let _ = built.send(Ok(format));

        // Serve commands; poll the event queue between them so device loss
        // surfaces as an asynchronous fault.
        loop {
            match commands.recv_timeout(Duration::from_millis(100)) {
                Ok(Command::Run(reply)) => {
                    let result = media_control.Run().map_err(|e| {
                        error!("IMediaControl::Run failed: {e}");
                        CaptureError::PipelineFault(format!("Run failed: {e}"))
                    });
                    let _ = reply.send(result);
                }
                Ok(Command::Halt(reply)) => {
                    debug!("halting capture graph for {}", device.name);
                    let result = media_control.Stop().map_err(|e| {
                        warn!("IMediaControl::Stop failed: {e}");
                        CaptureError::PipelineFault(format!("Stop failed: {e}"))
                    });
                    let _ = reply.send(result);
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(ref events) = media_event {
                        poll_media_events(events, &fault);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // handle dropped without halt; best-effort stop
                    let _ = media_control.Stop();
                    break;
                }
            }
        }
        // Filters, grabber and graph release here in reverse declaration
        // order: sink node before graph, COM guard last.
    }
}

/// Drain pending graph events; abort/device-lost become pipeline faults.
unsafe fn poll_media_events(events: &IMediaEvent, fault: &FaultSlot) {
    let mut code = 0i32;
    let mut p1 = 0isize;
    let mut p2 = 0isize;
    while events.GetEvent(&mut code, &mut p1, &mut p2, 0).is_ok() {
        let _ = events.FreeEventParams(code, p1, p2);
        match code {
            EC_ERRORABORT => fault.raise(format!("graph aborted (hr={p1:#x})")),
            EC_DEVICE_LOST => fault.raise("capture device lost".to_string()),
            _ => {}
        }
    }
}

/// Read the connected media type's VIDEOINFOHEADER for the actual frame
/// geometry, falling back to the requested format when unavailable.
unsafe fn negotiated_format(grabber: &SampleGrabber, requested: FrameFormat) -> FrameFormat {
    let mut mt = AmMediaType::default();
    let hr = grabber.get_connected_media_type(&mut mt);

    let format = if hr.is_ok()
        && !mt.pb_format.is_null()
        && mt.cb_format as usize >= std::mem::size_of::<VIDEOINFOHEADER>()
    {
        let vih = &*(mt.pb_format as *const VIDEOINFOHEADER);
        FrameFormat {
            width: vih.bmiHeader.biWidth as u32,
            height: vih.bmiHeader.biHeight.unsigned_abs(),
            pixel: requested.pixel,
        }
    } else {
        warn!("could not query connected media type (hr={hr:?}), assuming request");
        requested
    };

    if !mt.pb_format.is_null() {
        CoTaskMemFree(Some(mt.pb_format as *const core::ffi::c_void));
    }

    format
}

/// Find the DirectShow source filter for a catalog descriptor.
///
/// Matches by device path, falling back to friendly name for virtual
/// cameras enumerated without a DevicePath property.
unsafe fn find_source_filter(device: &DeviceDescriptor) -> Result<IBaseFilter> {
    let dev_enum: ICreateDevEnum =
        CoCreateInstance(&CLSID_SystemDeviceEnum, None, CLSCTX_INPROC_SERVER).map_err(|e| {
            CaptureError::DeviceBind(format!("CoCreateInstance(SystemDeviceEnum) failed: {e}"))
        })?;

    let mut enum_moniker = None;
    dev_enum
        .CreateClassEnumerator(&CLSID_VideoInputDeviceCategory, &mut enum_moniker, 0)
        .map_err(|e| CaptureError::DeviceBind(format!("CreateClassEnumerator failed: {e}")))?;

    let Some(enum_moniker) = enum_moniker else {
        return Err(CaptureError::DeviceBind("no video devices present".into()));
    };

    let wanted_path = device.id.as_str();
    let by_name = wanted_path.strip_prefix("name:");

    let mut moniker_array = [None; 1];
    loop {
        let hr = enum_moniker.Next(&mut moniker_array, None);
        if hr.is_err() {
            break;
        }
        let Some(moniker) = moniker_array[0].take() else {
            break;
        };

        let bag: IPropertyBag = match moniker.BindToStorage(
            None::<&windows::Win32::System::Com::IBindCtx>,
            None::<&IMoniker>,
        ) {
            Ok(b) => b,
            Err(_) => continue,
        };

        let path = read_property_string(&bag, "DevicePath").unwrap_or_default();
        let name = read_property_string(&bag, "FriendlyName").unwrap_or_default();

        let matched = match by_name {
            Some(wanted_name) => path.is_empty() && name == wanted_name,
            None => path == wanted_path,
        };
        if !matched {
            continue;
        }

        return moniker
            .BindToObject(
                None::<&windows::Win32::System::Com::IBindCtx>,
                None::<&IMoniker>,
            )
            .map_err(|e| CaptureError::DeviceBind(format!("BindToObject failed: {e}")));
    }

    Err(CaptureError::DeviceBind(format!(
        "device not found: {}",
        device.id
    )))
}

/// Read a string property from an `IPropertyBag`.
unsafe fn read_property_string(bag: &IPropertyBag, name: &str) -> Option<String> {
    use windows::core::BSTR;

    let prop_name = BSTR::from(name);
    let mut variant = VARIANT::default();

    bag.Read(
        windows::core::PCWSTR(prop_name.as_ptr()),
        &mut variant,
        None,
    )
    .ok()?;

    let bstr_ptr: *const *const u16 = std::ptr::addr_of!(variant).cast::<u8>().add(8).cast();
    let raw_bstr = *bstr_ptr;
    if raw_bstr.is_null() {
        return None;
    }

    let len_ptr = (raw_bstr as *const u8).sub(4) as *const u32;
    let byte_len = *len_ptr;
    let char_len = byte_len as usize / 2;

    let slice = std::slice::from_raw_parts(raw_bstr, char_len);
    Some(String::from_utf16_lossy(slice))
}

/// Find an unconnected pin on a filter by direction.
/// direction: 0 = PINDIR_INPUT, 1 = PINDIR_OUTPUT
unsafe fn find_unconnected_pin(filter: &IBaseFilter, direction: i32) -> Result<IPin> {
    let pin_enum = filter
        .EnumPins()
        .map_err(|e| CaptureError::Connection(format!("EnumPins failed: {e}")))?;

    let mut pin_array = [None; 1];
    loop {
        let hr = pin_enum.Next(&mut pin_array, None);
        if hr.is_err() {
            break;
        }

        let Some(pin) = pin_array[0].take() else {
            break;
        };

        let dir = match pin.QueryDirection() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if dir.0 != direction {
            continue;
        }

        // connected pins are skipped
        match pin.ConnectedTo() {
            Ok(_) => continue,
            Err(_) => return Ok(pin),
        }
    }

    Err(CaptureError::Connection(format!(
        "no unconnected pin with direction {direction}"
    )))
}
