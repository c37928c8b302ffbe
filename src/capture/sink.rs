use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::diagnostics::stats::{DeliverySnapshot, DeliveryStats};

/// Pixel layout of delivered frames.
///
/// The pipeline negotiates uncompressed 24-bit RGB with fixed-size samples
/// and no temporal compression; other layouts never reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
        }
    }
}

/// Negotiated frame geometry and pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel: PixelFormat,
}

impl FrameFormat {
    /// 640x480 RGB24 — the default contract requested from the source.
    pub fn vga() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel: PixelFormat::Rgb24,
        }
    }

    /// Byte length of one fixed-size sample in this format.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel.bytes_per_pixel()
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::vga()
    }
}

/// A single captured frame.
///
/// The bytes are copied out of the platform-owned buffer inside the delivery
/// callback, so the platform may reuse or free its buffer the moment the
/// callback returns.
pub struct Frame {
    pub data: Vec<u8>,
    pub format: FrameFormat,
    /// Delivery timestamp in microseconds of stream time.
    pub timestamp_us: u64,
}

/// Cross-thread bridge between the pipeline's delivery thread and readers.
///
/// A single-slot, overwrite-on-write latest-frame store: no queueing, no
/// backpressure. Only the most recent frame matters for stills, so older
/// frames are lost on purpose. The write side runs on the platform's
/// delivery thread and must not block — when a reader holds the slot lock,
/// the incoming frame is dropped instead of waiting. Readers only hold the
/// lock long enough to clone an `Arc`, never while copying pixels.
pub struct FrameSink {
    latest: Mutex<Option<Arc<Frame>>>,
    format: Mutex<FrameFormat>,
    /// Gate flipped by the session; frames delivered while no session is
    /// Running are discarded, never buffered.
    accepting: AtomicBool,
    /// Monotonic counter incremented on each accepted frame. Usable for
    /// staleness checks even when device timestamps are unreliable.
    sequence: AtomicU64,
    stats: Mutex<DeliveryStats>,
}

impl FrameSink {
    /// Create a sink with the default VGA format and a closed gate.
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            format: Mutex::new(FrameFormat::vga()),
            accepting: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            stats: Mutex::new(DeliveryStats::new()),
        }
    }

    /// Record the negotiated format. Called by the pipeline builder once the
    /// connected media type is known, before delivery begins.
    pub fn configure(&self, format: FrameFormat) {
        *self.format.lock() = format;
    }

    /// The format deliveries are validated against.
    pub fn format(&self) -> FrameFormat {
        *self.format.lock()
    }

    /// Raw-buffer delivery entry point, invoked by the pipeline's own
    /// delivery thread for every captured frame.
    ///
    /// Never blocks and performs no UI work; the only allocation is the one
    /// frame-sized copy required to detach from the platform buffer.
    pub fn on_buffer(&self, timestamp_us: u64, bytes: &[u8]) {
        if !self.accepting.load(Ordering::Relaxed) {
            return;
        }

        let format = self.format();
        let expected = format.byte_len();
        if bytes.len() < expected {
            warn!(
                "frame size mismatch: got {} bytes, expected {expected} ({}x{})",
                bytes.len(),
                format.width,
                format.height
            );
            self.stats.lock().record_drop();
            return;
        }

        let frame = Arc::new(Frame {
            data: bytes[..expected].to_vec(),
            format,
            timestamp_us,
        });

        // try_lock keeps the delivery thread non-blocking: a reader holding
        // the slot costs us this frame, not a stall.
        match self.latest.try_lock() {
            Some(mut slot) => {
                *slot = Some(frame);
                drop(slot);
                self.sequence.fetch_add(1, Ordering::Release);
                self.stats.lock().record_frame(expected);
            }
            None => {
                trace!("latest-frame slot contended, dropping frame");
                self.stats.lock().record_drop();
            }
        }
    }

    /// Structured-sample delivery entry point.
    ///
    /// Pass-through: raw-buffer delivery is authoritative in this design, so
    /// decoded samples are acknowledged and ignored.
    pub fn on_sample(&self, timestamp_us: u64) {
        trace!("ignoring structured sample at {timestamp_us}us");
    }

    /// The most recently accepted frame, shared without re-copying pixels.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.lock().clone()
    }

    /// Monotonic accepted-frame counter.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Open or close the delivery gate.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Snapshot of delivery counters.
    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.lock().snapshot()
    }
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_format() -> FrameFormat {
        FrameFormat {
            width: 4,
            height: 2,
            pixel: PixelFormat::Rgb24,
        }
    }

    fn open_sink(format: FrameFormat) -> FrameSink {
        let sink = FrameSink::new();
        sink.configure(format);
        sink.set_accepting(true);
        sink
    }

    #[test]
    fn vga_format_byte_len() {
        assert_eq!(FrameFormat::vga().byte_len(), 640 * 480 * 3);
    }

    #[test]
    fn latest_is_none_before_any_delivery() {
        let sink = open_sink(small_format());
        assert!(sink.latest().is_none());
        assert_eq!(sink.sequence(), 0);
    }

    #[test]
    fn on_buffer_stores_latest_frame() {
        let sink = open_sink(small_format());
        sink.on_buffer(1000, &[7u8; 24]);

        let frame = sink.latest().unwrap();
        assert_eq!(frame.data, vec![7u8; 24]);
        assert_eq!(frame.timestamp_us, 1000);
        assert_eq!(sink.sequence(), 1);
    }

    #[test]
    fn newer_frame_overwrites_older() {
        let sink = open_sink(small_format());
        sink.on_buffer(1000, &[1u8; 24]);
        sink.on_buffer(2000, &[2u8; 24]);

        let frame = sink.latest().unwrap();
        assert_eq!(frame.data[0], 2);
        assert_eq!(frame.timestamp_us, 2000);
        assert_eq!(sink.sequence(), 2);
    }

    #[test]
    fn closed_gate_discards_frames() {
        let sink = FrameSink::new();
        sink.configure(small_format());
        // gate stays closed
        sink.on_buffer(1000, &[1u8; 24]);
        assert!(sink.latest().is_none());
        assert_eq!(sink.sequence(), 0);
    }

    #[test]
    fn undersized_buffer_is_dropped_and_counted() {
        let sink = open_sink(small_format());
        sink.on_buffer(1000, &[1u8; 10]);
        assert!(sink.latest().is_none());
        assert_eq!(sink.stats().drop_count, 1);
    }

    #[test]
    fn oversized_buffer_is_truncated_to_sample_size() {
        let sink = open_sink(small_format());
        sink.on_buffer(1000, &[9u8; 64]);
        let frame = sink.latest().unwrap();
        assert_eq!(frame.data.len(), 24);
    }

    #[test]
    fn on_sample_is_a_no_op() {
        let sink = open_sink(small_format());
        sink.on_sample(1234);
        assert!(sink.latest().is_none());
        assert_eq!(sink.sequence(), 0);
    }

    #[test]
    fn latest_returns_shared_arc_not_copy() {
        let sink = open_sink(small_format());
        sink.on_buffer(1000, &[3u8; 24]);

        let a = sink.latest().unwrap();
        let b = sink.latest().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn sink_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameSink>();
    }

    #[test]
    fn concurrent_writer_and_readers_never_tear_frames() {
        let format = FrameFormat {
            width: 32,
            height: 32,
            pixel: PixelFormat::Rgb24,
        };
        let sink = Arc::new(open_sink(format));
        let len = format.byte_len();

        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 0..500u32 {
                    // uniform fill per frame so tearing is detectable
                    sink.on_buffer(u64::from(i), &vec![(i % 256) as u8; len]);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(frame) = sink.latest() {
                            let first = frame.data[0];
                            assert!(
                                frame.data.iter().all(|&b| b == first),
                                "torn frame observed"
                            );
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        let stats = sink.stats();
        assert_eq!(stats.frame_count + stats.drop_count, 500);
    }
}
