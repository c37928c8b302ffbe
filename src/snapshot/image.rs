use chrono::Local;

use crate::capture::sink::{Frame, FrameFormat};

/// Background colour of the synthetic pattern (light blue).
const PATTERN_BACKGROUND: [u8; 3] = [173, 216, 230];
/// Overlay text colour.
const PATTERN_INK: [u8; 3] = [32, 32, 32];
/// Pixel scale applied to the 5x7 glyphs.
const GLYPH_SCALE: u32 = 4;

/// A decoded still image derived from a captured frame.
///
/// Always a deep copy: its lifetime is independent of the frame (and the
/// latest-frame slot) it came from. Pixels are packed RGB24, row-major,
/// top-down.
pub struct SnapshotImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    timestamp_us: u64,
    synthetic: bool,
}

impl SnapshotImage {
    /// Deep-copy a delivered frame into an independent image.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            width: frame.format.width,
            height: frame.format.height,
            pixels: frame.data.clone(),
            timestamp_us: frame.timestamp_us,
            synthetic: false,
        }
    }

    /// Cold-start fallback: a light-blue field with the current wall-clock
    /// time overlaid, in the negotiated dimensions.
    ///
    /// Returned only before the first real frame arrives; callers can branch
    /// on `is_synthetic` to tell the two apart.
    pub fn test_pattern(format: FrameFormat) -> Self {
        let text = Local::now().format("%H:%M:%S").to_string();
        Self::render_pattern(format, &text)
    }

    /// Render the synthetic pattern with a fixed overlay text.
    pub fn render_pattern(format: FrameFormat, text: &str) -> Self {
        let width = format.width;
        let height = format.height;
        let mut pixels = Vec::with_capacity(format.byte_len());
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&PATTERN_BACKGROUND);
        }

        let mut x = 10u32;
        for ch in text.chars() {
            if let Some(glyph) = glyph_for(ch) {
                draw_glyph(&mut pixels, width, height, x, 10, glyph);
            }
            x += (GLYPH_WIDTH + 1) * GLYPH_SCALE;
        }

        Self {
            width,
            height,
            pixels,
            timestamp_us: 0,
            synthetic: true,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB24 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Delivery timestamp of the source frame; zero for synthetic images.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// True when this image is the cold-start pattern, not a real frame.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

const GLYPH_WIDTH: u32 = 5;

/// 5x7 bitmap rows, bit 4 leftmost.
type Glyph = [u8; 7];

const GLYPH_DIGITS: [Glyph; 10] = [
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E], // 0
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E], // 1
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F], // 2
    [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E], // 3
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02], // 4
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E], // 5
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E], // 6
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08], // 7
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E], // 8
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C], // 9
];

const GLYPH_COLON: Glyph = [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00];

fn glyph_for(ch: char) -> Option<&'static Glyph> {
    match ch {
        '0'..='9' => GLYPH_DIGITS.get(ch as usize - '0' as usize),
        ':' => Some(&GLYPH_COLON),
        _ => None,
    }
}

/// Stamp one scaled glyph into the pixel grid, clipping at the edges.
fn draw_glyph(pixels: &mut [u8], width: u32, height: u32, x0: u32, y0: u32, glyph: &Glyph) {
    for (row, bits) in glyph.iter().enumerate() {
        for col in 0..GLYPH_WIDTH {
            if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                continue;
            }
            for dy in 0..GLYPH_SCALE {
                for dx in 0..GLYPH_SCALE {
                    let x = x0 + col * GLYPH_SCALE + dx;
                    let y = y0 + row as u32 * GLYPH_SCALE + dy;
                    if x >= width || y >= height {
                        continue;
                    }
                    let idx = (y as usize * width as usize + x as usize) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&PATTERN_INK);
                }
            }
        }
    }
}
