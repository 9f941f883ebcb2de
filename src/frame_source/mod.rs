//! Frame acquisition and embedding seams
//!
//! ## Responsibilities
//!
//! - Trait seams for camera capture and the embedding model
//! - Photometric frame adjustment (brightness / contrast / focus)
//!
//! Capture and inference are blocking by nature, so both traits are
//! synchronous; the detection loop drives them through `spawn_blocking`
//! to keep slow devices off the async scheduler.

use crate::error::Result;
use crate::models::Frame;

/// Opens capture handles for a source reference (device index, URL, ...)
pub trait FrameSource: Send + Sync {
    /// Open the device. Blocking.
    fn open(&self, source_ref: &str) -> Result<Box<dyn FrameReader>>;
}

/// An open capture handle.
///
/// Implementations must release the underlying device in `Drop`; the
/// detection loop relies on drop-based release so the handle is closed
/// on normal exit, read error, and forced cancellation alike.
pub trait FrameReader: Send {
    /// Read the next frame. Blocking. `Ok(None)` signals end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;
}

/// Opaque embedding model: frame in, fixed-length vector out
pub trait FrameEncoder: Send + Sync {
    /// Embed a frame. Blocking (model inference).
    fn embed(&self, frame: &Frame) -> Result<Vec<f32>>;
}

/// Apply per-pixel photometric adjustments to a frame.
///
/// Contrast scales each channel, brightness shifts it
/// (`p' = contrast * p + (brightness - 1) * 255`, clamped to u8), and a
/// focus value other than 1.0 applies an unsharp sharpen against a 3x3
/// box blur (`p' = (1 + focus) * p - focus * blurred`).
pub fn apply_photometrics(frame: &mut Frame, brightness: f64, contrast: f64, focus: f64) {
    let beta = (brightness - 1.0) * 255.0;
    if contrast != 1.0 || beta != 0.0 {
        for p in frame.pixels.iter_mut() {
            *p = (contrast * f64::from(*p) + beta).clamp(0.0, 255.0) as u8;
        }
    }
    if focus != 1.0 && focus != 0.0 {
        unsharp(frame, focus);
    }
}

fn unsharp(frame: &mut Frame, amount: f64) {
    let w = frame.width as usize;
    let h = frame.height as usize;
    if w == 0 || h == 0 || frame.pixels.len() != w * h * 3 {
        return;
    }
    let blurred = box_blur3(&frame.pixels, w, h);
    for (p, b) in frame.pixels.iter_mut().zip(blurred.iter()) {
        let sharpened = (1.0 + amount) * f64::from(*p) - amount * f64::from(*b);
        *p = sharpened.clamp(0.0, 255.0) as u8;
    }
}

/// 3x3 box blur over RGB8 with edge clamping
fn box_blur3(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut out = vec![0u8; pixels.len()];
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let mut sum = 0u32;
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let ny = (y as i64 + dy).clamp(0, h as i64 - 1) as usize;
                        let nx = (x as i64 + dx).clamp(0, w as i64 - 1) as usize;
                        sum += u32::from(pixels[(ny * w + nx) * 3 + c]);
                    }
                }
                out[(y * w + x) * 3 + c] = (sum / 9) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(level: u8) -> Frame {
        Frame {
            width: 4,
            height: 4,
            pixels: vec![level; 4 * 4 * 3],
        }
    }

    #[test]
    fn test_identity_adjustment_is_noop() {
        let mut frame = gray_frame(100);
        let original = frame.pixels.clone();
        apply_photometrics(&mut frame, 1.0, 1.0, 1.0);
        assert_eq!(frame.pixels, original);
    }

    #[test]
    fn test_brightness_shift() {
        let mut frame = gray_frame(100);
        // brightness 1.2 adds 51 to every channel
        apply_photometrics(&mut frame, 1.2, 1.0, 1.0);
        assert!(frame.pixels.iter().all(|&p| p == 151));
    }

    #[test]
    fn test_contrast_clamps() {
        let mut frame = gray_frame(200);
        apply_photometrics(&mut frame, 1.0, 2.0, 1.0);
        assert!(frame.pixels.iter().all(|&p| p == 255));
    }

    #[test]
    fn test_unsharp_preserves_flat_regions() {
        // A uniform frame blurs to itself, so sharpening changes nothing
        let mut frame = gray_frame(80);
        apply_photometrics(&mut frame, 1.0, 1.0, 2.0);
        assert!(frame.pixels.iter().all(|&p| p == 80));
    }
}
