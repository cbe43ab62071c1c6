//! Display enumeration and capture through Quartz Display Services.

use core_foundation::data::CFData;
use core_graphics::display::CGDisplay;
use tracing::warn;

/// A captured display image as tightly packed 8-bit RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 3` bytes, row-major.
    pub pixels: Vec<u8>,
}

/// IDs of the active displays in system order.
#[must_use]
pub fn active_displays() -> Vec<u32> {
    match CGDisplay::active_displays() {
        Ok(ids) => ids,
        Err(code) => {
            warn!(code, "Failed to enumerate displays");
            Vec::new()
        }
    }
}

/// Capture the current contents of `display`.
///
/// Returns `None` when the system refuses the capture or the image uses a
/// pixel layout other than 32-bit BGRA.
#[must_use]
pub fn capture_display(display: u32) -> Option<RgbFrame> {
    let image = CGDisplay::new(display).image()?;
    if image.bits_per_pixel() != 32 {
        warn!(display, bpp = image.bits_per_pixel(), "Unsupported pixel layout");
        return None;
    }

    let width = image.width();
    let height = image.height();
    let data: CFData = image.data();
    let pixels = bgra_to_rgb(data.bytes(), width, height, image.bytes_per_row())?;

    Some(RgbFrame {
        width: u32::try_from(width).ok()?,
        height: u32::try_from(height).ok()?,
        pixels,
    })
}

/// Repack padded BGRA rows into RGB.
fn bgra_to_rgb(bytes: &[u8], width: usize, height: usize, stride: usize) -> Option<Vec<u8>> {
    if width == 0
        || height == 0
        || stride < width * 4
        || bytes.len() < stride * (height - 1) + width * 4
    {
        return None;
    }

    let mut out = Vec::with_capacity(width * height * 3);
    for row in bytes.chunks(stride).take(height) {
        for px in row[..width * 4].chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_to_rgb_skips_row_padding() {
        // 2x2 image with 4 bytes of padding per row.
        let bytes = [
            1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0, //
            7, 8, 9, 255, 10, 11, 12, 255, 0, 0, 0, 0,
        ];
        let rgb = bgra_to_rgb(&bytes, 2, 2, 12).unwrap();
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4, 9, 8, 7, 12, 11, 10]);
    }

    #[test]
    fn test_bgra_to_rgb_rejects_short_buffer() {
        assert!(bgra_to_rgb(&[0; 7], 2, 1, 8).is_none());
        assert!(bgra_to_rgb(&[], 0, 0, 0).is_none());
    }
}
