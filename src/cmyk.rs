//! CMYK print simulation.
//!
//! The simple mode is a per-pixel RGB -> CMYK -> RGB round trip that darkens
//! colors the way a subtractive press would. It is deliberately not an ICC
//! transform; the accurate mode is an extension point that currently falls
//! back to unmodified RGB.

use std::path::Path;

use image::RgbaImage;
use log::warn;
use rayon::prelude::*;

/// RGB -> CMYK, components returned as percentages (0..=100).
pub fn rgb_to_cmyk(r: u8, g: u8, b: u8) -> [f32; 4] {
    let rf = r as f32 / 255.0;
    let gf = g as f32 / 255.0;
    let bf = b as f32 / 255.0;
    let k = 1.0 - rf.max(gf).max(bf);
    if k >= 1.0 {
        return [0.0, 0.0, 0.0, 100.0];
    }
    let c = (1.0 - rf - k) / (1.0 - k);
    let m = (1.0 - gf - k) / (1.0 - k);
    let y = (1.0 - bf - k) / (1.0 - k);
    [c * 100.0, m * 100.0, y * 100.0, k * 100.0]
}

fn simulate_pixel(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let [c, m, y, k] = rgb_to_cmyk(r, g, b);
    let (c, m, y, k) = (c / 100.0, m / 100.0, y / 100.0, k / 100.0);
    let r2 = (r as f32 * (1.0 - c) * (1.0 - k)).round() as u8;
    let g2 = (g as f32 * (1.0 - m) * (1.0 - k)).round() as u8;
    let b2 = (b as f32 * (1.0 - y) * (1.0 - k)).round() as u8;
    (r2, g2, b2)
}

/// Applies the simple CMYK simulation to `image` in place. The buffer is
/// mutated destructively; there is no way to undo the pass short of
/// re-rendering the page.
pub fn simulate_print_colors(image: &mut RgbaImage) {
    image
        .par_chunks_exact_mut(4)
        .for_each(|px| {
            let (r, g, b) = simulate_pixel(px[0], px[1], px[2]);
            px[0] = r;
            px[1] = g;
            px[2] = b;
        });
}

/// Accurate-mode hook. A real profile-based transform is not implemented;
/// this validates the configured profile, logs a non-fatal warning, and
/// leaves the raster as RGB so the export is never blocked.
pub fn apply_accurate_profile(image: &mut RgbaImage, profile_path: Option<&Path>) {
    let _ = image;
    match profile_path {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => warn!(
                "ICC profile {} loaded ({} bytes) but accurate CMYK conversion \
                 is not implemented; exporting unmodified RGB",
                path.display(),
                bytes.len()
            ),
            Err(err) => warn!(
                "failed to load ICC profile {}: {err}; exporting unmodified RGB",
                path.display()
            ),
        },
        None => warn!("no ICC profile configured for accurate CMYK; exporting unmodified RGB"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn black_is_pure_key() {
        assert_eq!(rgb_to_cmyk(0, 0, 0), [0.0, 0.0, 0.0, 100.0]);
    }

    #[test]
    fn white_is_no_ink() {
        assert_eq!(rgb_to_cmyk(255, 255, 255), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn white_survives_the_round_trip() {
        let mut img = RgbaImage::from_pixel(3, 3, Rgba([255, 255, 255, 255]));
        simulate_print_colors(&mut img);
        assert!(img.pixels().all(|p| p.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn black_stays_black() {
        let mut img = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        simulate_print_colors(&mut img);
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn midtones_darken() {
        // r=g=b=128: no chromatic ink, k = 1 - 128/255, so each channel
        // becomes round(128 * 128/255) = 64.
        let mut img = RgbaImage::from_pixel(1, 1, Rgba([128, 128, 128, 255]));
        simulate_print_colors(&mut img);
        assert_eq!(img.get_pixel(0, 0).0, [64, 64, 64, 255]);
    }

    #[test]
    fn alpha_is_untouched() {
        let mut img = RgbaImage::from_pixel(1, 1, Rgba([200, 50, 50, 77]));
        simulate_print_colors(&mut img);
        assert_eq!(img.get_pixel(0, 0).0[3], 77);
    }

    #[test]
    fn accurate_fallback_never_mutates() {
        let mut img = RgbaImage::from_pixel(2, 2, Rgba([13, 37, 42, 255]));
        let before = img.clone();
        apply_accurate_profile(&mut img, None);
        apply_accurate_profile(&mut img, Some(Path::new("/nonexistent/profile.icc")));
        assert_eq!(img, before);
    }
}
