use anyhow::{bail, Result};
use image::{imageops, GrayImage, RgbImage};

/// How the mask combines camera and background pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BlendMode {
    /// Any non-zero mask value shows the background
    HardCut,
    /// Mask value is the background weight, 0..=255
    SoftAlpha,
}

/// Output mirroring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mirror {
    pub horizontal: bool,
    pub vertical: bool,
}

pub struct Compositor {
    mode: BlendMode,
    mirror: Mirror,
}

impl Compositor {
    pub fn new(mode: BlendMode, mirror: Mirror) -> Self {
        Self { mode, mirror }
    }

    /// Blend `background` into `raw` through `mask`, in place
    pub fn compose(&self, raw: &mut RgbImage, background: &RgbImage, mask: &GrayImage) -> Result<()> {
        let _span = tracing::debug_span!("composite").entered();

        if raw.dimensions() != background.dimensions() || raw.dimensions() != mask.dimensions() {
            bail!(
                "Frame {:?}, background {:?} and mask {:?} differ in size",
                raw.dimensions(),
                background.dimensions(),
                mask.dimensions()
            );
        }

        let pixels = raw.pixels_mut().zip(background.pixels()).zip(mask.pixels());
        match self.mode {
            BlendMode::HardCut => {
                for ((out, bg), m) in pixels {
                    if m.0[0] != 0 {
                        *out = *bg;
                    }
                }
            }
            BlendMode::SoftAlpha => {
                for ((out, bg), m) in pixels {
                    let alpha = 1.0 - m.0[0] as f32 / 255.0;
                    for (o, b) in out.0.iter_mut().zip(bg.0) {
                        *o = (*o as f32 * alpha + b as f32 * (1.0 - alpha)).round() as u8;
                    }
                }
            }
        }

        match (self.mirror.horizontal, self.mirror.vertical) {
            (true, true) => imageops::rotate180_in_place(raw),
            (true, false) => imageops::flip_horizontal_in_place(raw),
            (false, true) => imageops::flip_vertical_in_place(raw),
            (false, false) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    const RAW: Rgb<u8> = Rgb([200, 100, 50]);
    const BG: Rgb<u8> = Rgb([0, 255, 0]);

    fn half_mask() -> GrayImage {
        // Left column keeps the camera, right column is background
        GrayImage::from_fn(2, 2, |x, _| Luma([if x == 0 { 0 } else { 255 }]))
    }

    #[test]
    fn test_hard_cut() {
        let mut raw = RgbImage::from_pixel(2, 2, RAW);
        let bg = RgbImage::from_pixel(2, 2, BG);
        let mut mask = half_mask();
        mask.put_pixel(0, 1, Luma([3]));

        Compositor::new(BlendMode::HardCut, Mirror::default())
            .compose(&mut raw, &bg, &mask)
            .unwrap();

        assert_eq!(*raw.get_pixel(0, 0), RAW);
        assert_eq!(*raw.get_pixel(1, 0), BG);
        assert_eq!(*raw.get_pixel(0, 1), BG);
    }

    #[test]
    fn test_soft_alpha() {
        let mut raw = RgbImage::from_pixel(2, 1, Rgb([200, 0, 100]));
        let bg = RgbImage::from_pixel(2, 1, Rgb([0, 200, 100]));
        let mask = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 0 } else { 51 }]));

        Compositor::new(BlendMode::SoftAlpha, Mirror::default())
            .compose(&mut raw, &bg, &mask)
            .unwrap();

        assert_eq!(raw.get_pixel(0, 0).0, [200, 0, 100]);
        // 20% background
        assert_eq!(raw.get_pixel(1, 0).0, [160, 40, 100]);
    }

    #[test]
    fn test_mirroring() {
        let bg = RgbImage::from_pixel(2, 2, BG);
        let mask = half_mask();

        let mirrored = |horizontal, vertical| {
            let mut raw = RgbImage::from_pixel(2, 2, RAW);
            raw.put_pixel(0, 1, Rgb([1, 1, 1]));
            Compositor::new(BlendMode::HardCut, Mirror { horizontal, vertical })
                .compose(&mut raw, &bg, &mask)
                .unwrap();
            raw
        };

        let h = mirrored(true, false);
        assert_eq!(*h.get_pixel(1, 0), RAW);
        assert_eq!(*h.get_pixel(0, 0), BG);
        assert_eq!(h.get_pixel(1, 1).0, [1, 1, 1]);

        let v = mirrored(false, true);
        assert_eq!(v.get_pixel(0, 0).0, [1, 1, 1]);
        assert_eq!(*v.get_pixel(0, 1), RAW);

        let both = mirrored(true, true);
        assert_eq!(both.get_pixel(1, 0).0, [1, 1, 1]);
        assert_eq!(*both.get_pixel(1, 1), RAW);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut raw = RgbImage::new(2, 2);
        let bg = RgbImage::new(3, 2);
        let compositor = Compositor::new(BlendMode::HardCut, Mirror::default());
        assert!(compositor.compose(&mut raw, &bg, &half_mask()).is_err());
    }
}
