use crate::capture::{CaptureLoop, GifSource};
use anyhow::Result;
use image::{imageops, Rgb, RgbImage};
use std::path::Path;

/// Fallback when no usable background is configured
pub const GREEN_SCREEN: Rgb<u8> = Rgb([0, 255, 0]);

/// Replacement background, always delivered at output size
pub enum Background {
    Static(RgbImage),
    Animated {
        capture: CaptureLoop,
        last_seen: u64,
        raw: RgbImage,
        current: RgbImage,
    },
}

impl Background {
    pub fn solid(width: u32, height: u32, color: Rgb<u8>) -> Self {
        Self::Static(RgbImage::from_pixel(width, height, color))
    }

    /// Load a still image or an animated GIF, falling back to green
    pub fn load(path: Option<&Path>, width: u32, height: u32) -> Self {
        let Some(path) = path else {
            return Self::solid(width, height, GREEN_SCREEN);
        };

        match Self::open(path, width, height) {
            Ok(background) => background,
            Err(e) => {
                tracing::warn!(
                    "Could not load background {}: {:#}, defaulting to green",
                    path.display(),
                    e
                );
                Self::solid(width, height, GREEN_SCREEN)
            }
        }
    }

    fn open(path: &Path, width: u32, height: u32) -> Result<Self> {
        let is_gif = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"));

        if is_gif {
            let owned = path.to_path_buf();
            let (capture, _) = CaptureLoop::spawn("background", move || GifSource::open(owned))?;
            tracing::info!("Animated background from {}", path.display());
            return Ok(Self::Animated {
                capture,
                last_seen: 0,
                raw: RgbImage::new(0, 0),
                current: RgbImage::from_pixel(width, height, GREEN_SCREEN),
            });
        }

        let image = image::open(path)?.to_rgb8();
        tracing::info!("Static background from {}", path.display());
        Ok(Self::Static(fit(image, width, height)))
    }

    /// Background for the next output frame
    pub fn sample(&mut self) -> &RgbImage {
        match self {
            Self::Static(image) => image,
            Self::Animated {
                capture,
                last_seen,
                raw,
                current,
            } => {
                if capture.exchange().try_advance(last_seen, raw) {
                    let (width, height) = current.dimensions();
                    *current = if raw.dimensions() == (width, height) {
                        raw.clone()
                    } else {
                        imageops::resize(&*raw, width, height, imageops::FilterType::Triangle)
                    };
                }
                current
            }
        }
    }

    /// Stop the background capture thread, if any
    pub fn stop(self) -> Result<()> {
        match self {
            Self::Static(_) => Ok(()),
            Self::Animated { capture, .. } => capture.stop(),
        }
    }
}

fn fit(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, imageops::FilterType::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame, Rgba, RgbaImage};
    use std::fs::File;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Sample until `pred` holds for the top-left pixel or two seconds pass
    fn sample_until(bg: &mut Background, pred: impl Fn(&Rgb<u8>) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pred(bg.sample().get_pixel(0, 0)) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_static_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beach.png");
        RgbImage::from_pixel(5, 5, Rgb([10, 20, 30])).save(&path).unwrap();

        let mut bg = Background::load(Some(&path), 20, 10);
        assert!(matches!(bg, Background::Static(_)));
        let sample = bg.sample();
        assert_eq!(sample.dimensions(), (20, 10));
        assert_eq!(sample.get_pixel(10, 5).0, [10, 20, 30]);
        bg.stop().unwrap();
    }

    #[test]
    fn test_animated_gif_file_plays_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.GIF");
        {
            let mut encoder = GifEncoder::new(File::create(&path).unwrap());
            let frames = [Rgba([255, 0, 0, 255]), Rgba([0, 0, 255, 255])].map(|color| {
                Frame::from_parts(
                    RgbaImage::from_pixel(6, 4, color),
                    0,
                    0,
                    Delay::from_numer_denom_ms(20, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }

        let mut bg = Background::load(Some(&path), 12, 8);
        assert!(matches!(bg, Background::Animated { .. }));
        assert_eq!(bg.sample().dimensions(), (12, 8));

        assert!(sample_until(&mut bg, |p| p.0[0] > 200 && p.0[1] < 50));
        assert!(sample_until(&mut bg, |p| p.0[2] > 200 && p.0[1] < 50));
        assert_eq!(bg.sample().dimensions(), (12, 8));
        bg.stop().unwrap();
    }

    #[test]
    fn test_undecodable_gif_is_green() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.gif");
        std::fs::write(&path, b"GIF89a but not really").unwrap();

        let mut bg = Background::load(Some(&path), 4, 4);
        assert!(matches!(bg, Background::Static(_)));
        assert!(bg.sample().pixels().all(|p| *p == GREEN_SCREEN));
    }

    #[test]
    fn test_missing_background_is_green() {
        let mut bg = Background::load(Some(Path::new("/nonexistent/beach.png")), 16, 8);
        let sample = bg.sample();
        assert_eq!(sample.dimensions(), (16, 8));
        assert!(sample.pixels().all(|p| *p == GREEN_SCREEN));
    }

    #[test]
    fn test_no_background_is_green() {
        let mut bg = Background::load(None, 4, 4);
        assert!(bg.sample().pixels().all(|p| *p == GREEN_SCREEN));
        bg.stop().unwrap();
    }

    #[test]
    fn test_static_image_is_resized() {
        let image = fit(RgbImage::from_pixel(3, 3, Rgb([9, 9, 9])), 12, 6);
        assert_eq!(image.dimensions(), (12, 6));
        assert_eq!(image.get_pixel(5, 3).0, [9, 9, 9]);
    }
}
