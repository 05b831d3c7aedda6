use super::CaptureSource;
use anyhow::{bail, Context, Result};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, RgbImage};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Delay used for frames that declare none
const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// Looping animated GIF played back at its own frame delays
pub struct GifSource {
    frames: Vec<(RgbImage, Duration)>,
    next: usize,
}

impl GifSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to decode {}", path.display()))
    }

    pub fn from_reader<R: BufRead + Seek>(reader: R) -> Result<Self> {
        let decoder = GifDecoder::new(reader)?;
        let frames: Vec<_> = decoder
            .into_frames()
            .collect_frames()?
            .into_iter()
            .map(|frame| {
                let delay = Duration::from(frame.delay());
                let delay = if delay.is_zero() { DEFAULT_DELAY } else { delay };
                (DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8(), delay)
            })
            .collect();

        if frames.is_empty() {
            bail!("animation has no frames");
        }

        Ok(Self { frames, next: 0 })
    }
}

impl CaptureSource for GifSource {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let (frame, delay) = &self.frames[self.next];
        thread::sleep(*delay);
        self.next = (self.next + 1) % self.frames.len();
        Ok(frame.clone())
    }

    fn resolution(&self) -> (u32, u32) {
        self.frames[0].0.dimensions()
    }

    fn frame_rate(&self) -> u32 {
        let total: Duration = self.frames.iter().map(|(_, d)| *d).sum();
        let average = total.as_secs_f64() / self.frames.len() as f64;
        (1.0 / average).round().max(1.0) as u32
    }
}
