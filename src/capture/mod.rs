mod capture_loop;
mod exchange;
mod gif_source;
mod v4l_capture;

pub use capture_loop::{CaptureLoop, StreamInfo};
pub use exchange::FrameExchange;
pub use gif_source::GifSource;
pub use v4l_capture::WebcamCapture;

use anyhow::Result;
use image::RgbImage;

/// Trait for frame sources driven by a `CaptureLoop`
pub trait CaptureSource {
    /// Block until the next frame is available and return it
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);

    /// Nominal frames per second
    fn frame_rate(&self) -> u32;
}
