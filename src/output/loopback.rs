use super::yuv::PixelFormat;
use super::OutputSink;
use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use v4l::format::Format;
use v4l::video::Output;
use v4l::{Device, FourCC};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("sink accepted no bytes with {remaining} left to write")]
    SinkClosed { remaining: usize },

    #[error("write to sink failed: {0}")]
    Io(#[from] io::Error),
}

/// Write all of `buf`, tolerating short writes
///
/// A write that accepts nothing or fails is fatal; nothing is retried.
pub fn write_fully<W: Write>(sink: &mut W, mut buf: &[u8]) -> Result<(), OutputError> {
    while !buf.is_empty() {
        match sink.write(buf)? {
            0 => return Err(OutputError::SinkClosed { remaining: buf.len() }),
            written => buf = &buf[written..],
        }
    }
    Ok(())
}

pub struct V4L2Output {
    // Keeps the negotiated format alive while we write
    _device: Device,
    file: File,
    width: u32,
    height: u32,
    format: PixelFormat,
    buffer: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(
        device_path: P,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{} {:?})",
            path.display(),
            width,
            height,
            format
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        let requested = Format::new(width, height, FourCC::new(format.fourcc()));
        let actual = Output::set_format(&device, &requested)
            .context("Failed to set v4l2loopback output format")?;
        if actual.width != width || actual.height != height || actual.fourcc != requested.fourcc {
            bail!(
                "v4l2loopback device negotiated {}x{} {}, wanted {}x{} {}",
                actual.width,
                actual.height,
                actual.fourcc,
                width,
                height,
                requested.fourcc
            );
        }

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            _device: device,
            file,
            width,
            height,
            format,
            buffer: Vec::with_capacity(format.frame_size(width, height)),
        })
    }
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let _span = tracing::debug_span!("output").entered();

        if frame.dimensions() != (self.width, self.height) {
            let resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            self.format.convert(&resized, &mut self.buffer);
        } else {
            self.format.convert(frame, &mut self.buffer);
        }

        write_fully(&mut self.file, &self.buffer)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
