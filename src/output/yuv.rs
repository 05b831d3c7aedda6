//! RGB to YUV conversion for v4l2loopback sinks.

use image::{Rgb, RgbImage};

/// Pixel formats the virtual camera can be fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PixelFormat {
    /// Planar 4:2:0, Y plane then U then V (I420)
    Yuv420,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            Self::Yuv420 => b"YU12",
            Self::Yuyv => b"YUYV",
        }
    }

    /// Bytes in one frame of this format
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let half_w = w.div_ceil(2);
        match self {
            Self::Yuv420 => w * h + 2 * half_w * h.div_ceil(2),
            Self::Yuyv => half_w * 4 * h,
        }
    }

    /// Convert `frame` into `out`, replacing its contents
    pub fn convert(&self, frame: &RgbImage, out: &mut Vec<u8>) {
        match self {
            Self::Yuv420 => rgb_to_i420(frame, out),
            Self::Yuyv => rgb_to_yuyv(frame, out),
        }
    }
}

/// BT.601 luma with chroma offset to 128, as `[y, u, v]`
fn yuv(Rgb([r, g, b]): Rgb<u8>) -> [u8; 3] {
    let [r, g, b] = [r, g, b].map(f32::from);
    let luma = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.147 * r - 0.289 * g + 0.436 * b;
    let cr = 128.0 + 0.615 * r - 0.515 * g - 0.100 * b;
    [luma, cb, cr].map(|c| c.clamp(0.0, 255.0) as u8)
}

fn mean(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16) / 2) as u8
}

/// Planar 4:2:0, chroma averaged over each 2x2 block
fn rgb_to_i420(frame: &RgbImage, out: &mut Vec<u8>) {
    let (width, height) = frame.dimensions();
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    out.clear();
    out.resize(PixelFormat::Yuv420.frame_size(width, height), 0);
    let (luma, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    let mut u_sum = vec![0u16; cw * ch];
    let mut v_sum = vec![0u16; cw * ch];
    let mut count = vec![0u16; cw * ch];

    for (x, y, pixel) in frame.enumerate_pixels() {
        let [yy, u, v] = yuv(*pixel);
        let (x, y) = (x as usize, y as usize);
        luma[y * w + x] = yy;

        let c = (y / 2) * cw + x / 2;
        u_sum[c] += u as u16;
        v_sum[c] += v as u16;
        count[c] += 1;
    }

    for c in 0..cw * ch {
        u_plane[c] = (u_sum[c] / count[c]) as u8;
        v_plane[c] = (v_sum[c] / count[c]) as u8;
    }
}

/// Packed 4:2:2, chroma averaged over horizontal pixel pairs
fn rgb_to_yuyv(frame: &RgbImage, out: &mut Vec<u8>) {
    let (width, height) = frame.dimensions();
    out.clear();
    out.reserve(PixelFormat::Yuyv.frame_size(width, height));

    let stride = width as usize * 3;
    if stride == 0 {
        return;
    }

    for line in frame.as_raw().chunks_exact(stride) {
        // odd widths end on a lone pixel, which pairs with itself
        for pair in line.chunks(6) {
            let left = yuv(Rgb([pair[0], pair[1], pair[2]]));
            let right = match pair.get(3..6) {
                Some(&[r, g, b]) => yuv(Rgb([r, g, b])),
                _ => left,
            };
            out.extend_from_slice(&[
                left[0],
                mean(left[1], right[1]),
                right[0],
                mean(left[2], right[2]),
            ]);
        }
    }
}
