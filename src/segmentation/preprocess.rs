use super::metadata::Normalization;
use super::roi::RegionOfInterest;
use super::types::{ChannelOrder, ModelTensor, TensorDescriptor};
use anyhow::{bail, Result};
use image::{imageops, RgbImage};

/// Sigma of the optional input blur
const BLUR_SIGMA: f32 = 1.0;

/// Turns captured frames into normalized model input tensors
pub struct Preprocessor {
    roi: RegionOfInterest,
    target_width: u32,
    target_height: u32,
    order: ChannelOrder,
    normalization: Normalization,
    blur: bool,
}

impl Preprocessor {
    pub fn new(
        roi: RegionOfInterest,
        input: &TensorDescriptor,
        order: ChannelOrder,
        normalization: Normalization,
        blur: bool,
    ) -> Result<Self> {
        if input.channels != 3 {
            bail!("Model input must have 3 channels, got {}", input);
        }
        if normalization.std == 0.0 {
            bail!("Normalization std must not be zero");
        }

        Ok(Self {
            roi,
            target_width: input.width as u32,
            target_height: input.height as u32,
            order,
            normalization,
            blur,
        })
    }

    /// Preprocess a frame into a normalized (height, width, 3) tensor
    ///
    /// Steps:
    /// 1. Crop to the region of interest
    /// 2. Resize to the model input size
    /// 3. Optionally blur to suppress sensor noise
    /// 4. Reorder channels and normalize with `(v - mean) / std`
    pub fn prepare(&self, frame: &RgbImage) -> Result<ModelTensor> {
        let _span = tracing::debug_span!("preprocess").entered();

        let roi = self.roi;
        if roi.x + roi.width > frame.width() || roi.y + roi.height > frame.height() {
            bail!(
                "Frame {}x{} does not contain region of interest {:?}",
                frame.width(),
                frame.height(),
                roi
            );
        }

        let cropped = imageops::crop_imm(frame, roi.x, roi.y, roi.width, roi.height).to_image();
        let resized = if cropped.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                &cropped,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            cropped
        };
        let resized = if self.blur {
            imageops::blur(&resized, BLUR_SIGMA)
        } else {
            resized
        };

        let Normalization { mean, std } = self.normalization;
        let (width, height) = resized.dimensions();
        let mut tensor = ModelTensor::zeros((height as usize, width as usize, 3));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let ordered = match self.order {
                ChannelOrder::Rgb => [r, g, b],
                ChannelOrder::Bgr => [b, g, r],
            };
            for (c, v) in ordered.into_iter().enumerate() {
                tensor[[y as usize, x as usize, c]] = (v as f32 - mean) / std;
            }
        }

        Ok(tensor)
    }
}
