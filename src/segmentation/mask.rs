//! Mask derivation from raw model output.
//!
//! Output tensors are classified per pixel (0 = person, 255 = background),
//! folded into a persistent model-resolution buffer with an integer decay,
//! denoised, and projected into the region of interest of the full-size mask.

use super::roi::RegionOfInterest;
use super::types::{ElementType, ModelFamily, ModelTensor, TensorDescriptor};
use image::{imageops, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use ndarray::{ArrayView1, Axis};
use thiserror::Error;

pub const FOREGROUND: u8 = 0;
pub const BACKGROUND: u8 = 255;

/// Single-channel probability at or above which a pixel is background
pub const THRESHOLD_CUTOFF: f32 = 0.65;

/// Bits of the newest hard decision kept by the temporal filter
const SMOOTHING_MASK: u8 = 0xE0;
const SMOOTHING_SHIFT: u32 = 3;

/// 5x5 structuring element
const DENOISE_RADIUS: u8 = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MaskError {
    #[error("model output must be f32, got {0}")]
    ElementType(TensorDescriptor),

    #[error("{family:?} models need {expected} output channels, got {actual}")]
    Channels {
        family: ModelFamily,
        expected: usize,
        actual: usize,
    },

    #[error("multi-class model has no \"person\" label")]
    NoPersonClass,

    #[error("output tensor is {actual:?}, expected {expected:?}")]
    Shape {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MaskConfig {
    pub family: ModelFamily,
    /// Class index treated as foreground by `ClassArgmax`
    pub person_index: Option<usize>,
    /// Number of labels a `ClassArgmax` model scores
    pub class_count: usize,
    pub denoise: bool,
}

/// Per-frame mask state
pub struct MaskEngine {
    family: ModelFamily,
    person_index: usize,
    output: TensorDescriptor,
    roi: RegionOfInterest,
    denoise: bool,
    /// Temporally smoothed decisions at model resolution
    smoothed: GrayImage,
    /// Full-frame mask handed to the compositor
    mask: GrayImage,
}

impl MaskEngine {
    pub fn new(
        config: MaskConfig,
        output: TensorDescriptor,
        roi: RegionOfInterest,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self, MaskError> {
        if output.element != ElementType::F32 {
            return Err(MaskError::ElementType(output));
        }

        let expected = match config.family {
            ModelFamily::ClassArgmax => Some(config.class_count),
            family => family.required_channels(),
        };
        if let Some(expected) = expected {
            if output.channels != expected {
                return Err(MaskError::Channels {
                    family: config.family,
                    expected,
                    actual: output.channels,
                });
            }
        }

        let person_index = match config.family {
            ModelFamily::ClassArgmax => config
                .person_index
                .filter(|i| *i < output.channels)
                .ok_or(MaskError::NoPersonClass)?,
            _ => 0,
        };

        if config.family == ModelFamily::Unknown {
            tracing::warn!("Unrecognized model family, the mask will stay unsegmented");
        }

        Ok(Self {
            family: config.family,
            person_index,
            output,
            roi,
            denoise: config.denoise,
            smoothed: GrayImage::from_pixel(
                output.width as u32,
                output.height as u32,
                Luma([BACKGROUND]),
            ),
            mask: GrayImage::from_pixel(frame_width, frame_height, Luma([BACKGROUND])),
        })
    }

    /// Fold one model output into the mask and return the updated mask
    pub fn update(&mut self, output: &ModelTensor) -> Result<&GrayImage, MaskError> {
        let _span = tracing::debug_span!("mask").entered();

        let expected = (self.output.height, self.output.width, self.output.channels);
        if output.dim() != expected {
            return Err(MaskError::Shape {
                expected,
                actual: output.dim(),
            });
        }

        self.classify(output);

        let small = if self.denoise {
            erode(
                &dilate(&self.smoothed, Norm::LInf, DENOISE_RADIUS),
                Norm::LInf,
                DENOISE_RADIUS,
            )
        } else {
            self.smoothed.clone()
        };

        let scaled = imageops::resize(
            &small,
            self.roi.width,
            self.roi.height,
            imageops::FilterType::Triangle,
        );
        imageops::replace(&mut self.mask, &scaled, self.roi.x as i64, self.roi.y as i64);

        Ok(&self.mask)
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Hard per-pixel decisions blended into the smoothed buffer
    fn classify(&mut self, output: &ModelTensor) {
        let decide: fn(ArrayView1<f32>, usize) -> u8 = match self.family {
            ModelFamily::ClassArgmax => argmax_decision,
            ModelFamily::Threshold => |p, _| threshold_decision(p[0]),
            ModelFamily::TwoChannelSoftmax => |l, _| softmax_decision(l[0], l[1]),
            ModelFamily::Unknown => return,
        };

        // lanes come out row-major, same order as the buffer's pixels
        for (pixel, lane) in self.smoothed.pixels_mut().zip(output.lanes(Axis(2))) {
            pixel.0[0] = smooth(decide(lane, self.person_index), pixel.0[0]);
        }
    }
}

/// Integer temporal filter: newest decision in the top bits, history decays
pub fn smooth(hard: u8, previous: u8) -> u8 {
    (hard & SMOOTHING_MASK) | (previous >> SMOOTHING_SHIFT)
}

fn argmax_decision(scores: ArrayView1<f32>, person: usize) -> u8 {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, &s) in scores.iter().enumerate() {
        if s > best_score {
            best_score = s;
            best = i;
        }
    }
    if best == person {
        FOREGROUND
    } else {
        BACKGROUND
    }
}

fn threshold_decision(probability: f32) -> u8 {
    if probability >= THRESHOLD_CUTOFF {
        BACKGROUND
    } else {
        FOREGROUND
    }
}

/// Channel 0 is background, channel 1 is person; ties go to background
fn softmax_decision(background: f32, person: f32) -> u8 {
    let max = background.max(person);
    let e0 = (background - max).exp();
    let e1 = (person - max).exp();
    let p_background = e0 / (e0 + e1);
    let p_person = e1 / (e0 + e1);
    if p_background < p_person {
        FOREGROUND
    } else {
        BACKGROUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_W: u32 = 32;
    const FRAME_H: u32 = 16;

    fn roi() -> RegionOfInterest {
        RegionOfInterest::fit(FRAME_W, FRAME_H, 8, 8).unwrap()
    }

    fn engine(family: ModelFamily, channels: usize, denoise: bool) -> MaskEngine {
        let config = MaskConfig {
            family,
            person_index: Some(15),
            class_count: 21,
            denoise,
        };
        MaskEngine::new(config, TensorDescriptor::f32(8, 8, channels), roi(), FRAME_W, FRAME_H)
            .unwrap()
    }

    fn filled(channels: usize, values: &[f32]) -> ModelTensor {
        ModelTensor::from_shape_fn((8, 8, channels), |(_, _, c)| values[c])
    }

    fn roi_values(mask: &GrayImage) -> Vec<u8> {
        let roi = roi();
        mask.enumerate_pixels()
            .filter(|(x, y, _)| roi.contains(*x, *y))
            .map(|(_, _, p)| p.0[0])
            .collect()
    }

    fn assert_outside_is_background(mask: &GrayImage) {
        let roi = roi();
        for (x, y, p) in mask.enumerate_pixels() {
            if !roi.contains(x, y) {
                assert_eq!(p.0[0], BACKGROUND, "pixel ({x},{y}) outside ROI");
            }
        }
    }

    #[test]
    fn test_smoothing_converges_monotonically() {
        for hard in [FOREGROUND, BACKGROUND] {
            for start in 0..=255u8 {
                let mut value = start;
                let mut previous = start;
                for _ in 0..3 {
                    value = smooth(hard, value);
                    if hard == BACKGROUND {
                        assert!(value >= previous);
                    } else {
                        assert!(value <= previous);
                    }
                    previous = value;
                }
                assert_eq!(value, hard);
                assert_eq!(smooth(hard, value), value);
            }
        }
    }

    #[test]
    fn test_smoothing_damps_single_frame_flicker() {
        let settled = smooth(BACKGROUND, smooth(BACKGROUND, smooth(BACKGROUND, 0)));
        assert_eq!(settled, 255);
        let flicker = smooth(FOREGROUND, settled);
        assert_eq!(flicker, 31);
        assert_ne!(flicker, FOREGROUND);
    }

    #[test]
    fn test_softmax_tie_is_background() {
        assert_eq!(softmax_decision(0.0, 0.0), BACKGROUND);
        assert_eq!(softmax_decision(-1.0, 1.0), FOREGROUND);
        assert_eq!(softmax_decision(1.0, -1.0), BACKGROUND);
        // Large logits must not overflow
        assert_eq!(softmax_decision(1000.0, 1001.0), FOREGROUND);
    }

    #[test]
    fn test_threshold_boundary_is_background() {
        assert_eq!(threshold_decision(0.65), BACKGROUND);
        assert_eq!(threshold_decision(0.9), BACKGROUND);
        assert_eq!(threshold_decision(0.649), FOREGROUND);
    }

    #[test]
    fn test_argmax_picks_person_class() {
        let mut scores = ndarray::Array1::<f32>::zeros(21);
        scores[15] = 2.0;
        assert_eq!(argmax_decision(scores.view(), 15), FOREGROUND);
        scores[3] = 5.0;
        assert_eq!(argmax_decision(scores.view(), 15), BACKGROUND);
    }

    #[test]
    fn test_outside_roi_stays_background() {
        let mut engine = engine(ModelFamily::TwoChannelSoftmax, 2, true);
        for _ in 0..5 {
            let mask = engine.update(&filled(2, &[-4.0, 4.0])).unwrap();
            assert_outside_is_background(mask);
        }
        assert!(roi_values(engine.mask()).iter().all(|v| *v == FOREGROUND));
    }

    #[test]
    fn test_unknown_family_leaves_mask_unsegmented() {
        let mut engine = engine(ModelFamily::Unknown, 4, true);
        for _ in 0..3 {
            engine.update(&filled(4, &[9.0, -9.0, 9.0, -9.0])).unwrap();
        }
        assert!(engine.mask().pixels().all(|p| p.0[0] == BACKGROUND));
    }

    #[test]
    fn test_unknown_family_keeps_previous_state() {
        let mut engine = engine(ModelFamily::Threshold, 1, false);
        for _ in 0..3 {
            engine.update(&filled(1, &[0.1])).unwrap();
        }
        let before = engine.smoothed.clone();
        engine.family = ModelFamily::Unknown;
        engine.update(&filled(1, &[0.99])).unwrap();
        assert_eq!(engine.smoothed, before);
    }

    #[test]
    fn test_argmax_segments_person() {
        let mut scores = vec![0.0; 21];
        scores[15] = 1.0;
        let mut engine = engine(ModelFamily::ClassArgmax, 21, false);
        for _ in 0..3 {
            engine.update(&filled(21, &scores)).unwrap();
        }
        assert!(roi_values(engine.mask()).iter().all(|v| *v == FOREGROUND));
        assert_outside_is_background(engine.mask());
    }

    #[test]
    fn test_denoise_fills_isolated_speck() {
        // One stray person pixel in an all-background output
        let mut engine = engine(ModelFamily::Threshold, 1, true);
        let mut output = filled(1, &[1.0]);
        output[[4, 4, 0]] = 0.0;
        for _ in 0..3 {
            engine.update(&output).unwrap();
        }
        assert_eq!(engine.smoothed.get_pixel(4, 4).0[0], FOREGROUND);
        assert!(roi_values(engine.mask()).iter().all(|v| *v == BACKGROUND));
    }

    #[test]
    fn test_channel_mismatch_is_rejected() {
        let config = MaskConfig {
            family: ModelFamily::TwoChannelSoftmax,
            person_index: None,
            class_count: 21,
            denoise: true,
        };
        let result = MaskEngine::new(config, TensorDescriptor::f32(8, 8, 3), roi(), FRAME_W, FRAME_H);
        assert_eq!(
            result.err(),
            Some(MaskError::Channels {
                family: ModelFamily::TwoChannelSoftmax,
                expected: 2,
                actual: 3,
            })
        );
    }

    #[test]
    fn test_non_float_output_is_rejected() {
        let config = MaskConfig {
            family: ModelFamily::Threshold,
            person_index: None,
            class_count: 21,
            denoise: true,
        };
        let output = TensorDescriptor {
            element: ElementType::U8,
            ..TensorDescriptor::f32(8, 8, 1)
        };
        assert!(matches!(
            MaskEngine::new(config, output, roi(), FRAME_W, FRAME_H),
            Err(MaskError::ElementType(_))
        ));
    }

    #[test]
    fn test_wrong_tensor_shape_is_rejected() {
        let mut engine = engine(ModelFamily::Threshold, 1, true);
        let result = engine.update(&ModelTensor::zeros((4, 4, 1)));
        assert!(matches!(result, Err(MaskError::Shape { .. })));
    }
}
