use anyhow::Result;
use ndarray::Array3;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Model output tensor, laid out as (height, width, channels)
pub type ModelTensor = Array3<f32>;

/// Element type of a model tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    U8,
    Other,
}

/// Shape and element type of a model input or output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub element: ElementType,
}

impl TensorDescriptor {
    pub fn f32(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            element: ElementType::F32,
        }
    }

    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} {:?}",
            self.height, self.width, self.channels, self.element
        )
    }
}

/// How a model's output tensor is turned into a foreground/background decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Multi-class segmentation (DeepLab style): argmax over classes
    ClassArgmax,
    /// Single-channel probability (BodyPix style)
    Threshold,
    /// Background/person logit pair (Meet segmentation style)
    TwoChannelSoftmax,
    /// Output layout we do not understand; the mask is left untouched
    Unknown,
}

impl ModelFamily {
    /// Guess the family from well-known model file names
    pub fn from_model_path<P: AsRef<Path>>(path: P) -> Self {
        let name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.contains("deeplab") {
            Self::ClassArgmax
        } else if name.contains("body-pix") {
            Self::Threshold
        } else if name.contains("segm_") {
            Self::TwoChannelSoftmax
        } else {
            Self::Unknown
        }
    }

    /// Number of output channels this family requires, if fixed
    pub fn required_channels(&self) -> Option<usize> {
        match self {
            Self::Threshold => Some(1),
            Self::TwoChannelSoftmax => Some(2),
            Self::ClassArgmax | Self::Unknown => None,
        }
    }
}

impl FromStr for ModelFamily {
    type Err = std::convert::Infallible;

    /// Unrecognised names map to `Unknown` rather than failing
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "argmax" | "deeplab" | "class-argmax" => Self::ClassArgmax,
            "threshold" | "body-pix" | "bodypix" => Self::Threshold,
            "softmax" | "meet" | "two-channel-softmax" => Self::TwoChannelSoftmax,
            _ => Self::Unknown,
        })
    }
}

/// Channel order the model expects its input in
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Opaque inference backend
///
/// Allows swapping between different runtimes (ONNX Runtime, test fakes, etc.)
pub trait Inference {
    /// Shape of the tensor `invoke` expects
    fn input_descriptor(&self) -> TensorDescriptor;

    /// Shape of the tensor `invoke` returns
    fn output_descriptor(&self) -> TensorDescriptor;

    /// Run the model on one normalized (height, width, channels) input
    fn invoke(&mut self, input: &ModelTensor) -> Result<ModelTensor>;
}
