pub mod mask;
pub mod metadata;
mod onnx;
mod preprocess;
mod roi;
pub mod types;

pub use mask::{MaskConfig, MaskEngine};
pub use metadata::ModelMetadata;
pub use onnx::OnnxModel;
pub use preprocess::Preprocessor;
pub use roi::RegionOfInterest;
pub use types::{ChannelOrder, Inference, ModelFamily};
