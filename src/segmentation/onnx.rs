use super::types::{ElementType, Inference, ModelTensor, TensorDescriptor};
use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array3;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use std::path::Path;

/// Memory order of a rank-4 model tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Nhwc,
    Nchw,
}

/// Segmentation model running on ONNX Runtime
///
/// The pipeline always works with (height, width, channels) tensors; models
/// exported channels-first are transposed on the way in and out.
pub struct OnnxModel {
    session: Session,
    input: TensorDescriptor,
    input_layout: Layout,
    output: TensorDescriptor,
    output_layout: Layout,
}

impl OnnxModel {
    /// Load a model from an ONNX file
    ///
    /// Spatial dimensions must be fixed in the model; the mask geometry is
    /// derived from them once at startup.
    pub fn new<P: AsRef<Path>>(model_path: P, threads: usize) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let session = Session::builder()
            .map_err(|e| anyhow!("Failed to create session builder: {e}"))?
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(|e| anyhow!("Failed to register execution providers: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Failed to set optimization level: {e}"))?
            .with_intra_threads(threads)
            .map_err(|e| anyhow!("Failed to set thread count: {e}"))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("Failed to load model from {}: {e}", path.display()))?;

        let input_type = &session
            .inputs
            .first()
            .context("Model has no inputs")?
            .input_type;
        let (input, input_layout) = describe(input_type).context("Unsupported model input")?;
        if input.element != ElementType::F32 {
            bail!("Model input must be f32, got {}", input);
        }

        let output_type = &session
            .outputs
            .first()
            .context("Model has no outputs")?
            .output_type;
        let (output, output_layout) = describe(output_type).context("Unsupported model output")?;

        tracing::info!("Model input {} ({:?})", input, input_layout);
        tracing::info!("Model output {} ({:?})", output, output_layout);

        Ok(Self {
            session,
            input,
            input_layout,
            output,
            output_layout,
        })
    }
}

/// Descriptor and layout of a rank-3 or rank-4 tensor with fixed spatial size
fn describe(value_type: &ValueType) -> Result<(TensorDescriptor, Layout)> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("not a tensor: {:?}", value_type);
    };

    let dims: Vec<i64> = shape.iter().copied().collect();
    let (a, b, c) = match dims.as_slice() {
        [_, a, b, c] | [a, b, c] => (*a, *b, *c),
        other => bail!("expected a rank 3 or 4 tensor, got {:?}", other),
    };
    if a <= 0 || b <= 0 || c <= 0 {
        bail!("dynamic dimensions are not supported: {:?}", dims);
    }
    let (a, b, c) = (a as usize, b as usize, c as usize);

    let element = match ty {
        TensorElementType::Float32 => ElementType::F32,
        TensorElementType::Uint8 => ElementType::U8,
        _ => ElementType::Other,
    };

    // Channels are the smaller of the two outer candidates
    Ok(if c <= a {
        (
            TensorDescriptor { height: a, width: b, channels: c, element },
            Layout::Nhwc,
        )
    } else {
        (
            TensorDescriptor { height: b, width: c, channels: a, element },
            Layout::Nchw,
        )
    })
}

impl Inference for OnnxModel {
    fn input_descriptor(&self) -> TensorDescriptor {
        self.input
    }

    fn output_descriptor(&self) -> TensorDescriptor {
        self.output
    }

    fn invoke(&mut self, input: &ModelTensor) -> Result<ModelTensor> {
        let _span = tracing::debug_span!("inference").entered();

        let TensorDescriptor { height, width, channels, .. } = self.input;
        if input.dim() != (height, width, channels) {
            bail!("Input tensor is {:?}, model expects {}", input.dim(), self.input);
        }

        let (shape, data): ([usize; 4], Vec<f32>) = match self.input_layout {
            Layout::Nhwc => ([1, height, width, channels], input.iter().copied().collect()),
            Layout::Nchw => (
                [1, channels, height, width],
                input.view().permuted_axes([2, 0, 1]).iter().copied().collect(),
            ),
        };
        let tensor = Tensor::from_array((shape, data)).context("Failed to build input tensor")?;

        let out = self.output;
        let output_layout = self.output_layout;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("Failed to run inference")?;
        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to read model output")?;
        if values.len() != out.len() {
            bail!("Model produced {} values, expected {}", values.len(), out);
        }

        let result = match output_layout {
            Layout::Nhwc => Array3::from_shape_vec((out.height, out.width, out.channels), values.to_vec())?,
            Layout::Nchw => Array3::from_shape_vec((out.channels, out.height, out.width), values.to_vec())?
                .permuted_axes([1, 2, 0])
                .as_standard_layout()
                .into_owned(),
        };

        Ok(result)
    }
}
