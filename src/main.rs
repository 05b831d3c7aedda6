mod background;
mod capture;
mod compositor;
mod output;
mod pipeline;
mod segmentation;

use anyhow::{Context, Result};
use background::Background;
use capture::{CaptureLoop, WebcamCapture};
use clap::builder::FalseyValueParser;
use clap::Parser;
use compositor::{BlendMode, Mirror};
use output::{PixelFormat, V4L2Output};
use pipeline::{Pipeline, PipelineConfig};
use segmentation::{ChannelOrder, ModelFamily, ModelMetadata, OnnxModel};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Stream width (capture request and output)
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Stream height (capture request and output)
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Requested capture frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Path to segmentation model (ONNX file)
    #[arg(short, long)]
    model: PathBuf,

    /// How to read the model output: argmax, threshold or softmax.
    /// Guessed from the model file name when omitted
    #[arg(long)]
    model_family: Option<ModelFamily>,

    /// Model metadata block with input normalization constants
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Label map (one class name per line) for multi-class models
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Channel order the model expects
    #[arg(long, value_enum, default_value_t = ChannelOrder::Rgb)]
    channel_order: ChannelOrder,

    /// Background image, or animated GIF; green screen if omitted
    #[arg(short, long)]
    background: Option<PathBuf>,

    /// Mask blending
    #[arg(long, value_enum, default_value_t = BlendMode::HardCut)]
    blend: BlendMode,

    /// Pixel format written to the virtual camera
    #[arg(long, value_enum, default_value_t = PixelFormat::Yuv420)]
    pixel_format: PixelFormat,

    /// Mirror the output horizontally
    #[arg(long)]
    flip_horizontal: bool,

    /// Mirror the output vertically
    #[arg(long)]
    flip_vertical: bool,

    /// Inference threads
    #[arg(short, long, default_value_t = 2)]
    threads: usize,

    /// Skip mask denoising (any set value other than 0/false/no/off enables)
    #[arg(long, env = "BACKDROP_NODENOISE", value_parser = FalseyValueParser::new())]
    no_denoise: bool,

    /// Skip input blurring
    #[arg(long, env = "BACKDROP_NOBLUR", value_parser = FalseyValueParser::new())]
    no_blur: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Backdrop starting");
    tracing::info!("Stream: {}x{} @ {}fps", args.width, args.height, args.fps);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .context("Failed to install Ctrl+C handler")?;
    }

    // Initialize output
    let output = V4L2Output::new(
        &args.output_device,
        args.width,
        args.height,
        args.pixel_format,
    )
    .context("Failed to initialize v4l2loopback output")?;

    // Initialize capture
    let (device, width, height, fps) = (args.input_device, args.width, args.height, args.fps);
    let (capture, stream) = CaptureLoop::spawn("capture", move || {
        WebcamCapture::new(device, width, height, fps)
    })
    .context("Failed to initialize webcam capture")?;
    tracing::info!(
        "Stream info: {}x{} @ {}fps",
        stream.width,
        stream.height,
        stream.frame_rate
    );

    // Initialize segmentation
    let family = args
        .model_family
        .unwrap_or_else(|| ModelFamily::from_model_path(&args.model));
    tracing::info!("Model family: {:?}", family);

    let metadata = ModelMetadata::load(args.metadata.as_deref(), args.labels.as_deref());
    let model = OnnxModel::new(&args.model, args.threads)
        .context("Failed to load segmentation model")?;

    let background = Background::load(args.background.as_deref(), args.width, args.height);

    let config = PipelineConfig {
        width: args.width,
        height: args.height,
        family,
        channel_order: args.channel_order,
        blend: args.blend,
        mirror: Mirror {
            horizontal: args.flip_horizontal,
            vertical: args.flip_vertical,
        },
        denoise: !args.no_denoise,
        blur: !args.no_blur,
    };
    let mut pipeline = Pipeline::new(model, &metadata, background, output, &config)?;

    // Main loop
    let result = pipeline.run(capture.exchange(), &shutdown);

    let capture_result = capture.stop();
    pipeline.finish()?;
    result?;
    capture_result?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_switches_accept_any_value() {
        std::env::remove_var("BACKDROP_NODENOISE");
        std::env::remove_var("BACKDROP_NOBLUR");
        let args = Args::try_parse_from(["backdrop", "--model", "segm_full.onnx"]).unwrap();
        assert!(!args.no_denoise);
        assert!(!args.no_blur);

        std::env::set_var("BACKDROP_NODENOISE", "1");
        std::env::set_var("BACKDROP_NOBLUR", "yes");
        let args = Args::try_parse_from(["backdrop", "--model", "segm_full.onnx"]).unwrap();
        assert!(args.no_denoise);
        assert!(args.no_blur);

        std::env::set_var("BACKDROP_NODENOISE", "0");
        std::env::remove_var("BACKDROP_NOBLUR");
        let args =
            Args::try_parse_from(["backdrop", "--model", "segm_full.onnx", "--no-blur"]).unwrap();
        assert!(!args.no_denoise);
        assert!(args.no_blur);

        std::env::remove_var("BACKDROP_NODENOISE");
    }

    #[test]
    fn test_model_family_flag_overrides_name() {
        let args = Args::try_parse_from([
            "backdrop",
            "--model",
            "segm_full.onnx",
            "--model-family",
            "threshold",
        ])
        .unwrap();
        assert_eq!(args.model_family, Some(ModelFamily::Threshold));
        assert_eq!(args.output_device, "/dev/video10");
        assert_eq!((args.width, args.height), (640, 480));
    }
}
