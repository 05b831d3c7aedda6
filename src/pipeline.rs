use crate::background::Background;
use crate::capture::FrameExchange;
use crate::compositor::{BlendMode, Compositor, Mirror};
use crate::output::OutputSink;
use crate::segmentation::{
    ChannelOrder, Inference, MaskConfig, MaskEngine, ModelFamily, ModelMetadata, Preprocessor,
    RegionOfInterest,
};
use anyhow::{bail, Context, Result};
use image::{imageops, GrayImage, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest wait for a frame before re-checking the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Frames between statistics log lines
const STATS_INTERVAL: u64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub family: ModelFamily,
    pub channel_order: ChannelOrder,
    pub blend: BlendMode,
    pub mirror: Mirror,
    pub denoise: bool,
    pub blur: bool,
}

/// Accumulated per-stage timings
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames: u64,
    pub wait: Duration,
    pub segment: Duration,
    pub composite: Duration,
    pub output: Duration,
}

impl PipelineStats {
    fn log(&self, exchange: &FrameExchange, elapsed: Duration) {
        let frames = self.frames.max(1) as f64;
        let avg_ms = |d: Duration| d.as_secs_f64() * 1000.0 / frames;
        let captured = exchange.frames();
        let seconds = elapsed.as_secs_f64().max(f64::EPSILON);

        tracing::info!(
            "Frame {}: wait={:.1}ms, segment={:.1}ms, composite={:.1}ms, output={:.1}ms, grab={:.1}ms, captured={} ({:.1}fps), fps={:.1}",
            self.frames,
            avg_ms(self.wait),
            avg_ms(self.segment),
            avg_ms(self.composite),
            avg_ms(self.output),
            exchange.last_latency().as_secs_f64() * 1000.0,
            captured,
            captured as f64 / seconds,
            self.frames as f64 / seconds
        );
    }
}

/// Segmentation, compositing and output for one camera
pub struct Pipeline<M, O> {
    model: M,
    preprocessor: Preprocessor,
    engine: MaskEngine,
    compositor: Compositor,
    background: Background,
    output: O,
    width: u32,
    height: u32,
}

impl<M, O> Pipeline<M, O>
where
    M: Inference,
    O: OutputSink,
{
    pub fn new(
        model: M,
        metadata: &ModelMetadata,
        background: Background,
        output: O,
        config: &PipelineConfig,
    ) -> Result<Self> {
        if output.resolution() != (config.width, config.height) {
            bail!(
                "Output sink is {:?}, pipeline is {}x{}",
                output.resolution(),
                config.width,
                config.height
            );
        }

        let input = model.input_descriptor();
        let model_output = model.output_descriptor();

        let roi = RegionOfInterest::fit(
            config.width,
            config.height,
            model_output.width as u32,
            model_output.height as u32,
        )?;
        tracing::info!(
            "Region of interest (x,y,w,h)=({},{},{},{})",
            roi.x,
            roi.y,
            roi.width,
            roi.height
        );

        let preprocessor = Preprocessor::new(
            roi,
            &input,
            config.channel_order,
            metadata.normalization,
            config.blur,
        )?;

        let engine = MaskEngine::new(
            MaskConfig {
                family: config.family,
                person_index: metadata.person_index(),
                class_count: metadata.labels.len(),
                denoise: config.denoise,
            },
            model_output,
            roi,
            config.width,
            config.height,
        )
        .context("Model output does not fit the model family")?;

        Ok(Self {
            model,
            preprocessor,
            engine,
            compositor: Compositor::new(config.blend, config.mirror),
            background,
            output,
            width: config.width,
            height: config.height,
        })
    }

    /// Process captured frames until `shutdown` is set
    ///
    /// Runs once per captured frame; frames that arrive while one is being
    /// processed are superseded by the newest. A closed exchange means the
    /// capture thread died and is fatal.
    pub fn run(&mut self, exchange: &FrameExchange, shutdown: &AtomicBool) -> Result<PipelineStats> {
        let mut stats = PipelineStats::default();
        let mut last_seen = 0;
        let mut raw = RgbImage::new(0, 0);
        let started = Instant::now();

        tracing::info!("Starting main pipeline loop");
        tracing::info!("Press Ctrl+C to stop");

        while !shutdown.load(Ordering::Relaxed) {
            let wait_start = Instant::now();
            if !exchange.wait_advance(&mut last_seen, &mut raw, POLL_INTERVAL) {
                if exchange.is_closed() {
                    bail!("Capture stopped after {} frames", exchange.frames());
                }
                continue;
            }
            stats.wait += wait_start.elapsed();

            self.process(&mut raw, &mut stats)?;
            stats.frames += 1;

            if stats.frames % STATS_INTERVAL == 0 {
                stats.log(exchange, started.elapsed());
            }
        }

        tracing::info!("Pipeline stopped after {} frames", stats.frames);
        Ok(stats)
    }

    /// Segment, composite and emit one frame; `frame` is used as scratch
    pub fn process(&mut self, frame: &mut RgbImage, stats: &mut PipelineStats) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            *frame = imageops::resize(
                &*frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
        }

        let segment_start = Instant::now();
        let input = self.preprocessor.prepare(frame)?;
        let model_output = self.model.invoke(&input).context("Failed to run inference")?;
        let mask = self.engine.update(&model_output)?;
        stats.segment += segment_start.elapsed();

        let composite_start = Instant::now();
        let background = self.background.sample();
        self.compositor.compose(frame, background, mask)?;
        stats.composite += composite_start.elapsed();

        let output_start = Instant::now();
        self.output
            .write_frame(frame)
            .context("Failed to write frame")?;
        stats.output += output_start.elapsed();

        Ok(())
    }

    pub fn mask(&self) -> &GrayImage {
        self.engine.mask()
    }

    /// Stop background playback
    pub fn finish(self) -> Result<()> {
        self.background.stop()
    }
}
