use super::exchange::FrameExchange;
use super::CaptureSource;
use anyhow::{anyhow, Context, Result};
use crossbeam::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Negotiated stream parameters reported by a freshly opened source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Free-running capture thread feeding a `FrameExchange`
pub struct CaptureLoop {
    name: String,
    exchange: Arc<FrameExchange>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl CaptureLoop {
    /// Open a source on a dedicated thread and start capturing
    ///
    /// The source is constructed on the capture thread, so it does not need
    /// to be `Send`. Returns once the source is open.
    pub fn spawn<C, F>(name: &str, open: F) -> Result<(Self, StreamInfo)>
    where
        C: CaptureSource,
        F: FnOnce() -> Result<C> + Send + 'static,
    {
        let exchange = Arc::new(FrameExchange::new());
        let (opened_tx, opened_rx) = channel::bounded::<Result<StreamInfo>>(1);

        let thread_exchange = exchange.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut source = match open() {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let (width, height) = source.resolution();
                let info = StreamInfo {
                    width,
                    height,
                    frame_rate: source.frame_rate(),
                };
                if opened_tx.send(Ok(info)).is_err() {
                    return Ok(());
                }
                run(&thread_name, &mut source, &thread_exchange)
            })
            .with_context(|| format!("Failed to spawn {} thread", name))?;

        let mut capture = Self {
            name: name.to_string(),
            exchange,
            handle: Some(handle),
        };

        match opened_rx.recv() {
            Ok(Ok(info)) => {
                tracing::info!(
                    "{}: {}x{} @ {}fps",
                    name,
                    info.width,
                    info.height,
                    info.frame_rate
                );
                Ok((capture, info))
            }
            Ok(Err(e)) => {
                capture.join().ok();
                Err(e)
            }
            Err(_) => {
                capture.join()?;
                Err(anyhow!("{} thread exited before opening its source", name))
            }
        }
    }

    pub fn exchange(&self) -> &Arc<FrameExchange> {
        &self.exchange
    }

    /// Signal the thread to stop and wait for it
    ///
    /// Returns the capture error, if the thread stopped because of one.
    pub fn stop(mut self) -> Result<()> {
        self.exchange.close();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("{} thread panicked", self.name))?,
            None => Ok(()),
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.exchange.close();
        if let Err(e) = self.join() {
            tracing::warn!("{}: {:#}", self.name, e);
        }
    }
}

fn run<C: CaptureSource>(name: &str, source: &mut C, exchange: &FrameExchange) -> Result<()> {
    tracing::debug!("{}: capture loop started", name);

    loop {
        // Acquisition blocks outside the exchange lock
        let start = Instant::now();
        let frame = match source.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("{}: capture failed: {:#}", name, e);
                exchange.close();
                return Err(e);
            }
        };

        if !exchange.publish(frame, start.elapsed()) {
            break;
        }
    }

    tracing::debug!("{}: capture loop stopped", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    /// Produces numbered frames, failing after `fail_after` if set
    struct CountingSource {
        next: u32,
        fail_after: Option<u32>,
    }

    impl CaptureSource for CountingSource {
        fn capture_frame(&mut self) -> Result<RgbImage> {
            thread::sleep(Duration::from_millis(2));
            if Some(self.next) == self.fail_after {
                bail!("device unplugged");
            }
            self.next += 1;
            Ok(RgbImage::from_pixel(8, 4, Rgb([self.next as u8, 0, 0])))
        }

        fn resolution(&self) -> (u32, u32) {
            (8, 4)
        }

        fn frame_rate(&self) -> u32 {
            500
        }
    }

    #[test]
    fn test_reports_stream_info_and_stops() {
        let (capture, info) = CaptureLoop::spawn("test-capture", || {
            Ok(CountingSource { next: 0, fail_after: None })
        })
        .unwrap();
        assert_eq!(info, StreamInfo { width: 8, height: 4, frame_rate: 500 });

        let mut seen = 0;
        let mut raw = RgbImage::new(0, 0);
        let mut frames = 0;
        while frames < 5 {
            let before = seen;
            if capture
                .exchange()
                .wait_advance(&mut seen, &mut raw, Duration::from_millis(200))
            {
                assert!(seen > before);
                assert_eq!(raw.get_pixel(0, 0).0[0], seen as u8);
                frames += 1;
            }
        }

        let exchange = capture.exchange().clone();
        capture.stop().unwrap();
        assert!(exchange.is_closed());
    }

    #[test]
    fn test_capture_error_closes_exchange() {
        let (capture, _) = CaptureLoop::spawn("failing-capture", || {
            Ok(CountingSource { next: 0, fail_after: Some(3) })
        })
        .unwrap();

        let exchange = capture.exchange().clone();
        for _ in 0..100 {
            if exchange.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(exchange.is_closed());
        assert_eq!(exchange.frames(), 3);
        assert!(capture.stop().is_err());
    }

    #[test]
    fn test_open_failure_is_returned() {
        let result = CaptureLoop::spawn("missing-capture", || -> Result<CountingSource> {
            bail!("no such device")
        });
        assert!(result.is_err());
    }
}
