use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoiError {
    #[error("frame size {0}x{1} is empty")]
    EmptyFrame(u32, u32),

    #[error("model size {0}x{1} is empty")]
    EmptyModel(u32, u32),
}

/// Centered sub-rectangle of the frame with the model's aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    /// Largest centered rectangle of the model aspect ratio that fits the frame
    pub fn fit(
        frame_width: u32,
        frame_height: u32,
        model_width: u32,
        model_height: u32,
    ) -> Result<Self, RoiError> {
        if frame_width == 0 || frame_height == 0 {
            return Err(RoiError::EmptyFrame(frame_width, frame_height));
        }
        if model_width == 0 || model_height == 0 {
            return Err(RoiError::EmptyModel(model_width, model_height));
        }

        let scale = (frame_width as f64 / model_width as f64)
            .min(frame_height as f64 / model_height as f64);
        let width = ((model_width as f64 * scale).round() as u32).clamp(1, frame_width);
        let height = ((model_height as f64 * scale).round() as u32).clamp(1, frame_height);

        Ok(Self {
            x: (frame_width - width) / 2,
            y: (frame_height - height) / 2,
            width,
            height,
        })
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_frame_square_model() {
        let roi = RegionOfInterest::fit(640, 480, 257, 257).unwrap();
        assert_eq!(roi, RegionOfInterest { x: 80, y: 0, width: 480, height: 480 });
    }

    #[test]
    fn test_wide_model_in_narrow_frame() {
        let roi = RegionOfInterest::fit(640, 480, 256, 144).unwrap();
        assert_eq!(roi.width, 640);
        assert_eq!(roi.height, 360);
        assert_eq!((roi.x, roi.y), (0, 60));
    }

    #[test]
    fn test_always_inside_frame() {
        for (fw, fh) in [(640, 480), (1280, 720), (33, 17), (1, 1)] {
            for (mw, mh) in [(257, 257), (256, 144), (160, 96), (7, 300)] {
                let roi = RegionOfInterest::fit(fw, fh, mw, mh).unwrap();
                assert!(roi.x + roi.width <= fw);
                assert!(roi.y + roi.height <= fh);
                assert!(roi.width > 0 && roi.height > 0);
            }
        }
    }

    #[test]
    fn test_rejects_empty_sizes() {
        assert_eq!(
            RegionOfInterest::fit(0, 480, 10, 10),
            Err(RoiError::EmptyFrame(0, 480))
        );
        assert_eq!(
            RegionOfInterest::fit(640, 480, 10, 0),
            Err(RoiError::EmptyModel(10, 0))
        );
    }
}
