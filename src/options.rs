use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};

/// Output parameters passed through to the codec tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Target width in pixels
    pub width: u32,

    /// Target height in pixels
    pub height: u32,

    /// Frames per second for animated outputs
    pub fps: u32,

    /// Encoder quality, 0 (smallest) to 100 (best)
    pub quality: u32,

    /// Worker threads for tools that accept a thread count (0 = all cores)
    pub threads: u32,
}

impl OutputOptions {
    pub const MAX_QUALITY: u32 = 100;

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// Range-check every field, failing on the first invalid one
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(ConvertError::InvalidOptions(
                "width must be a positive integer".to_string(),
            ));
        }
        if self.height == 0 {
            return Err(ConvertError::InvalidOptions(
                "height must be a positive integer".to_string(),
            ));
        }
        if self.fps == 0 {
            return Err(ConvertError::InvalidOptions(
                "fps must be a positive integer".to_string(),
            ));
        }
        if self.quality > Self::MAX_QUALITY {
            return Err(ConvertError::InvalidOptions(format!(
                "quality must be within 0..={}, got {}",
                Self::MAX_QUALITY,
                self.quality
            )));
        }
        Ok(())
    }

    /// VP9 constant rate factor (0..=63, lower is better) for this quality
    pub fn vp9_crf(&self) -> u32 {
        let quality = self.quality.min(Self::MAX_QUALITY);
        63 - quality * 63 / Self::MAX_QUALITY
    }

    /// GIF encoder quality; the encoder only accepts 1..=100
    pub fn gif_quality(&self) -> u32 {
        self.quality.clamp(1, Self::MAX_QUALITY)
    }

    /// Dimensions of a `width`x`height` image scaled, aspect ratio kept, so
    /// that it fills the `self.width`x`self.height` box along one side.
    /// Smaller images are scaled up.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (self.width, self.height);
        }
        let ratio = f64::min(
            self.width as f64 / width as f64,
            self.height as f64 / height as f64,
        );
        let scaled = |side: u32| ((side as f64 * ratio).round() as u32).max(1);
        (scaled(width), scaled(height))
    }

    /// Thread count the tools will actually end up using
    pub fn effective_threads(&self) -> usize {
        match self.threads {
            0 => num_cpus::get(),
            n => n as usize,
        }
    }
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            fps: 50,
            quality: 90,
            threads: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = OutputOptions::default();
        assert_eq!((options.width, options.height), (512, 512));
        assert_eq!(options.fps, 50);
        assert_eq!(options.quality, 90);
        assert_eq!(options.threads, 0);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_boundaries_accepted() {
        let base = OutputOptions::default();
        assert!(base.with_quality(0).validate().is_ok());
        assert!(base.with_quality(100).validate().is_ok());
        assert!(base.with_size(1, 1).validate().is_ok());
        assert!(base.with_threads(0).validate().is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let base = OutputOptions::default();
        for options in [
            base.with_quality(101),
            base.with_size(0, 512),
            base.with_size(512, 0),
            base.with_fps(0),
        ] {
            assert!(matches!(
                options.validate(),
                Err(ConvertError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn test_vp9_crf_mapping() {
        let base = OutputOptions::default();
        assert_eq!(base.with_quality(100).vp9_crf(), 0);
        assert_eq!(base.with_quality(0).vp9_crf(), 63);
        assert!(base.with_quality(90).vp9_crf() < base.with_quality(50).vp9_crf());
    }

    #[test]
    fn test_gif_quality_never_zero() {
        let base = OutputOptions::default();
        assert_eq!(base.with_quality(0).gif_quality(), 1);
        assert_eq!(base.with_quality(1).gif_quality(), 1);
        assert_eq!(base.with_quality(100).gif_quality(), 100);
    }

    #[test]
    fn test_fit_keeps_aspect_ratio() {
        let sticker = OutputOptions::default();
        assert_eq!(sticker.fit(4000, 3000), (512, 384));
        assert_eq!(sticker.fit(3000, 4000), (384, 512));
        assert_eq!(sticker.fit(100, 50), (512, 256));
        assert_eq!(sticker.fit(512, 512), (512, 512));
        assert_eq!(sticker.with_size(320, 200).fit(400, 300), (267, 200));
        assert_eq!(sticker.fit(10_000, 1), (512, 1));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let options: OutputOptions = toml::from_str("quality = 75").unwrap();
        assert_eq!(options.quality, 75);
        assert_eq!(options.width, 512);
        assert!(options.effective_threads() >= 1);
    }
}
