//! Display conversion for finished output tensors.
//!
//! Turns a rank-4 output tensor into an image for visual inspection. The
//! channel position is guessed with the same small-dimension heuristic
//! used for input layout; implausible tensor dimensions are skipped with
//! a warning instead of producing garbage images.

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use image::{Rgb, RgbImage};
use ndarray::ArrayView4;

use crate::engine::FlatOutput;

/// Acceptable image dimensions for a displayable tensor.
const MIN_EDGE: usize = 20;
const MAX_EDGE: usize = 2000;
const MAX_CHANNELS: usize = 4;

/// Consumer of the driver's finished output tensor.
pub trait DisplaySink {
    fn present(&mut self, output: &FlatOutput) -> Result<()>;
}

/// Sink that discards outputs, for headless runs.
pub struct NullSink;

impl DisplaySink for NullSink {
    fn present(&mut self, _output: &FlatOutput) -> Result<()> {
        Ok(())
    }
}

/// Sink writing each presented tensor as a PNG file.
pub struct ImageFileSink {
    path: PathBuf,
    normalize: bool,
}

impl ImageFileSink {
    /// With `normalize`, values are min-max scaled to `[0, 1]` before the
    /// u8 conversion, which makes raw feature maps visible.
    pub fn new(path: PathBuf, normalize: bool) -> Self {
        Self { path, normalize }
    }
}

impl DisplaySink for ImageFileSink {
    fn present(&mut self, output: &FlatOutput) -> Result<()> {
        match tensor_to_image(output, self.normalize)? {
            Some(image) => {
                image
                    .save(&self.path)
                    .with_context(|| format!("failed to write {}", self.path.display()))?;
                log::info!(
                    "Wrote output '{}' ({}x{}) to {}",
                    output.name,
                    image.width(),
                    image.height(),
                    self.path.display()
                );
            }
            None => {
                log::warn!(
                    "Output '{}' with shape {:?} is not displayable, skipping",
                    output.name,
                    output.shape
                );
            }
        }
        Ok(())
    }
}

/// Convert a rank-4 tensor to an image, or `None` if its dimensions are
/// not plausible for display.
pub fn tensor_to_image(output: &FlatOutput, normalize: bool) -> Result<Option<RgbImage>> {
    ensure!(
        output.rank() == 4,
        "display conversion expects a rank-4 tensor, got rank {}",
        output.rank()
    );
    // channels-first when the post-batch dimension is small
    let s = &output.shape;
    let view = ArrayView4::from_shape((s[0], s[1], s[2], s[3]), &output.data[..])
        .context("tensor data does not match its shape")?;
    let (channels, height, width, channels_first) = if s[1] < 10 {
        (s[1], s[2], s[3], true)
    } else {
        (s[3], s[1], s[2], false)
    };

    let plausible = (MIN_EDGE..=MAX_EDGE).contains(&width)
        && (MIN_EDGE..=MAX_EDGE).contains(&height)
        && (1..=MAX_CHANNELS).contains(&channels);
    if !plausible {
        return Ok(None);
    }

    let (min, max) = if normalize {
        output.data.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY),
            |(min, max), &v| (min.min(v), max.max(v)),
        )
    } else {
        (0.0, 1.0)
    };
    // constant tensors map to black instead of dividing by zero
    let range = max - min;
    let scale = if range > 0.0 { 1.0 / range } else { 0.0 };

    // tensors with 2 or 4 channels repeat their last plane to fill RGB
    let value_at = |x: u32, y: u32, c: usize| -> f32 {
        let (x, y, c) = (x as usize, y as usize, c.min(channels - 1));
        if channels_first {
            view[[0, c, y, x]]
        } else {
            view[[0, y, x, c]]
        }
    };

    let image = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let pixel = |c: usize| -> u8 {
            let v = ((value_at(x, y, c) - min) * scale).clamp(0.0, 1.0);
            (v * 255.0) as u8
        };
        if channels == 1 {
            let v = pixel(0);
            Rgb([v, v, v])
        } else {
            Rgb([pixel(0), pixel(1), pixel(2)])
        }
    });

    Ok(Some(image))
}
