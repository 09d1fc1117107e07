//! Frame source abstraction.
//!
//! Provides the current input frame to the inference harness. Sources are
//! injected explicitly instead of being reached through a global accessor,
//! so the harness can run against a file, a capture callback or a test
//! stub alike. A source may have no frame available yet; consumers treat
//! that as "not ready", not as an error.

use anyhow::Context;
use image::RgbImage;

/// Capture callback yielding the most recent frame, if any.
pub type CaptureFn = Box<dyn Fn() -> Option<RgbImage> + Send + Sync>;

/// Provider of the current input frame.
pub trait FrameSource {
    /// Current frame, or `None` if the source has nothing to offer yet.
    fn current_frame(&self) -> Option<RgbImage>;
}

/// Source backed by a single image loaded from disk.
///
/// Returns the same frame on every tick, which is the useful mode for
/// reproducible model testing.
pub struct StaticImageSource {
    frame: RgbImage,
}

impl StaticImageSource {
    /// Load the image at `path` as the permanent frame.
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let frame = image::open(path)
            .with_context(|| format!("failed to open input image {}", path.display()))?
            .to_rgb8();

        log::info!(
            "Loaded static frame {} ({}x{})",
            path.display(),
            frame.width(),
            frame.height()
        );

        Ok(Self { frame })
    }

    /// Wrap an already-decoded frame.
    pub fn new(frame: RgbImage) -> Self {
        Self { frame }
    }
}

impl FrameSource for StaticImageSource {
    fn current_frame(&self) -> Option<RgbImage> {
        Some(self.frame.clone())
    }
}

/// Source backed by a capture callback.
pub struct CallbackSource {
    capture_fn: CaptureFn,
}

impl CallbackSource {
    /// Create a new instance.
    pub fn new(capture_fn: CaptureFn) -> Self {
        Self { capture_fn }
    }
}

impl FrameSource for CallbackSource {
    fn current_frame(&self) -> Option<RgbImage> {
        (*self.capture_fn)()
    }
}
