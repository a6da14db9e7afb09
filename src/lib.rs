//! RFox Image
//!
//! Lazy, media-query driven responsive images for component hosts. A
//! [`ResponsiveImage`] waits until its container scrolls into view, picks the
//! source whose media query matches the viewport, and loads it through a
//! de-duplicating [`ResourceCache`], rendering a fallback until the image is
//! ready.
//!
//! # Example
//!
//! ```no_run
//! use rfimage::fetch::ManualFetcher;
//! use rfimage::platform::{ElementId, EmulatedPlatform, NodeRef, Rect};
//! use rfimage::{ImageEnv, ImageProps, ResourceCache, ResponsiveImage, Source};
//! use std::sync::Arc;
//!
//! let platform = EmulatedPlatform::default();
//! let cache = ResourceCache::new(Arc::new(ManualFetcher::auto_succeed()));
//! let env = ImageEnv::from_platform(&platform, cache);
//!
//! let container = NodeRef::attached(ElementId(1));
//! platform.intersection().place(ElementId(1), Rect::new(0, 0, 400, 300));
//!
//! let props = ImageProps::new(container)
//!     .src("small.jpg")
//!     .sources(vec![Source::new("large.jpg", "(min-width: 1200px)")])
//!     .alt("A lighthouse")
//!     .fallback("<span>loading</span>");
//! let image = ResponsiveImage::mount(props, env);
//! println!("{}", image.render_or_fallback().to_html());
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub mod error;
pub use error::{Error, ImageError, Result};

pub mod cache;
pub mod fetch;
pub mod img;
pub mod media_query;
pub mod platform;
pub mod subscription;
pub mod suspended;

pub use cache::{LoadResult, ResourceCache, Settled};
pub use img::{ImageEnv, ImageProps, ImageState, Rendered, ResponsiveImage, Source};
pub use subscription::Subscription;
pub use suspended::{ImageElement, Suspense, SuspendedImage};

/// Lock a mutex, recovering the data if a panicking callback poisoned it
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration for image loading and the emulated platform
///
/// The defaults are conservative: no load timeout (a stalled load keeps the
/// component on its fallback), strict image content checks, and an observer
/// that fires as soon as a single pixel is visible.
///
/// # Examples
///
/// ```
/// let cfg = rfimage::ImageConfig::default();
/// assert!(cfg.user_agent.contains("RFOX"));
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// User agent string to send with image requests
    pub user_agent: String,
    /// Viewport dimensions
    pub viewport: Viewport,
    /// Device pixel ratio seen by `resolution` media queries
    pub device_pixel_ratio: f32,
    /// Per-request timeout in milliseconds (None => wait forever)
    pub timeout_ms: Option<u64>,
    /// Custom HTTP headers
    pub headers: HashMap<String, String>,
    /// Pixels added around the viewport when testing intersection
    pub root_margin: i32,
    /// Visible fraction of the container needed to count as intersecting
    pub threshold: f32,
    /// Reject responses that are not `image/*` or whose bytes are not a known
    /// image encoding
    pub verify_image_data: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/115.0 RFOX-Image/0.1".to_string(),
            viewport: Viewport::default(),
            device_pixel_ratio: 1.0,
            timeout_ms: None,
            headers: HashMap::new(),
            root_margin: 0,
            threshold: 0.0,
            verify_image_data: true,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::ConfigError(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if !(self.device_pixel_ratio > 0.0) {
            return Err(Error::ConfigError(format!(
                "device pixel ratio must be positive, got {}",
                self.device_pixel_ratio
            )));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::ConfigError("viewport must not be empty".into()));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::ConfigError("timeout_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}
