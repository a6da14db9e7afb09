//! Host platform surface: viewport media queries, intersection detection and
//! device emulation.
//!
//! The image component only talks to these traits, so a real host can plug
//! in its own facilities. `EmulatedPlatform` is the deterministic in-process
//! implementation used by the CLI and the tests.

pub mod device;
pub mod intersection;
pub mod media;

pub use device::{DeviceEmulation, DeviceMetrics};
pub use intersection::{
    ElementId, EmulatedIntersection, IntersectionCallback, IntersectionEntry, IntersectionWatcher,
    NodeRef, ObserverOptions, Rect,
};
pub use media::{EmulatedMedia, MediaListener, MediaMatcher};

use crate::{ImageConfig, Viewport};
use std::sync::Arc;

/// A small composite trait that hosts implement to hand platform primitives
/// to image components in a typed way.
pub trait PlatformApi: Send + Sync {
    fn media_matcher(&self) -> Arc<dyn MediaMatcher>;
    fn intersection_watcher(&self) -> Arc<dyn IntersectionWatcher>;
    fn device_emulation(&self) -> Arc<dyn DeviceEmulation>;
}

/// Emulated media + intersection sharing one viewport.
///
/// Changing the device metrics through `DeviceEmulation` resizes the
/// intersection root as well, so both facilities agree on the viewport.
#[derive(Clone)]
pub struct EmulatedPlatform {
    media: EmulatedMedia,
    intersection: EmulatedIntersection,
}

impl EmulatedPlatform {
    pub fn new(config: &ImageConfig) -> Self {
        let metrics = DeviceMetrics {
            width: config.viewport.width,
            height: config.viewport.height,
            dpr: config.device_pixel_ratio,
            touch: false,
        };
        let options = ObserverOptions {
            root_margin: config.root_margin,
            threshold: config.threshold,
        };
        EmulatedPlatform {
            media: EmulatedMedia::new(metrics),
            intersection: EmulatedIntersection::new(config.viewport, options),
        }
    }

    pub fn media(&self) -> &EmulatedMedia {
        &self.media
    }

    pub fn intersection(&self) -> &EmulatedIntersection {
        &self.intersection
    }

    /// Resize the viewport, keeping dpr and touch
    pub fn resize(&self, width: u32, height: u32) {
        let mut m = self.metrics();
        m.width = width;
        m.height = height;
        self.set_metrics(m);
    }
}

impl Default for EmulatedPlatform {
    fn default() -> Self {
        Self::new(&ImageConfig::default())
    }
}

impl DeviceEmulation for EmulatedPlatform {
    fn set_metrics(&self, m: DeviceMetrics) {
        let viewport = Viewport {
            width: m.width,
            height: m.height,
        };
        self.media.set_metrics(m);
        self.intersection.set_viewport(viewport);
    }

    fn metrics(&self) -> DeviceMetrics {
        self.media.metrics()
    }
}

impl PlatformApi for EmulatedPlatform {
    fn media_matcher(&self) -> Arc<dyn MediaMatcher> {
        Arc::new(self.media.clone())
    }

    fn intersection_watcher(&self) -> Arc<dyn IntersectionWatcher> {
        Arc::new(self.intersection.clone())
    }

    fn device_emulation(&self) -> Arc<dyn DeviceEmulation> {
        Arc::new(self.clone())
    }
}
