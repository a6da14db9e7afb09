//! Device emulation primitives: the viewport metrics media queries see

use crate::Viewport;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetrics {
    pub width: u32,
    pub height: u32,
    pub dpr: f32,
    pub touch: bool,
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Viewport::default().into()
    }
}

impl From<Viewport> for DeviceMetrics {
    fn from(v: Viewport) -> Self {
        DeviceMetrics {
            width: v.width,
            height: v.height,
            dpr: 1.0,
            touch: false,
        }
    }
}

/// Hosts that can change the emulated device at runtime (window resize,
/// rotation, zoom). Implementations re-evaluate their media listeners.
pub trait DeviceEmulation: Send + Sync {
    fn set_metrics(&self, m: DeviceMetrics);
    fn metrics(&self) -> DeviceMetrics;
}
