//! Cached spatial regions and point-to-channel lookup.

use tracing::{error, warn};

use crate::protocol::{GLOBAL_CHANNEL_ID, SpatialInfo, SpatialRegion};

/// Why a point could not be mapped to a spatial channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialLookupError {
    /// No region list has been received yet.
    #[error("no spatial regions known yet")]
    NoRegions,

    /// No known region contains the point.
    #[error("no spatial region contains ({x}, {y}, {z})")]
    OutOfBounds {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
        /// Z coordinate.
        z: f64,
    },
}

/// The region list last pushed by the hub.
#[derive(Debug, Default, Clone)]
pub struct SpatialRegions {
    regions: Option<Vec<SpatialRegion>>,
}

impl SpatialRegions {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached regions.
    pub fn update(&mut self, regions: Vec<SpatialRegion>) {
        self.regions = Some(regions);
    }

    /// Forget every region.
    pub fn clear(&mut self) {
        self.regions = None;
    }

    /// The cached regions, if any were received.
    pub fn regions(&self) -> Option<&[SpatialRegion]> {
        self.regions.as_deref()
    }

    /// Find the channel whose region contains `point`.
    pub fn lookup(&self, point: &SpatialInfo) -> Result<u32, SpatialLookupError> {
        let regions = self.regions.as_ref().ok_or(SpatialLookupError::NoRegions)?;
        regions
            .iter()
            .find(|region| region.contains(point))
            .map(|region| region.channel_id)
            .ok_or(SpatialLookupError::OutOfBounds {
                x: point.x,
                y: point.y,
                z: point.z,
            })
    }

    /// Like [`lookup`](Self::lookup), falling back to the global channel.
    pub fn channel_at(&self, point: &SpatialInfo) -> u32 {
        match self.lookup(point) {
            Ok(channel_id) => channel_id,
            Err(e @ SpatialLookupError::NoRegions) => {
                error!("{}; using the global channel", e);
                GLOBAL_CHANNEL_ID
            }
            Err(e) => {
                warn!("{}; using the global channel", e);
                GLOBAL_CHANNEL_ID
            }
        }
    }
}
