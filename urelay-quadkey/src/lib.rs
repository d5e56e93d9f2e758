//! Tile key lib for tagging relayed telemetry with the map tile it was
//! produced in.
//!
//! Keys follow the quadtree layout of the Web-Mercator slippy map: every
//! zoom level splits a tile in four, so a key is one base-4 digit per level,
//! most significant level first. Two positions share a key prefix exactly
//! when they share the enclosing tile at that shorter level, which lets a
//! consumer subscribe to an area with a prefix match on the `quadkeys`
//! message property.
//!
//! Only zoom levels 14 through 18 are produced (roughly 2.4 km down to 150 m
//! tiles at the equator). Anything outside that range is clamped.

use std::f64::consts::PI;

/// Lowest zoom level a key is generated for
pub const MIN_ZOOM: u8 = 14;
/// Highest zoom level a key is generated for
pub const MAX_ZOOM: u8 = 18;
/// Zoom level used by a freshly built encoder
pub const DEFAULT_ZOOM: u8 = 16;

const TILE_SIZE: u32 = 256;

// Bounds for the Mercator ratio (1 + sin) / (1 - sin). At exactly +/-90
// degrees the ratio is infinite or zero and ln() leaves the reals.
const MIN_MERCATOR_RATIO: f64 = f64::EPSILON;
const MAX_MERCATOR_RATIO: f64 = 1.0 / f64::EPSILON;

/// Maps a latitude / longitude pair to a quadtree tile key at a fixed zoom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileKeyEncoder {
    zoom: u8,
}

impl Default for TileKeyEncoder {
    fn default() -> Self {
        Self { zoom: DEFAULT_ZOOM }
    }
}

impl TileKeyEncoder {
    pub fn new(zoom: i32) -> Self {
        let mut encoder = Self::default();
        encoder.set_zoom(zoom);
        encoder
    }

    /// Set the zoom level, clamped to [`MIN_ZOOM`]..=[`MAX_ZOOM`]
    pub fn set_zoom(&mut self, zoom: i32) {
        self.zoom = zoom.clamp(MIN_ZOOM as i32, MAX_ZOOM as i32) as u8;
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// Width (and height) of the whole map in pixels at the current zoom
    pub fn map_size(&self) -> u32 {
        TILE_SIZE << self.zoom
    }

    /// Pixel coordinates of a position. Out of domain positions are pinned
    /// to the nearest edge pixel rather than wrapped.
    pub fn pixel_xy(&self, latitude: f64, longitude: f64) -> (u32, u32) {
        let x = (longitude + 180.0) / 360.0;
        let y = mercator_y(latitude);

        let map_size = self.map_size() as f64;
        let pixel_x = (x * map_size + 0.5).clamp(0.0, map_size - 1.0);
        let pixel_y = (y * map_size + 0.5).clamp(0.0, map_size - 1.0);

        (pixel_x as u32, pixel_y as u32)
    }

    /// Tile indices of a position at the current zoom
    pub fn tile_xy(&self, latitude: f64, longitude: f64) -> (u32, u32) {
        let (pixel_x, pixel_y) = self.pixel_xy(latitude, longitude);
        (pixel_x / TILE_SIZE, pixel_y / TILE_SIZE)
    }

    /// Tile key for a position: exactly `zoom` characters out of `0`..=`3`
    pub fn encode(&self, latitude: f64, longitude: f64) -> String {
        let (tile_x, tile_y) = self.tile_xy(latitude, longitude);

        (1..=self.zoom)
            .rev()
            .map(|level| {
                let mask = 1u32 << (level - 1);
                let mut digit = b'0';
                if tile_x & mask != 0 {
                    digit += 1;
                }
                if tile_y & mask != 0 {
                    digit += 2;
                }
                digit as char
            })
            .collect()
    }
}

/// Normalised Mercator y in map units (0 at the top edge, 1 at the bottom),
/// finite for any finite latitude
fn mercator_y(latitude: f64) -> f64 {
    let sin_latitude = (latitude * PI / 180.0).sin();
    let ratio = ((1.0 + sin_latitude) / (1.0 - sin_latitude))
        .clamp(MIN_MERCATOR_RATIO, MAX_MERCATOR_RATIO);
    0.5 - ratio.ln() / (4.0 * PI)
}
