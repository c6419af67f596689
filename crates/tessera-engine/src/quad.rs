//! Tile identifiers for the two supported quad schemes.
//!
//! Both schemes address the same concept, a rectangular cell of a regular
//! grid at a fixed subdivision level, with different encodings:
//!
//! - [`MercatorQuad`]: base-4 quadkey string over the Web Mercator grid
//!   (row 0 at the north edge)
//! - [`HereQuad`]: decimal-encoded quadkey over the equirectangular grid
//!   (row 0 at the south edge). The decimal value is `4^level + m` where
//!   `m` interleaves the column bits (even positions) with the row bits
//!   (odd positions); the `4^level` term is the length sentinel.
//!
//! The database computes tile ids with its `here_quad`/`mercator_quad`
//! functions; this module is the engine-side mirror, needed to turn a tile
//! id back into the bounding box its per-task query filters by.

use std::f64::consts::PI;

/// Maximum subdivision level either codec accepts.
pub const MAX_CODEC_LEVEL: u8 = 26;

/// Errors raised by the tile-id codecs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuadError {
    /// The tile id string could not be parsed.
    #[error("invalid tile id {value:?}: {reason}")]
    InvalidTileId {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The subdivision level is outside the codec range.
    #[error("level {level} exceeds maximum {MAX_CODEC_LEVEL}")]
    LevelOutOfRange {
        /// The rejected level.
        level: u8,
    },

    /// Column or row exceeds the grid size at the given level.
    #[error("cell ({x}, {y}) does not exist at level {level}")]
    CellOutOfRange {
        /// Column index.
        x: u32,
        /// Row index.
        y: u32,
        /// Subdivision level.
        level: u8,
    },
}

/// A WGS84 bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    /// Western edge (minimum longitude).
    pub west: f64,
    /// Southern edge (minimum latitude).
    pub south: f64,
    /// Eastern edge (maximum longitude).
    pub east: f64,
    /// Northern edge (maximum latitude).
    pub north: f64,
}

fn check_cell(x: u32, y: u32, level: u8) -> Result<(), QuadError> {
    if level > MAX_CODEC_LEVEL {
        return Err(QuadError::LevelOutOfRange { level });
    }
    let n = 1u32 << level;
    if x >= n || y >= n {
        return Err(QuadError::CellOutOfRange { x, y, level });
    }
    Ok(())
}

/// A tile of the Web Mercator grid, addressed by base-4 quadkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MercatorQuad {
    x: u32,
    y: u32,
    level: u8,
}

impl MercatorQuad {
    /// Creates a tile from column, row and level.
    ///
    /// # Errors
    ///
    /// Returns an error if the cell does not exist at the given level.
    pub fn new(x: u32, y: u32, level: u8) -> Result<Self, QuadError> {
        check_cell(x, y, level)?;
        Ok(Self { x, y, level })
    }

    /// Parses a base-4 quadkey such as `"12033"`.
    ///
    /// # Errors
    ///
    /// Returns an error on empty input, non-base-4 digits, or excessive
    /// length.
    pub fn from_quadkey(key: &str) -> Result<Self, QuadError> {
        if key.is_empty() {
            return Err(QuadError::InvalidTileId {
                value: key.into(),
                reason: "empty quadkey",
            });
        }
        if key.len() > MAX_CODEC_LEVEL as usize {
            return Err(QuadError::InvalidTileId {
                value: key.into(),
                reason: "quadkey longer than the maximum level",
            });
        }

        let mut x = 0u32;
        let mut y = 0u32;
        for ch in key.chars() {
            let digit = match ch {
                '0'..='3' => ch as u32 - '0' as u32,
                _ => {
                    return Err(QuadError::InvalidTileId {
                        value: key.into(),
                        reason: "quadkey digits must be 0-3",
                    })
                }
            };
            x = (x << 1) | (digit & 1);
            y = (y << 1) | (digit >> 1);
        }

        #[allow(clippy::cast_possible_truncation)]
        let level = key.len() as u8;
        Ok(Self { x, y, level })
    }

    /// Returns the base-4 quadkey of this tile.
    #[must_use]
    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.level as usize);
        for depth in (0..self.level).rev() {
            let digit = (((self.y >> depth) & 1) << 1) | ((self.x >> depth) & 1);
            key.push(char::from(b'0' + u8::try_from(digit).unwrap_or(0)));
        }
        key
    }

    /// Column index.
    #[must_use]
    pub const fn x(&self) -> u32 {
        self.x
    }

    /// Row index (0 at the north edge).
    #[must_use]
    pub const fn y(&self) -> u32 {
        self.y
    }

    /// Subdivision level.
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    /// Returns the WGS84 bounding box of this tile.
    #[must_use]
    pub fn bounding_box(&self) -> Bbox {
        let n = f64::from(1u32 << self.level);
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
        Bbox {
            west: lon(f64::from(self.x)),
            south: lat(f64::from(self.y) + 1.0),
            east: lon(f64::from(self.x) + 1.0),
            north: lat(f64::from(self.y)),
        }
    }
}

/// A tile of the equirectangular grid, addressed by decimal quadkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HereQuad {
    x: u32,
    y: u32,
    level: u8,
}

impl HereQuad {
    /// Creates a tile from column, row and level.
    ///
    /// # Errors
    ///
    /// Returns an error if the cell does not exist at the given level.
    pub fn new(x: u32, y: u32, level: u8) -> Result<Self, QuadError> {
        check_cell(x, y, level)?;
        Ok(Self { x, y, level })
    }

    /// Parses a decimal tile id such as `"5141"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a decimal number carrying the
    /// length-sentinel bit.
    pub fn from_quad_id(id: &str) -> Result<Self, QuadError> {
        let numeric: u64 = id.parse().map_err(|_| QuadError::InvalidTileId {
            value: id.into(),
            reason: "tile id must be a decimal number",
        })?;
        if numeric == 0 {
            return Err(QuadError::InvalidTileId {
                value: id.into(),
                reason: "tile id 0 carries no sentinel",
            });
        }

        // Sentinel scheme: bit length is 2 * level + 1, top bit is the marker.
        let bits = 64 - numeric.leading_zeros();
        if (bits - 1) % 2 != 0 {
            return Err(QuadError::InvalidTileId {
                value: id.into(),
                reason: "tile id bit length does not match any level",
            });
        }
        let level = (bits - 1) / 2;
        if level > u32::from(MAX_CODEC_LEVEL) {
            return Err(QuadError::InvalidTileId {
                value: id.into(),
                reason: "tile id level exceeds the maximum",
            });
        }

        let morton = numeric - (1u64 << (2 * level));
        let mut x = 0u32;
        let mut y = 0u32;
        for depth in 0..level {
            x |= (((morton >> (2 * depth)) & 1) as u32) << depth;
            y |= (((morton >> (2 * depth + 1)) & 1) as u32) << depth;
        }

        #[allow(clippy::cast_possible_truncation)]
        let level = level as u8;
        Ok(Self { x, y, level })
    }

    /// Returns the decimal tile id of this tile.
    #[must_use]
    pub fn quad_id(&self) -> String {
        let mut morton = 0u64;
        for depth in 0..u32::from(self.level) {
            morton |= u64::from((self.x >> depth) & 1) << (2 * depth);
            morton |= u64::from((self.y >> depth) & 1) << (2 * depth + 1);
        }
        let numeric = (1u64 << (2 * u32::from(self.level))) | morton;
        numeric.to_string()
    }

    /// Column index.
    #[must_use]
    pub const fn x(&self) -> u32 {
        self.x
    }

    /// Row index (0 at the south edge).
    #[must_use]
    pub const fn y(&self) -> u32 {
        self.y
    }

    /// Subdivision level.
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    /// Returns the WGS84 bounding box of this tile.
    #[must_use]
    pub fn bounding_box(&self) -> Bbox {
        let n = f64::from(1u32 << self.level);
        let width = 360.0 / n;
        let height = 180.0 / n;
        let west = -180.0 + f64::from(self.x) * width;
        let south = -90.0 + f64::from(self.y) * height;
        Bbox {
            west,
            south,
            east: west + width,
            north: south + height,
        }
    }
}
