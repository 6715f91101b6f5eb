//! Work and result units exchanged between coordinator and workers
//!
//! A [`WorkUnit`] is self-describing: geometry, kernel, multiplier, codec and
//! the encoded band. A worker needs nothing else to produce a [`ResultUnit`].

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::grid::PixelGrid;
use crate::kernel::Kernel;
use crate::partition::Band;

/// Position of a band in the output image, plus the overlap shipped with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandGeometry {
    /// First logical row (inclusive)
    pub y_start: u32,

    /// Last logical row (exclusive)
    pub y_end: u32,

    /// Image width in pixels
    pub width: u32,

    /// Overlap rows above the logical rows
    pub overlap_top: u32,

    /// Overlap rows below the logical rows
    pub overlap_bottom: u32,
}

impl BandGeometry {
    /// Geometry of a partitioned band in an image of the given width
    pub fn from_band(band: &Band, width: usize) -> Result<Self> {
        let to_u32 = |v: usize, what: &str| {
            u32::try_from(v)
                .map_err(|_| Error::InvalidPartition(format!("{} {} too large", what, v)))
        };
        Ok(Self {
            y_start: to_u32(band.y_start, "row")?,
            y_end: to_u32(band.y_end, "row")?,
            width: to_u32(width, "width")?,
            overlap_top: to_u32(band.overlap_top, "overlap")?,
            overlap_bottom: to_u32(band.overlap_bottom, "overlap")?,
        })
    }

    /// Number of logical rows
    pub fn band_height(&self) -> u32 {
        self.y_end.saturating_sub(self.y_start)
    }

    /// Number of rows in the shipped window
    pub fn window_height(&self) -> Result<u32> {
        self.overlap_top
            .checked_add(self.band_height())
            .and_then(|rows| rows.checked_add(self.overlap_bottom))
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "overlap {}+{} around rows {}..{} overflows",
                    self.overlap_top, self.overlap_bottom, self.y_start, self.y_end
                ))
            })
    }

    /// Reject inverted ranges and windows whose height does not fit
    pub fn validate(&self) -> Result<()> {
        if self.y_end <= self.y_start {
            return Err(Error::Protocol(format!(
                "band rows {}..{} are empty or inverted",
                self.y_start, self.y_end
            )));
        }
        self.window_height().map(|_| ())
    }
}

/// Everything a worker needs to filter one band
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Where the band sits in the output image
    pub geometry: BandGeometry,

    /// Kernel weights
    pub kernel: Kernel,

    /// Scalar applied after the weighted sum
    pub multiplier: f32,

    /// Encoding of `payload`
    pub codec: Codec,

    /// Encoded window rows, overlap included
    pub payload: Vec<u8>,
}

impl WorkUnit {
    /// Cut a band's window out of `image` and encode it
    pub fn from_band(
        image: &PixelGrid,
        band: &Band,
        kernel: &Kernel,
        multiplier: f32,
        codec: Codec,
    ) -> Result<Self> {
        let window = image.gather_rows(band.fetch_rows(image.height()))?;
        Ok(Self {
            geometry: BandGeometry::from_band(band, image.width())?,
            kernel: kernel.clone(),
            multiplier,
            codec,
            payload: codec.encode(&window)?,
        })
    }

    /// Decode the window and check it matches the geometry
    pub fn decode_window(&self) -> Result<PixelGrid> {
        self.geometry.validate()?;
        let window_height = self.geometry.window_height()?;
        let window = self.codec.decode(&self.payload)?;
        expect_dimensions(&window, self.geometry.width as usize, window_height as usize)?;
        Ok(window)
    }
}

/// A filtered band, positioned for direct placement into the output
#[derive(Debug, Clone)]
pub struct ResultUnit {
    /// Geometry echoed from the work unit
    pub geometry: BandGeometry,

    /// Encoding of `payload`
    pub codec: Codec,

    /// Encoded logical rows only
    pub payload: Vec<u8>,
}

impl ResultUnit {
    /// Encode filtered rows for the given geometry
    pub fn new(geometry: BandGeometry, codec: Codec, filtered: &PixelGrid) -> Result<Self> {
        expect_dimensions(filtered, geometry.width as usize, geometry.band_height() as usize)?;
        Ok(Self {
            geometry,
            codec,
            payload: codec.encode(filtered)?,
        })
    }

    /// Decode the filtered rows and check they match the geometry
    pub fn decode(&self) -> Result<PixelGrid> {
        self.geometry.validate()?;
        let grid = self.codec.decode(&self.payload)?;
        expect_dimensions(
            &grid,
            self.geometry.width as usize,
            self.geometry.band_height() as usize,
        )?;
        Ok(grid)
    }
}

fn expect_dimensions(grid: &PixelGrid, width: usize, height: usize) -> Result<()> {
    if grid.width() != width || grid.height() != height {
        return Err(Error::Codec(format!(
            "decoded {}x{} band, expected {}x{}",
            grid.width(),
            grid.height(),
            width,
            height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{BandPartitioner, EdgePolicy};

    #[test]
    fn test_work_unit_carries_window() {
        let image = PixelGrid::from_fn(5, 8, |x, y| [x as u8, y as u8, 0]);
        let bands = BandPartitioner::new(EdgePolicy::Wrap).partition(8, 2, 1).unwrap();
        let kernel = Kernel::from_flat(3, vec![0.0; 9]).unwrap();

        let unit = WorkUnit::from_band(&image, &bands[1], &kernel, 1.0, Codec::Raw).unwrap();
        assert_eq!(unit.geometry.y_start, 4);
        assert_eq!(unit.geometry.band_height(), 4);
        assert_eq!(unit.geometry.window_height().unwrap(), 6);

        let window = unit.decode_window().unwrap();
        assert_eq!(window.get(0, 0), [0, 3, 0]);
        assert_eq!(window.get(0, 5), [0, 0, 0]);
    }

    #[test]
    fn test_result_rejects_wrong_dimensions() {
        let geometry = BandGeometry {
            y_start: 0,
            y_end: 2,
            width: 3,
            overlap_top: 0,
            overlap_bottom: 0,
        };
        assert!(ResultUnit::new(geometry, Codec::Png, &PixelGrid::new(3, 3)).is_err());

        let mut result = ResultUnit::new(geometry, Codec::Png, &PixelGrid::new(3, 2)).unwrap();
        assert_eq!(result.decode().unwrap(), PixelGrid::new(3, 2));

        result.payload = Codec::Png.encode(&PixelGrid::new(4, 2)).unwrap();
        assert!(matches!(result.decode(), Err(Error::Codec(_))));
    }

    #[test]
    fn test_inverted_geometry_is_rejected() {
        let geometry = BandGeometry {
            y_start: 5,
            y_end: 5,
            width: 1,
            overlap_top: 0,
            overlap_bottom: 0,
        };
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn test_overflowing_overlap_is_rejected() {
        let geometry = BandGeometry {
            y_start: 0,
            y_end: 4,
            width: 2,
            overlap_top: u32::MAX,
            overlap_bottom: 1,
        };
        assert!(matches!(geometry.window_height(), Err(Error::Protocol(_))));
        assert!(matches!(geometry.validate(), Err(Error::Protocol(_))));

        let unit = WorkUnit {
            geometry,
            kernel: Kernel::from_flat(1, vec![1.0]).unwrap(),
            multiplier: 1.0,
            codec: Codec::Raw,
            payload: Codec::Raw.encode(&PixelGrid::new(2, 4)).unwrap(),
        };
        assert!(matches!(unit.decode_window(), Err(Error::Protocol(_))));
    }
}
