//! RGB pixel grids
//!
//! A [`PixelGrid`] is a row-major raster of 8-bit RGB triples. It is owned by
//! exactly one party at a time: the coordinator before dispatch and after
//! collection, a worker while a band is being filtered.

use std::ops::Range;
use std::path::Path;

use image::RgbImage;

use crate::error::{Error, Result};

/// One RGB pixel
pub type Rgb = [u8; 3];

/// Width x height raster of RGB triples
#[derive(Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl PixelGrid {
    /// Create a black grid
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 3],
        }
    }

    /// Create a grid filled with a single color
    pub fn filled(width: usize, height: usize, color: Rgb) -> Self {
        let mut data = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            data.extend_from_slice(&color);
        }
        Self { width, height, data }
    }

    /// Wrap raw interleaved RGB bytes
    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(3))
            .ok_or_else(|| Error::Codec(format!("{}x{} RGB grid is too large", width, height)))?;
        if data.len() != expected {
            return Err(Error::Codec(format!(
                "expected {} bytes for {}x{} RGB, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Build a grid by evaluating `f(x, y)` for every pixel
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> Rgb) -> Self {
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self { width, height, data }
    }

    /// Load an image file and convert it to RGB8
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| {
            Error::Configuration(format!("cannot load image {}: {}", path.display(), e))
        })?;
        Ok(Self::from(image.to_rgb8()))
    }

    /// Save the grid; the format follows the file extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.to_rgb_image()?.save(path.as_ref())?;
        Ok(())
    }

    /// Convert into an `image` buffer
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
            .ok_or_else(|| Error::Codec("grid dimensions overflow image buffer".to_string()))
    }

    /// Grid width in pixels
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height in pixels
    pub fn height(&self) -> usize {
        self.height
    }

    /// Raw interleaved RGB bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the grid and return its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Read one pixel
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Rgb {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Write one pixel
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, rgb: Rgb) {
        let i = (y * self.width + x) * 3;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Bytes of a single row
    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.width * 3;
        &self.data[y * stride..(y + 1) * stride]
    }

    /// Copy a contiguous row range into a new grid
    pub fn rows(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.height {
            return Err(Error::InvalidPartition(format!(
                "row range {:?} outside grid of height {}",
                range, self.height
            )));
        }
        let stride = self.width * 3;
        Ok(Self {
            width: self.width,
            height: range.len(),
            data: self.data[range.start * stride..range.end * stride].to_vec(),
        })
    }

    /// Copy rows in the given order (indices may repeat) into a new grid
    pub fn gather_rows(&self, indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        let stride = self.width * 3;
        let mut data = Vec::new();
        let mut height = 0;
        for y in indices {
            if y >= self.height {
                return Err(Error::InvalidPartition(format!(
                    "row {} outside grid of height {}",
                    y, self.height
                )));
            }
            data.extend_from_slice(&self.data[y * stride..(y + 1) * stride]);
            height += 1;
        }
        Ok(Self {
            width: self.width,
            height,
            data,
        })
    }

    /// Overwrite rows starting at `y_start` with the contents of `band`
    pub fn write_rows(&mut self, y_start: usize, band: &PixelGrid) -> Result<()> {
        if band.width != self.width {
            return Err(Error::Codec(format!(
                "band width {} does not match grid width {}",
                band.width, self.width
            )));
        }
        if y_start + band.height > self.height {
            return Err(Error::InvalidPartition(format!(
                "band rows {}..{} outside grid of height {}",
                y_start,
                y_start + band.height,
                self.height
            )));
        }
        let stride = self.width * 3;
        self.data[y_start * stride..(y_start + band.height) * stride].copy_from_slice(&band.data);
        Ok(())
    }
}

impl From<RgbImage> for PixelGrid {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width: width as usize,
            height: height as usize,
            data: image.into_raw(),
        }
    }
}
