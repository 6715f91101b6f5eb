//! Kernel engine
//!
//! Pure convolution of a [`PixelGrid`] with a [`Kernel`]. Sampling past an
//! edge wraps around to the opposite edge of the grid that is passed in, so
//! a worker that only holds a band must be given enough overlap rows for the
//! wrap to never be taken vertically.

use std::ops::Range;

use crate::error::{Error, Result};
use crate::grid::PixelGrid;
use crate::kernel::{validate_multiplier, Kernel};

/// Toroidal index: `((v mod n) + n) mod n`
#[inline]
pub fn wrap(v: isize, n: usize) -> usize {
    v.rem_euclid(n as isize) as usize
}

/// Convolve the whole grid
pub fn apply(grid: &PixelGrid, kernel: &Kernel, multiplier: f32) -> Result<PixelGrid> {
    apply_rows(grid, kernel, multiplier, 0..grid.height())
}

/// Convolve only the rows in `rows`, sampling from the whole of `grid`
///
/// The result has `rows.len()` rows. Used by workers to filter the logical
/// part of a band while reading neighbors from its overlap rows.
pub fn apply_rows(
    grid: &PixelGrid,
    kernel: &Kernel,
    multiplier: f32,
    rows: Range<usize>,
) -> Result<PixelGrid> {
    validate_multiplier(multiplier)?;
    if rows.start > rows.end || rows.end > grid.height() {
        return Err(Error::InvalidPartition(format!(
            "output rows {:?} outside grid of height {}",
            rows,
            grid.height()
        )));
    }

    let width = grid.width();
    let height = grid.height();
    let size = kernel.size();
    let radius = kernel.radius() as isize;
    let mut out = PixelGrid::new(width, rows.len());

    for (out_y, y) in rows.enumerate() {
        for x in 0..width {
            let mut acc = [0f32; 3];
            for dk in 0..size {
                let sx = wrap(x as isize - radius + dk as isize, width);
                for dl in 0..size {
                    let sy = wrap(y as isize - radius + dl as isize, height);
                    let w = kernel.weight(dk, dl);
                    let px = grid.get(sx, sy);
                    acc[0] += px[0] as f32 * w;
                    acc[1] += px[1] as f32 * w;
                    acc[2] += px[2] as f32 * w;
                }
            }
            out.set(x, out_y, acc.map(|c| channel(c, multiplier)));
        }
    }

    Ok(out)
}

#[inline]
fn channel(acc: f32, multiplier: f32) -> u8 {
    (acc * multiplier).round().clamp(0.0, 255.0) as u8
}
