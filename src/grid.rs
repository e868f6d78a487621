//! The working grid: geotransform, extent, alignment and common-region
//! derivation for heterogeneous raster inputs (spec §3, §4.1).

use crate::error::RiosError;
use serde::{Deserialize, Serialize};

/// Relative tolerance used to compare pixel sizes and origin offsets.
pub const GRID_TOLERANCE: f64 = 1e-6;

/// How the common region of several input grids is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FootprintMode {
    #[default]
    Intersection,
    Union,
    BoundsFromReference,
}

/// A six-parameter affine geotransform: origin x, pixel width, row-skew,
/// origin y, column-skew, pixel height. Pixel height is conventionally
/// negative for north-up rasters but the sign is not assumed anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_skew: f64,
    pub origin_y: f64,
    pub col_skew: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(
        origin_x: f64,
        pixel_width: f64,
        row_skew: f64,
        origin_y: f64,
        col_skew: f64,
        pixel_height: f64,
    ) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_skew,
            origin_y,
            col_skew,
            pixel_height,
        }
    }
}

/// The pixel grid onto which all inputs are reconciled and in which
/// outputs are produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelGrid {
    /// Opaque WKT-like projection identifier.
    pub projection: String,
    pub transform: GeoTransform,
    pub rows: u64,
    pub cols: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl PixelGrid {
    pub fn new(
        projection: impl Into<String>,
        transform: GeoTransform,
        rows: u64,
        cols: u64,
    ) -> Result<Self, RiosError> {
        if rows == 0 || cols == 0 {
            return Err(RiosError::Parameter {
                name: "rows/cols".into(),
                reason: "rows and columns must be positive".into(),
            });
        }
        if transform.pixel_width == 0.0 || transform.pixel_height == 0.0 {
            return Err(RiosError::Parameter {
                name: "pixel_width/pixel_height".into(),
                reason: "pixel dimensions must be non-zero".into(),
            });
        }
        Ok(Self {
            projection: projection.into(),
            transform,
            rows,
            cols,
        })
    }

    pub fn x_res(&self) -> f64 {
        self.transform.pixel_width.abs()
    }

    pub fn y_res(&self) -> f64 {
        self.transform.pixel_height.abs()
    }

    pub fn extent(&self) -> Extent {
        let t = &self.transform;
        let x0 = t.origin_x;
        let y0 = t.origin_y;
        let x1 = t.origin_x + self.cols as f64 * t.pixel_width;
        let y1 = t.origin_y + self.rows as f64 * t.pixel_height;
        Extent {
            x_min: x0.min(x1),
            y_min: y0.min(y1),
            x_max: x0.max(x1),
            y_max: y0.max(y1),
        }
    }

    /// Two grids are comparable iff their projections match and their
    /// pixel sizes agree within [`GRID_TOLERANCE`] relative tolerance.
    pub fn comparable(&self, other: &PixelGrid) -> bool {
        if self.projection != other.projection {
            return false;
        }
        relative_eq(self.x_res(), other.x_res()) && relative_eq(self.y_res(), other.y_res())
    }

    /// Two comparable grids are aligned iff the offset between their
    /// origins is an integer multiple of the pixel size within tolerance.
    pub fn aligned(&self, other: &PixelGrid) -> bool {
        if !self.comparable(other) {
            return false;
        }
        let dx = (self.transform.origin_x - other.transform.origin_x) / self.transform.pixel_width;
        let dy = (self.transform.origin_y - other.transform.origin_y) / self.transform.pixel_height;
        is_near_integer(dx) && is_near_integer(dy)
    }

    /// Snap an extent's edges outward to this grid's origin at this grid's
    /// resolution, producing row/column-aligned bounds.
    pub fn snap_extent(&self, extent: Extent) -> Extent {
        let t = &self.transform;
        let xres = t.pixel_width.abs();
        let yres = t.pixel_height.abs();
        let snap_down = |v: f64, origin: f64, res: f64| origin + ((v - origin) / res).floor() * res;
        let snap_up = |v: f64, origin: f64, res: f64| origin + ((v - origin) / res).ceil() * res;
        Extent {
            x_min: snap_down(extent.x_min, t.origin_x, xres),
            x_max: snap_up(extent.x_max, t.origin_x, xres),
            y_min: snap_down(extent.y_min, t.origin_y, yres),
            y_max: snap_up(extent.y_max, t.origin_y, yres),
        }
    }

    /// Build a new grid sharing this grid's projection/resolution/alignment
    /// but covering `extent`.
    pub fn with_extent(&self, extent: Extent) -> Result<PixelGrid, RiosError> {
        let snapped = self.snap_extent(extent);
        let t = &self.transform;
        let xres = t.pixel_width.abs();
        let yres = t.pixel_height.abs();
        let cols = ((snapped.x_max - snapped.x_min) / xres).round() as u64;
        let rows = ((snapped.y_max - snapped.y_min) / yres).round() as u64;
        let new_transform = GeoTransform {
            origin_x: snapped.x_min,
            pixel_width: xres,
            row_skew: t.row_skew,
            origin_y: snapped.y_max,
            col_skew: t.col_skew,
            pixel_height: -yres,
        };
        PixelGrid::new(self.projection.clone(), new_transform, rows.max(1), cols.max(1))
    }
}

fn relative_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() / scale <= GRID_TOLERANCE
}

fn is_near_integer(v: f64) -> bool {
    (v - v.round()).abs() <= GRID_TOLERANCE
}

/// Derive the common working grid from a non-empty list of input grids
/// under the given footprint mode, optionally anchored to a reference grid
/// (spec §4.1).
///
/// - If `reference` is supplied, its projection and resolution are adopted.
/// - Otherwise, all grids must be mutually comparable and aligned, in which
///   case the first grid is adopted as the reference; if not,
///   [`RiosError::ResampleNeeded`] is returned.
/// - The common region is then computed by `mode` and snapped to the
///   reference grid's origin at the reference grid's resolution.
pub fn find_common_region(
    grids: &[PixelGrid],
    mode: FootprintMode,
    reference: Option<&PixelGrid>,
) -> Result<PixelGrid, RiosError> {
    if grids.is_empty() {
        return Err(RiosError::Parameter {
            name: "grids".into(),
            reason: "at least one raster input is required to derive a working grid".into(),
        });
    }

    let reference_grid: PixelGrid = match reference {
        Some(r) => r.clone(),
        None => {
            let first = &grids[0];
            for g in &grids[1..] {
                if !first.comparable(g) || !first.aligned(g) {
                    return Err(RiosError::ResampleNeeded);
                }
            }
            first.clone()
        }
    };

    if matches!(mode, FootprintMode::BoundsFromReference) {
        let reference_for_bounds = reference.ok_or_else(|| RiosError::Parameter {
            name: "reference".into(),
            reason: "bounds-from-reference footprint requires a reference grid".into(),
        })?;
        return reference_grid.with_extent(reference_for_bounds.extent());
    }

    let mut iter = grids.iter().map(|g| g.extent());
    let mut acc = iter.next().unwrap();
    for e in iter {
        acc = match mode {
            FootprintMode::Intersection => Extent {
                x_min: acc.x_min.max(e.x_min),
                y_min: acc.y_min.max(e.y_min),
                x_max: acc.x_max.min(e.x_max),
                y_max: acc.y_max.min(e.y_max),
            },
            FootprintMode::Union => Extent {
                x_min: acc.x_min.min(e.x_min),
                y_min: acc.y_min.min(e.y_min),
                x_max: acc.x_max.max(e.x_max),
                y_max: acc.y_max.max(e.y_max),
            },
            FootprintMode::BoundsFromReference => unreachable!(),
        };
    }

    if acc.x_max <= acc.x_min || acc.y_max <= acc.y_min {
        return Err(RiosError::EmptyIntersection);
    }

    reference_grid.with_extent(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(origin_x: f64, origin_y: f64, xres: f64, yres: f64, rows: u64, cols: u64) -> PixelGrid {
        PixelGrid::new(
            "EPSG:32601",
            GeoTransform::new(origin_x, xres, 0.0, origin_y, 0.0, -yres),
            rows,
            cols,
        )
        .unwrap()
    }

    #[test]
    fn comparable_requires_matching_projection_and_resolution() {
        let a = grid(0.0, 100.0, 1.0, 1.0, 100, 100);
        let b = grid(5.0, 100.0, 1.0, 1.0, 100, 100);
        assert!(a.comparable(&b));
        let c = grid(5.0, 100.0, 2.0, 1.0, 100, 100);
        assert!(!a.comparable(&c));
    }

    #[test]
    fn aligned_requires_integer_pixel_offset() {
        let a = grid(0.0, 100.0, 1.0, 1.0, 100, 100);
        let b = grid(5.0, 100.0, 1.0, 1.0, 100, 100);
        assert!(a.aligned(&b));
        let c = grid(5.5, 100.0, 1.0, 1.0, 100, 100);
        assert!(!a.aligned(&c));
    }

    #[test]
    fn intersection_of_identical_grids_is_itself() {
        let a = grid(0.0, 100.0, 1.0, 1.0, 100, 100);
        let result = find_common_region(&[a.clone(), a.clone()], FootprintMode::Intersection, None).unwrap();
        assert_eq!(result.rows, 100);
        assert_eq!(result.cols, 100);
    }

    #[test]
    fn disjoint_intersection_fails() {
        let a = grid(0.0, 100.0, 1.0, 1.0, 10, 10);
        let b = grid(1000.0, 1100.0, 1.0, 1.0, 10, 10);
        let err = find_common_region(&[a, b], FootprintMode::Intersection, None).unwrap_err();
        assert!(matches!(err, RiosError::EmptyIntersection));
    }

    #[test]
    fn incomparable_grids_without_reference_need_resample() {
        let a = grid(0.0, 100.0, 1.0, 1.0, 100, 100);
        let b = grid(0.0, 100.0, 2.0, 2.0, 50, 50);
        let err = find_common_region(&[a, b], FootprintMode::Intersection, None).unwrap_err();
        assert!(matches!(err, RiosError::ResampleNeeded));
    }
}
