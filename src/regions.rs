//! Region extraction and size/shape filtering.

use std::f64::consts::{PI, SQRT_2};

use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::mask::{self, Mask};

/// Axis-aligned bounding box in pixel coordinates. Max values are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_row: u32,
    pub min_col: u32,
    pub max_row: u32,
    pub max_col: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.max_col - self.min_col
    }

    pub fn height(&self) -> u32 {
        self.max_row - self.min_row
    }

    /// Rectangle corners as (row, col), clockwise from the top left.
    pub fn corners(&self) -> [(u32, u32); 4] {
        [
            (self.min_row, self.min_col),
            (self.min_row, self.max_col),
            (self.max_row, self.max_col),
            (self.max_row, self.min_col),
        ]
    }
}

/// A connected foreground component and its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: u32,
    pub bbox: BoundingBox,
    pub area: u32,
    pub perimeter: f64,
    pub circularity: f64,
    /// (row, col)
    pub centroid: (f64, f64),
}

/// Settings for connected-component extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub connectivity: Connectivity,
    /// Rewrite the caller's mask: fill holes, drop small objects, store dense ids.
    pub relabel: bool,
    /// Background components smaller than this are filled when relabeling.
    pub hole_area_threshold: u32,
    /// Foreground components smaller than this are removed when relabeling.
    pub min_object_size: u32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            connectivity: Connectivity::Eight,
            relabel: true,
            hole_area_threshold: 0,
            min_object_size: 0,
        }
    }
}

/// Regions of one mask together with the component map they refer to.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub regions: Vec<Region>,
    /// Dense component ids, same dimensions as the input mask.
    pub labels: Mask,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Label the connected components of `mask` and measure each one.
///
/// Region ids are assigned densely (1..=n) in raster order of each
/// component's first pixel. With `relabel` set the mask itself is cleaned
/// up and overwritten with those ids. A mask without foreground yields an
/// empty extraction.
pub fn extract_regions(mask: &mut Mask, options: &ExtractOptions) -> Extraction {
    let (width, height) = mask.dimensions();
    if mask::is_empty(mask) {
        return Extraction {
            regions: Vec::new(),
            labels: Mask::new(width, height),
        };
    }

    if options.relabel {
        let filled = mask::fill_small_holes(mask, options.hole_area_threshold);
        let removed = mask::remove_small_objects(mask, options.min_object_size, options.connectivity);
        log::debug!("Filled {} holes, removed {} small objects", filled, removed);
    }

    let raw = connected_components(&mask::binarize(mask), options.connectivity, Luma([0u8]));

    // Remap to dense ids in raster order so ids do not depend on the labelling backend.
    let mut remap: Vec<u32> = Vec::new();
    let mut next_id = 0u32;
    let labels = Mask::from_fn(width, height, |x, y| {
        let l = raw.get_pixel(x, y)[0] as usize;
        if l == 0 {
            return Luma([0]);
        }
        if remap.len() <= l {
            remap.resize(l + 1, 0);
        }
        if remap[l] == 0 {
            next_id += 1;
            remap[l] = next_id;
        }
        Luma([remap[l]])
    });

    if options.relabel {
        mask.copy_from_slice(labels.as_raw());
    }

    let regions = measure_regions(&labels, next_id);
    log::debug!("Extracted {} regions from {}x{} mask", regions.len(), width, height);
    Extraction { regions, labels }
}

struct Accumulator {
    min_row: u32,
    min_col: u32,
    max_row: u32,
    max_col: u32,
    area: u32,
    row_sum: f64,
    col_sum: f64,
}

fn measure_regions(labels: &Mask, count: u32) -> Vec<Region> {
    let mut acc: Vec<Option<Accumulator>> = (0..=count).map(|_| None).collect();

    for (x, y, px) in labels.enumerate_pixels() {
        let l = px[0] as usize;
        if l == 0 {
            continue;
        }
        let a = acc[l].get_or_insert(Accumulator {
            min_row: y,
            min_col: x,
            max_row: y,
            max_col: x,
            area: 0,
            row_sum: 0.0,
            col_sum: 0.0,
        });
        a.min_row = a.min_row.min(y);
        a.min_col = a.min_col.min(x);
        a.max_row = a.max_row.max(y);
        a.max_col = a.max_col.max(x);
        a.area += 1;
        a.row_sum += y as f64;
        a.col_sum += x as f64;
    }

    acc.into_iter()
        .enumerate()
        .filter_map(|(id, a)| a.map(|a| (id as u32, a)))
        .map(|(id, a)| {
            let bbox = BoundingBox {
                min_row: a.min_row,
                min_col: a.min_col,
                max_row: a.max_row + 1,
                max_col: a.max_col + 1,
            };
            let perimeter = region_perimeter(labels, id, &bbox);
            Region {
                id,
                bbox,
                area: a.area,
                perimeter,
                circularity: circularity(a.area, perimeter),
                centroid: (a.row_sum / a.area as f64, a.col_sum / a.area as f64),
            }
        })
        .collect()
}

fn region_perimeter(labels: &Mask, id: u32, bbox: &BoundingBox) -> f64 {
    let w = bbox.width() as usize;
    let h = bbox.height() as usize;
    let mut grid = vec![false; w * h];
    for row in 0..h {
        for col in 0..w {
            let px = labels.get_pixel(bbox.min_col + col as u32, bbox.min_row + row as u32);
            grid[row * w + col] = px[0] == id;
        }
    }
    perimeter(&grid, w, h)
}

/// Perimeter estimate of a binary shape using 4-connected border pixels.
///
/// Each border pixel is weighted by the layout of its bordering
/// neighbours: straight runs count 1, diagonal runs √2 and corners
/// (1 + √2) / 2. Isolated pixels and line ends contribute nothing.
pub fn perimeter(grid: &[bool], width: usize, height: usize) -> f64 {
    let at = |r: isize, c: isize| -> bool {
        r >= 0
            && c >= 0
            && (r as usize) < height
            && (c as usize) < width
            && grid[r as usize * width + c as usize]
    };

    let mut border = vec![false; width * height];
    for r in 0..height as isize {
        for c in 0..width as isize {
            if at(r, c) && !(at(r - 1, c) && at(r + 1, c) && at(r, c - 1) && at(r, c + 1)) {
                border[r as usize * width + c as usize] = true;
            }
        }
    }
    let is_border = |r: isize, c: isize| -> bool {
        r >= 0
            && c >= 0
            && (r as usize) < height
            && (c as usize) < width
            && border[r as usize * width + c as usize]
    };

    let corner = (1.0 + SQRT_2) / 2.0;
    let mut total = 0.0;
    for r in 0..height as isize {
        for c in 0..width as isize {
            if !is_border(r, c) {
                continue;
            }
            let straight = [(r - 1, c), (r + 1, c), (r, c - 1), (r, c + 1)]
                .iter()
                .filter(|&&(rr, cc)| is_border(rr, cc))
                .count();
            let diagonal = [(r - 1, c - 1), (r - 1, c + 1), (r + 1, c - 1), (r + 1, c + 1)]
                .iter()
                .filter(|&&(rr, cc)| is_border(rr, cc))
                .count();
            total += match 1 + 2 * straight + 10 * diagonal {
                5 | 7 | 15 | 17 | 25 | 27 => 1.0,
                21 | 33 => SQRT_2,
                13 | 23 => corner,
                _ => 0.0,
            };
        }
    }
    total
}

/// `4π·area / perimeter²` clamped to `[0, 1]`. Zero perimeter gives 0.
pub fn circularity(area: u32, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    (4.0 * PI * area as f64 / (perimeter * perimeter)).clamp(0.0, 1.0)
}

/// Size and shape bounds applied to extracted regions. Both area bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterBounds {
    pub min_area: u32,
    pub max_area: u32,
    pub min_circularity: f64,
}

impl FilterBounds {
    pub fn accepts(&self, region: &Region) -> bool {
        region.perimeter > 0.0
            && region.area >= self.min_area
            && region.area <= self.max_area
            && region.circularity >= self.min_circularity
    }
}

/// Regions inside `bounds`, in their original order.
pub fn filter_regions(regions: &[Region], bounds: &FilterBounds) -> Vec<Region> {
    let kept: Vec<Region> = regions.iter().filter(|r| bounds.accepts(r)).cloned().collect();
    log::debug!(
        "Region filter kept {} of {} (area {}..={}, circularity >= {:.2})",
        kept.len(),
        regions.len(),
        bounds.min_area,
        bounds.max_area,
        bounds.min_circularity
    );
    kept
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Paint a filled disk with the given value.
    pub(crate) fn draw_disk(mask: &mut Mask, cx: i64, cy: i64, radius: i64, value: u32) {
        for y in 0..mask.height() as i64 {
            for x in 0..mask.width() as i64 {
                let (dx, dy) = (x - cx, y - cy);
                if dx * dx + dy * dy <= radius * radius {
                    mask.put_pixel(x as u32, y as u32, Luma([value]));
                }
            }
        }
    }

    #[test]
    fn test_empty_mask_gives_no_regions() {
        let mut mask = Mask::new(32, 32);
        let extraction = extract_regions(&mut mask, &ExtractOptions::default());
        assert!(extraction.is_empty());
    }

    #[test]
    fn test_dense_ids_and_geometry() {
        let mut mask = Mask::new(40, 40);
        draw_disk(&mut mask, 30, 30, 4, 9);
        draw_disk(&mut mask, 8, 8, 3, 9);
        let extraction = extract_regions(&mut mask, &ExtractOptions::default());

        let ids: Vec<u32> = extraction.regions.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        let first = &extraction.regions[0];
        assert_eq!(
            first.bbox,
            BoundingBox { min_row: 5, min_col: 5, max_row: 12, max_col: 12 }
        );
        assert!((first.centroid.0 - 8.0).abs() < 1e-9);
        assert!((first.centroid.1 - 8.0).abs() < 1e-9);
        // Relabeling rewrote the caller's mask.
        assert_eq!(mask.get_pixel(30, 30)[0], 2);
    }

    #[test]
    fn test_no_relabel_leaves_mask_untouched() {
        let mut mask = Mask::new(20, 20);
        draw_disk(&mut mask, 10, 10, 3, 7);
        let before = mask.clone();
        let options = ExtractOptions { relabel: false, ..Default::default() };
        let extraction = extract_regions(&mut mask, &options);
        assert_eq!(extraction.regions.len(), 1);
        assert_eq!(mask, before);
        assert_eq!(extraction.labels.get_pixel(10, 10)[0], 1);
    }

    #[test]
    fn test_disk_is_nearly_circular() {
        let mut mask = Mask::new(64, 64);
        draw_disk(&mut mask, 32, 32, 12, 1);
        let extraction = extract_regions(&mut mask, &ExtractOptions::default());
        let disk = &extraction.regions[0];
        assert!(disk.circularity > 0.85, "circularity {}", disk.circularity);
        assert!(disk.circularity <= 1.0);
    }

    #[test]
    fn test_elongated_shape_is_not_circular() {
        let mut mask = Mask::new(64, 10);
        for x in 2..62 {
            for y in 4..7 {
                mask.put_pixel(x, y, Luma([1]));
            }
        }
        let extraction = extract_regions(&mut mask, &ExtractOptions::default());
        assert!(extraction.regions[0].circularity < 0.3);
    }

    #[test]
    fn test_single_pixel_has_zero_perimeter() {
        assert_eq!(perimeter(&[true], 1, 1), 0.0);
        assert_eq!(circularity(1, 0.0), 0.0);
        let region = Region {
            id: 1,
            bbox: BoundingBox { min_row: 0, min_col: 0, max_row: 1, max_col: 1 },
            area: 1,
            perimeter: 0.0,
            circularity: 0.0,
            centroid: (0.0, 0.0),
        };
        let permissive = FilterBounds { min_area: 0, max_area: u32::MAX, min_circularity: 0.0 };
        assert!(!permissive.accepts(&region));
    }

    #[test]
    fn test_filter_bounds_inclusive_and_idempotent() {
        let mut mask = Mask::new(80, 80);
        draw_disk(&mut mask, 20, 20, 5, 1);
        draw_disk(&mut mask, 60, 60, 8, 1);
        let extraction = extract_regions(&mut mask, &ExtractOptions::default());
        let small_area = extraction.regions[0].area;

        let bounds = FilterBounds { min_area: small_area, max_area: small_area, min_circularity: 0.0 };
        let once = filter_regions(&extraction.regions, &bounds);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].area, small_area);

        let twice = filter_regions(&once, &bounds);
        assert_eq!(once, twice);
    }
}
