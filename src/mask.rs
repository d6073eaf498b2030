//! Label masks and the morphological cleanup applied to them.

use std::path::Path;

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::error::Result;
use crate::report::ensure_parent_dir;

/// 2D label grid. 0 is background, anything else is a region or class id.
pub type Mask = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Per-pixel foreground probabilities in `[0, 1]`.
pub type ProbabilityMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Number of non-background pixels.
pub fn foreground_count(mask: &Mask) -> usize {
    mask.as_raw().iter().filter(|&&v| v != 0).count()
}

pub fn is_empty(mask: &Mask) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}

/// Foreground as a 0/255 binary image.
pub fn binarize(mask: &Mask) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] != 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Mask from an 8-bit label image, keeping the label values.
pub fn from_gray(gray: &GrayImage) -> Mask {
    Mask::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as u32])
    })
}

/// Mask from a 16-bit label image, keeping the label values.
pub fn from_gray16(gray: &ImageBuffer<Luma<u16>, Vec<u16>>) -> Mask {
    Mask::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as u32])
    })
}

/// Binary mask (1 = foreground) from a probability map.
pub fn threshold(prob: &ProbabilityMap, thresh: f32) -> Mask {
    Mask::from_fn(prob.width(), prob.height(), |x, y| {
        if prob.get_pixel(x, y)[0] > thresh {
            Luma([1])
        } else {
            Luma([0])
        }
    })
}

/// 16-bit copy for writing label images to disk. Labels above `u16::MAX` saturate.
pub fn to_gray16(mask: &Mask) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    ImageBuffer::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([mask.get_pixel(x, y)[0].min(u16::MAX as u32) as u16])
    })
}

/// Read a label image. 16-bit images keep their full label range.
pub fn load_mask(path: &Path) -> Result<Mask> {
    let mask = match image::open(path)? {
        DynamicImage::ImageLuma16(gray) => from_gray16(&gray),
        other => from_gray(&other.to_luma8()),
    };
    Ok(mask)
}

/// Write a mask as a 16-bit label image.
pub fn save_mask(mask: &Mask, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    to_gray16(mask).save(path)?;
    Ok(())
}

/// Sizes of the labelled components, indexed by label (index 0 unused).
fn component_sizes(labels: &ImageBuffer<Luma<u32>, Vec<u32>>) -> Vec<u32> {
    let max_label = labels.as_raw().iter().copied().max().unwrap_or(0);
    let mut sizes = vec![0u32; max_label as usize + 1];
    for &l in labels.as_raw() {
        if l != 0 {
            sizes[l as usize] += 1;
        }
    }
    sizes
}

/// Clear foreground components smaller than `min_size` pixels.
///
/// Returns the number of removed components.
pub fn remove_small_objects(mask: &mut Mask, min_size: u32, connectivity: Connectivity) -> usize {
    if min_size == 0 {
        return 0;
    }
    let labels = connected_components(&binarize(mask), connectivity, Luma([0u8]));
    let sizes = component_sizes(&labels);
    let removed = sizes.iter().skip(1).filter(|&&s| s > 0 && s < min_size).count();
    if removed == 0 {
        return 0;
    }

    for (px, l) in mask.pixels_mut().zip(labels.pixels()) {
        let l = l[0] as usize;
        if l != 0 && sizes[l] < min_size {
            px[0] = 0;
        }
    }
    removed
}

/// Fill background components (4-connected) smaller than `area_threshold`
/// pixels, including ones touching the image border.
///
/// Filled pixels are set to 1. Returns the number of filled holes.
pub fn fill_small_holes(mask: &mut Mask, area_threshold: u32) -> usize {
    if area_threshold == 0 {
        return 0;
    }
    let inverted = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] == 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let holes = connected_components(&inverted, Connectivity::Four, Luma([0u8]));
    let sizes = component_sizes(&holes);
    let filled = sizes.iter().skip(1).filter(|&&s| s > 0 && s < area_threshold).count();
    if filled == 0 {
        return 0;
    }

    for (px, l) in mask.pixels_mut().zip(holes.pixels()) {
        let l = l[0] as usize;
        if l != 0 && sizes[l] < area_threshold {
            px[0] = 1;
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(mask: &mut Mask, x0: u32, y0: u32, side: u32, value: u32) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                mask.put_pixel(x, y, Luma([value]));
            }
        }
    }

    #[test]
    fn test_empty_mask() {
        let mask = Mask::new(8, 8);
        assert!(is_empty(&mask));
        assert_eq!(foreground_count(&mask), 0);
    }

    #[test]
    fn test_remove_small_objects() {
        let mut mask = Mask::new(20, 20);
        square(&mut mask, 1, 1, 2, 1);
        square(&mut mask, 10, 10, 5, 1);
        let removed = remove_small_objects(&mut mask, 5, Connectivity::Eight);
        assert_eq!(removed, 1);
        assert_eq!(foreground_count(&mask), 25);
        assert_eq!(mask.get_pixel(1, 1)[0], 0);
    }

    #[test]
    fn test_fill_small_holes_keeps_large_background() {
        let mut mask = Mask::new(20, 20);
        square(&mut mask, 5, 5, 7, 3);
        mask.put_pixel(8, 8, Luma([0]));
        let filled = fill_small_holes(&mut mask, 10);
        assert_eq!(filled, 1);
        assert_eq!(mask.get_pixel(8, 8)[0], 1);
        // Outer background is far larger than the threshold.
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let prob = ProbabilityMap::from_fn(3, 1, |x, _| Luma([x as f32 * 0.25]));
        let mask = threshold(&prob, 0.25);
        assert_eq!(mask.as_raw(), &vec![0, 0, 1]);
    }

    #[test]
    fn test_save_and_load_keep_large_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.png");
        let mut mask = Mask::new(6, 4);
        mask.put_pixel(2, 1, Luma([300]));
        save_mask(&mask, &path).unwrap();
        let back = load_mask(&path).unwrap();
        assert_eq!(back.get_pixel(2, 1)[0], 300);
        assert_eq!(foreground_count(&back), 1);
    }
}
