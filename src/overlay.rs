//! False-color overlays and region shape layers.

use std::path::Path;

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_ellipse_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use serde::Serialize;

use crate::classes::{ClassColors, ClassId};
use crate::classify::ClassPrediction;
use crate::config::ShapeKind;
use crate::error::{AnalysisError, Result};
use crate::mask::Mask;
use crate::regions::{BoundingBox, Region};
use crate::report::ensure_parent_dir;

/// Weight of the class color in blended region pixels.
pub const OVERLAY_ALPHA: f32 = 0.5;

const EDGE_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Blend class colors into `image` wherever `mask` is non-zero.
///
/// `mask` holds class ids (as left by an in-place relabel). Background
/// pixels keep the original intensity.
pub fn render_overlay(image: &GrayImage, mask: &Mask, colors: &ClassColors) -> Result<RgbImage> {
    if image.dimensions() != mask.dimensions() {
        return Err(AnalysisError::input(format!(
            "image is {}x{} but mask is {}x{}",
            image.width(),
            image.height(),
            mask.width(),
            mask.height()
        )));
    }

    let overlay = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        let class_id = mask.get_pixel(x, y)[0];
        if class_id == 0 {
            return Rgb([v, v, v]);
        }
        let color = colors.get(class_id);
        let blend = |c: u8| {
            (OVERLAY_ALPHA * c as f32 + (1.0 - OVERLAY_ALPHA) * v as f32).round() as u8
        };
        Rgb([blend(color[0]), blend(color[1]), blend(color[2])])
    });
    Ok(overlay)
}

/// Write an overlay to disk. The format follows the file extension.
pub fn export_overlay(overlay: &RgbImage, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    overlay.save(path)?;
    log::info!("Overlay saved to {}", path.display());
    Ok(())
}

/// One outline around a classified region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shape {
    pub bbox: BoundingBox,
    pub class_id: ClassId,
    pub label: String,
}

/// Outlines of every reported region, drawn with a single [`ShapeKind`].
#[derive(Debug, Clone, Serialize)]
pub struct ShapeLayer {
    pub kind: ShapeKind,
    pub shapes: Vec<Shape>,
}

impl ShapeLayer {
    /// `ShapeKind::None` yields an empty layer.
    pub fn new(kind: ShapeKind, pairs: &[(Region, ClassPrediction)]) -> Self {
        let shapes = match kind {
            ShapeKind::None => Vec::new(),
            ShapeKind::Ellipse | ShapeKind::Rectangle => pairs
                .iter()
                .map(|(region, prediction)| Shape {
                    bbox: region.bbox,
                    class_id: prediction.class_id,
                    label: prediction.class_name.clone(),
                })
                .collect(),
        };
        Self { kind, shapes }
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Draw every outline onto `canvas`.
    pub fn draw(&self, canvas: &mut RgbImage) {
        for shape in &self.shapes {
            draw_shape(canvas, self.kind, &shape.bbox);
        }
    }
}

fn draw_shape(canvas: &mut RgbImage, kind: ShapeKind, bbox: &BoundingBox) {
    let (w, h) = (bbox.width().max(1), bbox.height().max(1));
    match kind {
        ShapeKind::Rectangle => {
            let rect = Rect::at(bbox.min_col as i32, bbox.min_row as i32).of_size(w, h);
            draw_hollow_rect_mut(canvas, rect, EDGE_COLOR);
        }
        ShapeKind::Ellipse => {
            // Inscribed in the bounding box.
            let center = (
                bbox.min_col as i32 + (w / 2) as i32,
                bbox.min_row as i32 + (h / 2) as i32,
            );
            draw_hollow_ellipse_mut(canvas, center, (w / 2) as i32, (h / 2) as i32, EDGE_COLOR);
        }
        ShapeKind::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn pair(bbox: BoundingBox) -> (Region, ClassPrediction) {
        (
            Region {
                id: 1,
                bbox,
                area: 100,
                perimeter: 36.0,
                circularity: 0.97,
                centroid: (15.0, 15.0),
            },
            ClassPrediction {
                class_id: 2,
                class_name: "B".to_string(),
                confidence: 0.9,
                scores: vec![0.0, 0.1, 0.9],
            },
        )
    }

    #[test]
    fn test_background_unchanged_and_regions_blended() {
        let image = GrayImage::from_pixel(8, 8, Luma([100]));
        let mut mask = Mask::new(8, 8);
        mask.put_pixel(3, 4, Luma([2]));
        let mut colors = ClassColors::default();
        colors.insert(2, [200, 0, 50]);

        let overlay = render_overlay(&image, &mask, &colors).unwrap();
        assert_eq!(overlay.dimensions(), (8, 8));
        assert_eq!(*overlay.get_pixel(0, 0), Rgb([100, 100, 100]));
        assert_eq!(*overlay.get_pixel(3, 4), Rgb([150, 50, 75]));
    }

    #[test]
    fn test_overlay_rejects_mismatched_mask() {
        let image = GrayImage::new(8, 8);
        let mask = Mask::new(8, 9);
        let err = render_overlay(&image, &mask, &ClassColors::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::Input(_)));
    }

    #[test]
    fn test_shape_kinds() {
        let bbox = BoundingBox { min_row: 10, min_col: 10, max_row: 20, max_col: 20 };
        let pairs = vec![pair(bbox)];
        assert!(ShapeLayer::new(ShapeKind::None, &pairs).is_empty());

        let rect = ShapeLayer::new(ShapeKind::Rectangle, &pairs);
        assert_eq!(rect.shapes[0].label, "B");
        let mut canvas = RgbImage::new(32, 32);
        rect.draw(&mut canvas);
        assert_eq!(*canvas.get_pixel(10, 10), EDGE_COLOR);
        assert_eq!(*canvas.get_pixel(15, 15), Rgb([0, 0, 0]));

        let mut canvas = RgbImage::new(32, 32);
        ShapeLayer::new(ShapeKind::Ellipse, &pairs).draw(&mut canvas);
        assert_eq!(*canvas.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(15, 10), EDGE_COLOR);
    }

    #[test]
    fn test_export_needs_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RgbImage::new(4, 4);
        assert!(export_overlay(&overlay, &dir.path().join("nope").join("o.png")).is_err());
        let path = dir.path().join("o.png");
        export_overlay(&overlay, &path).unwrap();
        assert!(path.exists());
    }
}
