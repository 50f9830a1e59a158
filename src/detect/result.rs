/// Face bounding box in pixel coordinates, `right` and `bottom` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// True when both sides are at least `min_px`.
    pub fn passes_min_size(&self, min_px: u32) -> bool {
        self.width() >= min_px && self.height() >= min_px
    }

    /// Clamp to a `width`x`height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
        }
    }

    /// Intersection over union.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let inter = (right - left) as f32 * (bottom - top) as f32;
        let union = self.area() as f32 + other.area() as f32 - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_size_checks_both_sides() {
        let face = FaceBox::new(10, 70, 60, 10);
        assert_eq!((face.width(), face.height()), (60, 50));
        assert!(face.passes_min_size(48));
        assert!(!face.passes_min_size(55));
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = FaceBox::new(0, 10, 10, 0);
        let b = FaceBox::new(20, 30, 30, 20);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn clamp_keeps_box_inside_frame() {
        let face = FaceBox::new(5, 700, 500, 600).clamp_to(640, 480);
        assert_eq!(face, FaceBox::new(5, 640, 480, 600));
    }
}
