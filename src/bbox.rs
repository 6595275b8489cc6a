//! Box forms used by annotations and detector outputs, and the overlap metric between them.

use serde::{Deserialize, Serialize};

/// COCO-style box: top-left corner plus width and height, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct XywhBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// detector box: center plus width and height, normalized to the image size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct CenterBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// top-left and bottom-right corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct CornerBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl XywhBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn to_corners(&self) -> CornerBox {
        CornerBox::new(self.x, self.y, self.x + self.w, self.y + self.h)
    }
}

impl CenterBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    pub fn to_corners(&self) -> CornerBox {
        let (half_w, half_h) = (self.w / 2.0, self.h / 2.0);
        CornerBox::new(
            self.cx - half_w,
            self.cy - half_h,
            self.cx + half_w,
            self.cy + half_h,
        )
    }

    /// convert to corner form and scale from normalized to pixel coordinates,
    /// `image_size` being (width, height)
    pub fn to_pixel_corners(&self, image_size: (u32, u32)) -> CornerBox {
        self.to_corners().scale(image_size)
    }
}

impl CornerBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// multiply x coordinates by width and y coordinates by height
    pub fn scale(&self, (width, height): (u32, u32)) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::new(self.x1 * w, self.y1 * h, self.x2 * w, self.y2 * h)
    }

    /// signed area; inverted boxes yield zero or negative values
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn intersection(&self, other: &Self) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// intersection over union, 0.0 whenever the union is not positive
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

macro_rules! impl_array_conversions {
    ($ty:ident, $a:ident, $b:ident, $c:ident, $d:ident) => {
        impl From<[f32; 4]> for $ty {
            fn from([$a, $b, $c, $d]: [f32; 4]) -> Self {
                Self { $a, $b, $c, $d }
            }
        }

        impl From<$ty> for [f32; 4] {
            fn from(b: $ty) -> Self {
                [b.$a, b.$b, b.$c, b.$d]
            }
        }
    };
}

impl_array_conversions!(XywhBox, x, y, w, h);
impl_array_conversions!(CenterBox, cx, cy, w, h);
impl_array_conversions!(CornerBox, x1, y1, x2, y2);

/// IoU of every box in `a` against every box in `b`, `result[i][j]` pairing `a[i]` with `b[j]`
pub fn iou_matrix(a: &[CornerBox], b: &[CornerBox]) -> Vec<Vec<f32>> {
    a.iter()
        .map(|lhs| b.iter().map(|rhs| lhs.iou(rhs)).collect())
        .collect()
}
