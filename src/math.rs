//! Small geometry helpers shared by the clipping, motion and avatar code.

use std::collections::HashMap;

use glam::{Mat4, Vec3};

/// Axis-aligned rectangle in either model space or normalized texture space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Full coverage of a normalized texture.
    pub const UNIT: Rect = Rect::new(0.0, 0.0, 1.0, 1.0);

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn center_x(&self) -> f32 {
        self.x + 0.5 * self.width
    }

    pub fn center_y(&self) -> f32 {
        self.y + 0.5 * self.height
    }

    /// Grow the rectangle by `w` on the left and right and `h` on the top and bottom.
    pub fn expand(&mut self, w: f32, h: f32) {
        self.x -= w;
        self.y -= h;
        self.width += w * 2.0;
        self.height += h * 2.0;
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }

    /// Bounding box of a set of 2D points. Returns `None` for an empty set.
    pub fn bounding(points: impl IntoIterator<Item = [f32; 2]>) -> Option<Rect> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (mut min_x, mut min_y) = (first[0], first[1]);
        let (mut max_x, mut max_y) = (first[0], first[1]);
        for [x, y] in iter {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some(Rect::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }
}

/// Sine ease used for every fade in the motion system. Input outside [0, 1] is clamped.
pub fn easing_sine(value: f32) -> f32 {
    if value < 0.0 {
        0.0
    } else if value > 1.0 {
        1.0
    } else {
        0.5 - 0.5 * (value * std::f32::consts::PI).cos()
    }
}

/// Post-multiply a translation: `m = m * T(x, y)`.
pub fn translate_relative(m: Mat4, x: f32, y: f32) -> Mat4 {
    m * Mat4::from_translation(Vec3::new(x, y, 0.0))
}

/// Post-multiply a scale: `m = m * S(x, y)`.
pub fn scale_relative(m: Mat4, x: f32, y: f32) -> Mat4 {
    m * Mat4::from_scale(Vec3::new(x, y, 1.0))
}

/// Placement of the model inside view space, driven by the `Layout` map of the model settings.
#[derive(Clone, Copy, Debug)]
pub struct ModelMatrix {
    width: f32,
    height: f32,
    scale_x: f32,
    scale_y: f32,
    translate_x: f32,
    translate_y: f32,
}

impl ModelMatrix {
    /// Create a matrix for a canvas of the given size in model units, fitted to a height of 2.
    pub fn new(width: f32, height: f32) -> Self {
        let mut matrix = Self {
            width,
            height,
            scale_x: 1.0,
            scale_y: 1.0,
            translate_x: 0.0,
            translate_y: 0.0,
        };
        matrix.set_height(2.0);
        matrix
    }

    pub fn set_width(&mut self, w: f32) {
        if self.width > 0.0 {
            let s = w / self.width;
            self.scale_x = s;
            self.scale_y = s;
        }
    }

    pub fn set_height(&mut self, h: f32) {
        if self.height > 0.0 {
            let s = h / self.height;
            self.scale_x = s;
            self.scale_y = s;
        }
    }

    pub fn set_position(&mut self, x: f32, y: f32) {
        self.translate_x = x;
        self.translate_y = y;
    }

    pub fn set_center_position(&mut self, x: f32, y: f32) {
        self.center_x(x);
        self.center_y(y);
    }

    pub fn center_x(&mut self, x: f32) {
        self.translate_x = x - self.width * self.scale_x / 2.0;
    }

    pub fn center_y(&mut self, y: f32) {
        self.translate_y = y - self.height * self.scale_y / 2.0;
    }

    pub fn top(&mut self, y: f32) {
        self.translate_y = y;
    }

    pub fn bottom(&mut self, y: f32) {
        self.translate_y = y - self.height * self.scale_y;
    }

    pub fn left(&mut self, x: f32) {
        self.translate_x = x;
    }

    pub fn right(&mut self, x: f32) {
        self.translate_x = x - self.width * self.scale_x;
    }

    /// Apply a layout map. Size keys are applied before position keys so centering uses the final scale.
    pub fn setup_from_layout(&mut self, layout: &HashMap<String, f32>) {
        for (key, &value) in layout {
            match key.as_str() {
                "Width" => self.set_width(value),
                "Height" => self.set_height(value),
                _ => {}
            }
        }
        for (key, &value) in layout {
            match key.as_str() {
                "X" => self.left(value),
                "Y" => self.top(value),
                "CenterX" => self.center_x(value),
                "CenterY" => self.center_y(value),
                "Top" => self.top(value),
                "Bottom" => self.bottom(value),
                "Left" => self.left(value),
                "Right" => self.right(value),
                _ => {}
            }
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols_array(&[
            self.scale_x, 0.0, 0.0, 0.0,
            0.0, self.scale_y, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            self.translate_x, self.translate_y, 0.0, 1.0,
        ])
    }

    /// Map a view-space point back into model space.
    pub fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = if self.scale_x != 0.0 { self.scale_x } else { 1.0 };
        let sy = if self.scale_y != 0.0 { self.scale_y } else { 1.0 };
        ((x - self.translate_x) / sx, (y - self.translate_y) / sy)
    }

    pub fn scale_x(&self) -> f32 {
        self.scale_x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_easing_sine_clamps() {
        assert_eq!(easing_sine(-1.0), 0.0);
        assert_eq!(easing_sine(2.0), 1.0);
        assert!((easing_sine(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bounding_rect() {
        let r = Rect::bounding([[0.0, 1.0], [2.0, -1.0], [1.0, 0.5]]).unwrap();
        assert_eq!(r, Rect::new(0.0, -1.0, 2.0, 2.0));
        assert!(Rect::bounding(std::iter::empty()).is_none());
    }

    #[test]
    fn test_relative_ops_compose_right_to_left() {
        let m = scale_relative(translate_relative(Mat4::IDENTITY, 1.0, 0.0), 2.0, 2.0);
        let p = m.transform_point3(Vec3::new(1.0, 1.0, 0.0));
        // scale first, then translate
        assert!((p.x - 3.0).abs() < 1e-6);
        assert!((p.y - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_matrix_layout_centers() {
        let mut m = ModelMatrix::new(4.0, 4.0);
        let mut layout = HashMap::new();
        layout.insert("CenterX".to_string(), 0.0);
        layout.insert("CenterY".to_string(), 0.0);
        m.setup_from_layout(&layout);
        let p = m.to_mat4().transform_point3(Vec3::new(2.0, 2.0, 0.0));
        assert!(p.x.abs() < 1e-6);
        assert!(p.y.abs() < 1e-6);
        let (x, y) = m.invert_point(0.0, 0.0);
        assert!((x - 2.0).abs() < 1e-6 && (y - 2.0).abs() < 1e-6);
    }
}
