use crate::types::Color;

/// Immediate-mode 2D drawing target, in pixels with the origin top-left.
pub trait DrawSurface {
    fn size(&self) -> (f64, f64);
    fn resize(&mut self, width: f64, height: f64);
    fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64);
    fn set_fill_color(&mut self, color: Color);
    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64);
    fn fill_triangle(&mut self, points: [(f64, f64); 3]);

    fn width(&self) -> f64 {
        self.size().0
    }

    fn height(&self) -> f64 {
        self.size().1
    }
}

/// One call made against a `RecordingSurface`.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Clear { x: f64, y: f64, w: f64, h: f64 },
    Rect { x: f64, y: f64, w: f64, h: f64, color: Color },
    Triangle { points: [(f64, f64); 3], color: Color },
}

/// Records every draw call instead of rasterizing. Used by tests and for
/// inspecting a frame.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    width: f64,
    height: f64,
    fill: Option<Color>,
    pub ops: Vec<DrawOp>,
}

impl RecordingSurface {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn rects(&self) -> impl Iterator<Item = &DrawOp> {
        self.ops.iter().filter(|op| matches!(op, DrawOp::Rect { .. }))
    }

    pub fn triangles(&self) -> impl Iterator<Item = &DrawOp> {
        self.ops.iter().filter(|op| matches!(op, DrawOp::Triangle { .. }))
    }
}

impl DrawSurface for RecordingSurface {
    fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: f64, height: f64) {
        self.width = width;
        self.height = height;
    }

    fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        // A full clear hides everything recorded so far
        if x <= 0.0 && y <= 0.0 && x + w >= self.width && y + h >= self.height {
            self.ops.clear();
        }
        self.ops.push(DrawOp::Clear { x, y, w, h });
    }

    fn set_fill_color(&mut self, color: Color) {
        self.fill = Some(color);
    }

    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        let color = self.fill.unwrap_or(Color::BLACK);
        self.ops.push(DrawOp::Rect { x, y, w, h, color });
    }

    fn fill_triangle(&mut self, points: [(f64, f64); 3]) {
        let color = self.fill.unwrap_or(Color::BLACK);
        self.ops.push(DrawOp::Triangle { points, color });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_clear_drops_earlier_ops() {
        let mut s = RecordingSurface::new(10.0, 5.0);
        s.fill_rect(1.0, 1.0, 2.0, 2.0);
        s.clear_rect(0.0, 0.0, 4.0, 4.0);
        assert_eq!(s.rects().count(), 1, "partial clear keeps history");

        s.clear_rect(0.0, 0.0, 10.0, 5.0);
        assert_eq!(s.ops, vec![DrawOp::Clear { x: 0.0, y: 0.0, w: 10.0, h: 5.0 }]);
        s.fill_triangle([(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]);
        assert_eq!(s.triangles().count(), 1);
    }
}
