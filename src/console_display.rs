use crate::surface::DrawSurface;
use crate::types::Color;
use std::fmt::Write as _;
use std::io::{self, Write};

/// Character-cell raster: one cell per pixel.
#[derive(Debug, Clone)]
pub struct AsciiCanvas {
    width: usize,
    height: usize,
    fill: Color,
    cells: Vec<Option<Color>>,
}

impl AsciiCanvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            fill: Color::WHITE,
            cells: vec![None; width * height],
        }
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<Color> {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x]
        } else {
            None
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Option<Color>]> {
        self.cells.chunks(self.width.max(1)).take(self.height)
    }

    /// `#` for painted cells, space otherwise. One line per row.
    pub fn to_plain_text(&self) -> String {
        let mut s = String::with_capacity((self.width + 1) * self.height);
        for row in self.rows() {
            s.extend(row.iter().map(|c| if c.is_some() { '#' } else { ' ' }));
            s.push('\n');
        }
        s
    }

    fn put(&mut self, x: i64, y: i64, color: Option<Color>) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.cells[y as usize * self.width + x as usize] = color;
        }
    }

    /// Cells touched by `[x, x + w)` horizontally, at least one.
    fn span(start: f64, len: f64) -> (i64, i64) {
        let a = start.floor() as i64;
        let b = ((start + len).ceil() as i64).max(a + 1);
        (a, b)
    }

    /// `[a, b)` cut down to `[0, limit)`; may come out empty.
    fn clip(a: i64, b: i64, limit: usize) -> (i64, i64) {
        (a.max(0), b.min(limit as i64))
    }

    fn paint_rect(&mut self, x: f64, y: f64, w: f64, h: f64, color: Option<Color>) {
        if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) || w <= 0.0 || h <= 0.0 {
            return;
        }
        let (x0, x1) = Self::span(x, w);
        let (y0, y1) = Self::span(y, h);
        let (x0, x1) = Self::clip(x0, x1, self.width);
        let (y0, y1) = Self::clip(y0, y1, self.height);
        for cy in y0..y1 {
            for cx in x0..x1 {
                self.put(cx, cy, color);
            }
        }
    }
}

impl DrawSurface for AsciiCanvas {
    fn size(&self) -> (f64, f64) {
        (self.width as f64, self.height as f64)
    }

    fn resize(&mut self, width: f64, height: f64) {
        self.width = width.max(0.0).round() as usize;
        self.height = height.max(0.0).round() as usize;
        self.cells = vec![None; self.width * self.height];
    }

    fn clear_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.paint_rect(x, y, w, h, None);
    }

    fn set_fill_color(&mut self, color: Color) {
        self.fill = color;
    }

    fn fill_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.paint_rect(x, y, w, h, Some(self.fill));
    }

    fn fill_triangle(&mut self, points: [(f64, f64); 3]) {
        let [(ax, ay), (bx, by), (cx, cy)] = points;
        let area = (bx - ax) * (cy - ay) - (cx - ax) * (by - ay);
        let (x0, x1) = Self::clip(
            ax.min(bx).min(cx).floor() as i64,
            ax.max(bx).max(cx).ceil() as i64,
            self.width,
        );
        let (y0, y1) = Self::clip(
            ay.min(by).min(cy).floor() as i64,
            ay.max(by).max(cy).ceil() as i64,
            self.height,
        );
        let fill = Some(self.fill);

        if area.abs() < f64::EPSILON {
            self.put(ax.floor() as i64, ay.floor() as i64, fill);
            return;
        }
        for y in y0..y1 {
            for x in x0..x1 {
                let (px, py) = (x as f64 + 0.5, y as f64 + 0.5);
                let w0 = (bx - px) * (cy - py) - (cx - px) * (by - py);
                let w1 = (cx - px) * (ay - py) - (ax - px) * (cy - py);
                let w2 = (ax - px) * (by - py) - (bx - px) * (ay - py);
                let inside = if area > 0.0 {
                    w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0
                } else {
                    w0 <= 0.0 && w1 <= 0.0 && w2 <= 0.0
                };
                if inside {
                    self.put(x, y, fill);
                }
            }
        }
    }
}

/// Writes stacked canvases to a terminal as 24-bit ANSI background colors.
pub struct ConsoleDisplay<W: Write> {
    out: W,
    frames: u64,
}

impl ConsoleDisplay<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Redraw the whole screen: `layers` top to bottom, then `status`.
    pub fn present(&mut self, layers: &[&AsciiCanvas], status: &str) -> io::Result<()> {
        let mut frame = String::new();
        // Clear screen and move cursor home
        frame.push_str("\x1b[2J\x1b[H");
        for canvas in layers {
            for row in canvas.rows() {
                let mut current: Option<Option<Color>> = None;
                for cell in row {
                    if current != Some(*cell) {
                        match cell {
                            Some(c) => {
                                let _ = write!(frame, "\x1b[48;2;{};{};{}m", c.r, c.g, c.b);
                            }
                            None => frame.push_str("\x1b[0m"),
                        }
                        current = Some(*cell);
                    }
                    frame.push(' ');
                }
                frame.push_str("\x1b[0m\n");
            }
        }
        frame.push_str(status);
        frame.push('\n');

        self.out.write_all(frame.as_bytes())?;
        self.out.flush()?;
        self.frames += 1;
        Ok(())
    }
}

/// `C4`-style name of a MIDI note.
pub fn note_name(note: i32) -> String {
    const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    format!("{}{}", NAMES[note.rem_euclid(12) as usize], note.div_euclid(12) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_clear() {
        let mut c = AsciiCanvas::new(6, 3);
        c.set_fill_color(Color::rgb(1, 2, 3));
        c.fill_rect(1.0, 0.0, 2.0, 2.0);
        assert_eq!(c.to_plain_text(), " ##   \n ##   \n      \n");
        c.clear_rect(0.0, 0.0, 6.0, 3.0);
        assert_eq!(c.to_plain_text(), "      \n      \n      \n");
    }

    #[test]
    fn test_thin_rects_cover_a_cell() {
        let mut c = AsciiCanvas::new(4, 2);
        c.fill_rect(2.3, 0.0, 0.2, 0.5);
        assert_eq!(c.cell(2, 0), Some(Color::WHITE));
        // Fully off-canvas draws are clipped
        c.fill_rect(-5.0, -5.0, 2.0, 2.0);
        c.fill_rect(f64::NAN, 0.0, 1.0, 1.0);
        assert_eq!(c.to_plain_text(), "  # \n    \n");
    }

    #[test]
    fn test_huge_shapes_are_clipped_to_the_canvas() {
        let mut c = AsciiCanvas::new(4, 3);
        c.fill_rect(1.0, -1e12, 1.0, 2e12);
        assert_eq!(c.to_plain_text(), " #  \n #  \n #  \n");
        c.clear_rect(-1e15, -1e15, 2e15, 2e15);
        assert_eq!(c.to_plain_text(), "    \n    \n    \n");
        c.fill_triangle([(-1e12, -1e12), (3e12, -1e12), (-1e12, 3e12)]);
        assert!(c.cell(0, 0).is_some());
        assert!(c.cell(3, 2).is_some());
    }

    #[test]
    fn test_triangle() {
        let mut c = AsciiCanvas::new(10, 10);
        c.fill_triangle([(10.0, 10.0), (10.0, 0.0), (0.0, 5.0)]);
        assert!(c.cell(9, 5).is_some(), "base of the triangle");
        assert!(c.cell(0, 0).is_none());
        assert!(c.cell(0, 9).is_none());
    }

    #[test]
    fn test_present() {
        let mut c = AsciiCanvas::new(2, 1);
        c.set_fill_color(Color::rgb(255, 0, 0));
        c.fill_rect(0.0, 0.0, 1.0, 1.0);
        let mut display = ConsoleDisplay::new(Vec::new());
        display.present(&[&c], "t=0.00s").unwrap();
        let text = String::from_utf8(display.out.clone()).unwrap();
        assert!(text.starts_with("\x1b[2J\x1b[H"));
        assert!(text.contains("\x1b[48;2;255;0;0m \x1b[0m \x1b[0m\n"));
        assert!(text.ends_with("t=0.00s\n"));
        assert_eq!(display.frames(), 1);
    }

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(119), "B8");
    }
}
