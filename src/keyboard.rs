use crate::surface::DrawSurface;
use crate::types::{Color, NoteRange};

/// Piano strip shown between the two timelines. Timelines consume its
/// note → x mapping so notes line up with keys.
pub trait Keyboard {
    fn set_range(&mut self, range: NoteRange);
    /// Horizontal center of `note`, interpolated for fractional pitches.
    fn note_x(&self, note: f64) -> f64;
    fn resize(&mut self, y_pos: f64, width: f64, height: f64);
    fn clear_notes(&mut self);
    /// Light the key for `note`. Notes outside `range` become edge markers
    /// when out-of-range drawing is on.
    fn mark_note(&mut self, note: i32, range: NoteRange, volume: f32, color: Color);
    fn set_draw_out_of_range(&mut self, enabled: bool);
    fn draw(&self, surface: &mut dyn DrawSurface);
}

const BLACK_KEY_DEPTH: f64 = 0.6;
const KEY_GAP: f64 = 1.0;

fn is_black(note: i32) -> bool {
    matches!(note.rem_euclid(12), 1 | 3 | 6 | 8 | 10)
}

/// White keys with pitch below `note`, counted from note 0 (negative below).
fn whites_below(note: i32) -> i32 {
    // White keys below each pitch class within an octave
    const PREFIX: [i32; 12] = [0, 1, 1, 2, 2, 3, 4, 4, 5, 5, 6, 6];
    note.div_euclid(12) * 7 + PREFIX[note.rem_euclid(12) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mark {
    Key { note: i32, color: Color },
    Below(Color),
    Above(Color),
}

/// Standard piano layout: equal-width white keys, black keys straddling the
/// boundary between their neighbours.
#[derive(Debug, Clone)]
pub struct PianoKeyboard {
    range: NoteRange,
    y_pos: f64,
    width: f64,
    height: f64,
    draw_out_of_range: bool,
    marks: Vec<Mark>,
}

impl PianoKeyboard {
    pub fn new(range: NoteRange) -> Self {
        Self {
            range,
            y_pos: 0.0,
            width: 0.0,
            height: 0.0,
            draw_out_of_range: true,
            marks: Vec::new(),
        }
    }

    pub fn range(&self) -> NoteRange {
        self.range
    }

    pub fn y_pos(&self) -> f64 {
        self.y_pos
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    fn white_count(&self) -> i32 {
        (whites_below(self.range.high as i32 + 1) - whites_below(self.range.low as i32)).max(1)
    }

    fn white_width(&self) -> f64 {
        self.width / self.white_count() as f64
    }

    fn key_x(&self, note: i32) -> f64 {
        let index = whites_below(note) - whites_below(self.range.low as i32);
        let ww = self.white_width();
        if is_black(note) {
            index as f64 * ww
        } else {
            (index as f64 + 0.5) * ww
        }
    }

    fn key_rect(&self, note: i32) -> (f64, f64, f64, f64) {
        let ww = self.white_width();
        let x = self.key_x(note);
        if is_black(note) {
            let w = ww * 0.6;
            (x - w / 2.0, 0.0, w, self.height * BLACK_KEY_DEPTH)
        } else {
            (x - ww / 2.0, 0.0, (ww - KEY_GAP).max(1.0), self.height)
        }
    }
}

impl Keyboard for PianoKeyboard {
    fn set_range(&mut self, range: NoteRange) {
        self.range = range;
    }

    fn note_x(&self, note: f64) -> f64 {
        let lo = note.floor();
        let frac = note - lo;
        let a = self.key_x(lo as i32);
        if frac == 0.0 {
            return a;
        }
        let b = self.key_x(lo as i32 + 1);
        a + (b - a) * frac
    }

    fn resize(&mut self, y_pos: f64, width: f64, height: f64) {
        self.y_pos = y_pos;
        self.width = width.max(0.0);
        self.height = height.max(0.0);
    }

    fn clear_notes(&mut self) {
        self.marks.clear();
    }

    fn mark_note(&mut self, note: i32, range: NoteRange, volume: f32, color: Color) {
        let color = blend(Color::WHITE, color, volume);
        if note < range.low as i32 {
            if self.draw_out_of_range {
                self.marks.push(Mark::Below(color));
            }
        } else if note > range.high as i32 {
            if self.draw_out_of_range {
                self.marks.push(Mark::Above(color));
            }
        } else {
            self.marks.push(Mark::Key { note, color });
        }
    }

    fn set_draw_out_of_range(&mut self, enabled: bool) {
        self.draw_out_of_range = enabled;
    }

    fn draw(&self, surface: &mut dyn DrawSurface) {
        let (w, h) = surface.size();
        if h <= 0.0 {
            return;
        }
        surface.clear_rect(0.0, 0.0, w, h);

        let lit = |note: i32| {
            self.marks.iter().rev().find_map(|m| match m {
                Mark::Key { note: n, color } if *n == note => Some(*color),
                _ => None,
            })
        };

        let (low, high) = (self.range.low as i32, self.range.high as i32);
        // White keys first, black keys on top
        for black in [false, true] {
            for note in (low..=high).filter(|&n| is_black(n) == black) {
                let base = if black { Color::BLACK } else { Color::WHITE };
                surface.set_fill_color(lit(note).unwrap_or(base));
                let (x, y, kw, kh) = self.key_rect(note);
                surface.fill_rect(x, y, kw, kh);
            }
        }

        let size = (h / 3.0).min(10.0);
        let mid = h / 2.0;
        for mark in &self.marks {
            match *mark {
                Mark::Below(color) => {
                    surface.set_fill_color(color);
                    surface.fill_triangle([(size, mid - size / 2.0), (size, mid + size / 2.0), (0.0, mid)]);
                }
                Mark::Above(color) => {
                    surface.set_fill_color(color);
                    surface.fill_triangle([
                        (w - size, mid - size / 2.0),
                        (w - size, mid + size / 2.0),
                        (w, mid),
                    ]);
                }
                Mark::Key { .. } => {}
            }
        }
    }
}

/// Mix `color` over `base` by `amount` (0.0–1.0).
fn blend(base: Color, color: Color, amount: f32) -> Color {
    let t = amount.clamp(0.0, 1.0);
    let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
    Color::rgb(mix(base.r, color.r), mix(base.g, color.g), mix(base.b, color.b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{DrawOp, RecordingSurface};

    fn keyboard(low: u8, high: u8, width: f64) -> PianoKeyboard {
        let mut k = PianoKeyboard::new(NoteRange::new(low, high).unwrap());
        k.resize(100.0, width, 40.0);
        k
    }

    #[test]
    fn test_whites_below() {
        assert_eq!(whites_below(0), 0);
        assert_eq!(whites_below(12), 7);
        assert_eq!(whites_below(60), 35);
        assert_eq!(whites_below(-1), -1);
        assert_eq!(whites_below(-12), -7);
    }

    #[test]
    fn test_note_x_layout() {
        // One octave C4..B4: 7 white keys, 10 px each
        let k = keyboard(60, 71, 70.0);
        assert_eq!(k.note_x(60.0), 5.0);
        assert_eq!(k.note_x(62.0), 15.0);
        assert_eq!(k.note_x(61.0), 10.0, "C# sits on the C/D boundary");
        assert_eq!(k.note_x(71.0), 65.0);
        assert_eq!(k.note_x(60.5), 7.5);
        assert!(k.note_x(59.0) < 0.0, "below-range notes extrapolate left");
    }

    #[test]
    fn test_marks_and_out_of_range() {
        let range = NoteRange::new(60, 71).unwrap();
        let mut k = keyboard(60, 71, 70.0);
        k.mark_note(64, range, 1.0, Color::rgb(255, 0, 0));
        k.mark_note(40, range, 1.0, Color::rgb(0, 0, 255));
        let mut s = RecordingSurface::new(70.0, 40.0);
        k.draw(&mut s);
        assert!(s.ops.contains(&DrawOp::Rect {
            x: 20.0,
            y: 0.0,
            w: 9.0,
            h: 40.0,
            color: Color::rgb(255, 0, 0)
        }));
        assert_eq!(s.triangles().count(), 1);

        k.clear_notes();
        k.set_draw_out_of_range(false);
        k.mark_note(90, range, 1.0, Color::rgb(0, 0, 255));
        let mut s = RecordingSurface::new(70.0, 40.0);
        k.draw(&mut s);
        assert_eq!(s.triangles().count(), 0);
        // 7 white + 5 black keys
        assert_eq!(s.rects().count(), 12);
    }

    #[test]
    fn test_blend() {
        assert_eq!(blend(Color::WHITE, Color::BLACK, 0.0), Color::WHITE);
        assert_eq!(blend(Color::WHITE, Color::BLACK, 1.0), Color::BLACK);
        assert_eq!(blend(Color::BLACK, Color::WHITE, 0.5), Color::rgb(128, 128, 128));
    }
}
