use crate::keyboard::Keyboard;
use crate::state_buffer::StateBuffer;
use crate::surface::DrawSurface;
use crate::types::{ChannelMask, Color, EnvelopeState, NoteRange, CHANNEL_COUNT, WINDOW_MARGIN};

/// Side length of the out-of-range markers, in pixels.
pub const OUT_OF_RANGE_MARKER: f64 = 10.0;

/// Per-renderer display toggles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineConfig {
    /// Place notes under their piano keys instead of spreading the note
    /// range evenly across the width.
    pub align_to_keyboard: bool,
    /// Mark out-of-range note onsets with edge triangles.
    pub draw_out_of_range: bool,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            align_to_keyboard: true,
            draw_out_of_range: false,
        }
    }
}

/// What one draw shows.
#[derive(Debug, Clone, Copy)]
pub struct TimelineView<'a> {
    /// Current playback time.
    pub time: f64,
    /// Window relative to `time`: negative is past, positive is upcoming.
    pub time_range: (f64, f64),
    pub note_range: NoteRange,
    pub channels: ChannelMask,
    pub colors: &'a [Color; CHANNEL_COUNT],
}

/// One scrolling viewport.
#[derive(Debug, Clone, Default)]
pub struct TimelineRenderer {
    y_pos: f64,
    pub config: TimelineConfig,
}

fn inv_lerp(a: f64, b: f64, v: f64) -> f64 {
    (v - a) / (b - a)
}

impl TimelineRenderer {
    pub fn new(config: TimelineConfig) -> Self {
        Self { y_pos: 0.0, config }
    }

    pub fn y_pos(&self) -> f64 {
        self.y_pos
    }

    pub fn resize(&mut self, surface: &mut dyn DrawSurface, y_pos: f64, width: f64, height: f64) {
        self.y_pos = y_pos;
        surface.resize(width, height.max(0.0));
    }

    /// Clear `surface` and repaint every note inside the view's window.
    pub fn draw(
        &self,
        surface: &mut dyn DrawSurface,
        buffer: &StateBuffer,
        keyboard: &dyn Keyboard,
        view: &TimelineView<'_>,
    ) {
        let (width, height) = surface.size();
        if height <= 0.0 {
            return;
        }

        let range = view.note_range;
        let span = range.span();
        let (start, end) = (view.time + view.time_range.0, view.time + view.time_range.1);
        let y_of = |t: f64| inv_lerp(start, end, t) * height;

        surface.clear_rect(0.0, 0.0, width, height);

        let mut prev = buffer.before(start - WINDOW_MARGIN);
        for s in buffer.range(start, end) {
            let Some(last) = prev else {
                prev = Some(s);
                continue;
            };

            let note_y = y_of(s.time);
            let note_h = (note_y - y_of(last.time)).abs() + 1.0;

            for (ch, channel) in s.channels.iter().enumerate().take(CHANNEL_COUNT) {
                if !view.channels.contains(ch) {
                    continue;
                }
                surface.set_fill_color(view.colors[ch]);

                for note in &channel.playing {
                    if note.state == EnvelopeState::Release {
                        continue;
                    }

                    if !range.contains(note.note) {
                        if self.config.draw_out_of_range && note.state == EnvelopeState::Attack {
                            let above = note.note > range.high as f64;
                            surface.fill_triangle(marker(above, width, height - note_y));
                        }
                        continue;
                    }

                    let w = width / span * note.volume as f64;
                    let x = if self.config.align_to_keyboard {
                        keyboard.note_x(note.note) - w / 2.0
                    } else {
                        (note.note - range.low as f64) / span * width - w / 2.0
                    };
                    surface.fill_rect(x, height - note_y, w, note_h);
                }
            }

            prev = Some(s);
        }
    }
}

/// Edge triangle whose lower corner sits at `y`: pointing right at the right
/// edge for notes above the range, left at the left edge otherwise.
fn marker(above: bool, width: f64, y: f64) -> [(f64, f64); 3] {
    let size = OUT_OF_RANGE_MARKER;
    if above {
        [
            (width - size, y),
            (width - size, y - size),
            (width, y - size / 2.0),
        ]
    } else {
        [(size, y), (size, y - size), (0.0, y - size / 2.0)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::PianoKeyboard;
    use crate::surface::{DrawOp, RecordingSurface};
    use crate::types::{ChannelState, NoteEvent, Snapshot};

    const W: f64 = 870.0;
    const H: f64 = 200.0;

    fn snapshot(time: f64, ch: usize, notes: &[(f64, f32, EnvelopeState)]) -> Snapshot {
        let mut s = Snapshot::empty(time);
        s.channels[ch] = ChannelState {
            playing: notes
                .iter()
                .map(|&(note, volume, state)| NoteEvent { note, volume, state })
                .collect(),
        };
        s
    }

    /// Two snapshots: a silent seed at 0.0 and `notes` at 0.5.
    fn buffer_with(notes: &[(f64, f32, EnvelopeState)]) -> StateBuffer {
        let mut b = StateBuffer::new();
        b.append(vec![Snapshot::empty(0.0), snapshot(0.5, 0, notes)]).unwrap();
        b
    }

    fn draw(buffer: &StateBuffer, config: TimelineConfig, range: NoteRange) -> RecordingSurface {
        let colors = Color::channel_palette();
        let view = TimelineView {
            time: 0.0,
            time_range: (0.0, 1.0),
            note_range: range,
            channels: ChannelMask::ALL,
            colors: &colors,
        };
        let mut keyboard = PianoKeyboard::new(range);
        keyboard.resize(0.0, W, 20.0);
        let mut surface = RecordingSurface::new(W, H);
        TimelineRenderer::new(config).draw(&mut surface, buffer, &keyboard, &view);
        surface
    }

    fn unaligned() -> TimelineConfig {
        TimelineConfig {
            align_to_keyboard: false,
            draw_out_of_range: true,
        }
    }

    #[test]
    fn test_proportional_placement() {
        let range = NoteRange::new(21, 108).unwrap();
        let b = buffer_with(&[(60.0, 0.5, EnvelopeState::Attack)]);
        let s = draw(&b, unaligned(), range);
        let rects: Vec<_> = s.rects().collect();
        assert_eq!(rects.len(), 1);
        let w = W / 87.0 * 0.5;
        let expected_x = (60.0 - 21.0) / (108.0 - 21.0) * W - w / 2.0;
        match rects[0] {
            DrawOp::Rect { x, y, w: rw, h, .. } => {
                assert!((x - expected_x).abs() < 1e-9, "x = {}, expected {}", x, expected_x);
                assert!((rw - w).abs() < 1e-9);
                // t=0.5 of a 1 s window: halfway up, spanning back to t=0.0
                assert!((y - H / 2.0).abs() < 1e-9);
                assert!((h - (H / 2.0 + 1.0)).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bounds_are_on_range() {
        let range = NoteRange::new(21, 108).unwrap();
        let b = buffer_with(&[
            (21.0, 1.0, EnvelopeState::Attack),
            (108.0, 1.0, EnvelopeState::Attack),
        ]);
        let s = draw(&b, unaligned(), range);
        assert_eq!(s.rects().count(), 2);
        assert_eq!(s.triangles().count(), 0);
    }

    #[test]
    fn test_release_never_drawn_on_range() {
        let range = NoteRange::new(21, 108).unwrap();
        for volume in [0.0, 0.5, 1.0] {
            let b = buffer_with(&[(60.0, volume, EnvelopeState::Release)]);
            let s = draw(&b, unaligned(), range);
            assert_eq!(s.rects().count(), 0, "volume {}", volume);
        }
    }

    #[test]
    fn test_out_of_range_markers() {
        let range = NoteRange::new(40, 80).unwrap();
        let b = buffer_with(&[
            (20.0, 1.0, EnvelopeState::Attack),
            (100.0, 1.0, EnvelopeState::Attack),
            (90.0, 1.0, EnvelopeState::Sustain),
        ]);
        let s = draw(&b, unaligned(), range);
        let tris: Vec<_> = s.triangles().collect();
        assert_eq!(tris.len(), 2, "only Attack instants get markers");
        match (tris[0], tris[1]) {
            (DrawOp::Triangle { points: left, .. }, DrawOp::Triangle { points: right, .. }) => {
                assert_eq!(left[2].0, 0.0, "below range points at the left edge");
                assert_eq!(right[2].0, W, "above range points at the right edge");
            }
            _ => unreachable!(),
        }

        let off = TimelineConfig {
            draw_out_of_range: false,
            ..unaligned()
        };
        assert_eq!(draw(&b, off, range).triangles().count(), 0);
    }

    #[test]
    fn test_aligned_uses_keyboard() {
        let range = NoteRange::new(60, 71).unwrap();
        let b = buffer_with(&[(64.0, 1.0, EnvelopeState::Sustain)]);
        let aligned = TimelineConfig {
            align_to_keyboard: true,
            draw_out_of_range: false,
        };
        let s = draw(&b, aligned, range);
        let mut keyboard = PianoKeyboard::new(range);
        keyboard.resize(0.0, W, 20.0);
        let w = W / 11.0;
        match s.rects().next() {
            Some(DrawOp::Rect { x, .. }) => {
                assert!((x - (keyboard.note_x(64.0) - w / 2.0)).abs() < 1e-9)
            }
            other => panic!("expected a rect, got {:?}", other),
        };
    }

    #[test]
    fn test_redraw_records_only_the_latest_frame() {
        let range = NoteRange::new(21, 108).unwrap();
        let b = buffer_with(&[(60.0, 0.5, EnvelopeState::Attack)]);
        let colors = Color::channel_palette();
        let view = TimelineView {
            time: 0.0,
            time_range: (0.0, 1.0),
            note_range: range,
            channels: ChannelMask::ALL,
            colors: &colors,
        };
        let keyboard = PianoKeyboard::new(range);
        let r = TimelineRenderer::new(unaligned());
        let mut surface = RecordingSurface::new(W, H);
        r.draw(&mut surface, &b, &keyboard, &view);
        let once = surface.rects().count();
        assert!(once > 0);
        r.draw(&mut surface, &b, &keyboard, &view);
        assert_eq!(surface.rects().count(), once);
    }

    #[test]
    fn test_hidden_channel_and_zero_height() {
        let range = NoteRange::FULL;
        let b = buffer_with(&[(60.0, 1.0, EnvelopeState::Attack)]);
        let colors = Color::channel_palette();
        let mut mask = ChannelMask::ALL;
        mask.hide(0);
        let view = TimelineView {
            time: 0.0,
            time_range: (0.0, 1.0),
            note_range: range,
            channels: mask,
            colors: &colors,
        };
        let keyboard = PianoKeyboard::new(range);
        let r = TimelineRenderer::default();

        let mut surface = RecordingSurface::new(W, H);
        r.draw(&mut surface, &b, &keyboard, &view);
        assert_eq!(surface.rects().count(), 0);

        let mut flat = RecordingSurface::new(W, 0.0);
        r.draw(&mut flat, &b, &keyboard, &view);
        assert!(flat.ops.is_empty());
    }

    #[test]
    fn test_resize_clamps_height() {
        let mut r = TimelineRenderer::default();
        let mut surface = RecordingSurface::new(0.0, 0.0);
        r.resize(&mut surface, 50.0, 300.0, -20.0);
        assert_eq!(surface.size(), (300.0, 0.0));
        assert_eq!(r.y_pos(), 50.0);
    }
}
