use crate::keyboard::Keyboard;
use crate::state_buffer::StateBuffer;
use crate::surface::DrawSurface;
use crate::timeline::{TimelineConfig, TimelineRenderer, TimelineView};
use crate::types::{ChannelMask, Color, EnvelopeState, NoteRange, CHANNEL_COUNT, WINDOW_MARGIN};
use log::debug;
use std::str::FromStr;

/// Where out-of-range notes are indicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRangeMode {
    OnKeys,
    OnTimeline,
    OnBoth,
    Off,
}

impl OutOfRangeMode {
    fn on_keys(self) -> bool {
        matches!(self, OutOfRangeMode::OnKeys | OutOfRangeMode::OnBoth)
    }

    fn on_timeline(self) -> bool {
        matches!(self, OutOfRangeMode::OnTimeline | OutOfRangeMode::OnBoth)
    }
}

impl FromStr for OutOfRangeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keys" => Ok(OutOfRangeMode::OnKeys),
            "timeline" => Ok(OutOfRangeMode::OnTimeline),
            "both" => Ok(OutOfRangeMode::OnBoth),
            "off" => Ok(OutOfRangeMode::Off),
            other => Err(format!("expected keys, timeline, both or off, got {:?}", other)),
        }
    }
}

/// The three stacked regions of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Top,
    Piano,
    Bottom,
}

/// View parameters the compositor starts from.
#[derive(Debug, Clone)]
pub struct ViewSettings {
    pub note_range: NoteRange,
    /// Fraction of the display height taken by the piano.
    pub piano_height: f64,
    /// Fraction of the display height above the piano.
    pub piano_position: f64,
    /// Seconds of upcoming notes in the top viewport.
    pub top_time: f64,
    /// Seconds of past notes in the bottom viewport (negative).
    pub bottom_time: f64,
    /// Derive `bottom_time` so both viewports scroll at the same pixel rate.
    pub bottom_same_speed: bool,
    pub align_notes: bool,
    pub out_of_range: OutOfRangeMode,
    pub colors: [Color; CHANNEL_COUNT],
    pub top_channels: ChannelMask,
    pub piano_channels: ChannelMask,
    pub bottom_channels: ChannelMask,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            note_range: NoteRange::FULL,
            piano_height: 0.1,
            piano_position: 0.7,
            top_time: 1.5,
            bottom_time: -1.0,
            bottom_same_speed: true,
            align_notes: true,
            out_of_range: OutOfRangeMode::OnKeys,
            colors: Color::channel_palette(),
            top_channels: ChannelMask::ALL,
            piano_channels: ChannelMask::ALL,
            bottom_channels: ChannelMask::ALL,
        }
    }
}

/// Owns the view parameters and the two timelines plus the keyboard, and
/// draws all three for one instant.
pub struct Compositor<S: DrawSurface, K: Keyboard> {
    view: ViewSettings,
    top: TimelineRenderer,
    bottom: TimelineRenderer,
    keyboard: K,
    top_surface: S,
    piano_surface: S,
    bottom_surface: S,
    width: f64,
    height: f64,
    piano_y: f64,
}

impl<S: DrawSurface, K: Keyboard> Compositor<S, K> {
    /// `top`, `piano` and `bottom` are the surfaces of the three regions;
    /// `resize` sizes them.
    pub fn new(view: ViewSettings, keyboard: K, top: S, piano: S, bottom: S) -> Self {
        let mut c = Self {
            top: TimelineRenderer::new(TimelineConfig::default()),
            bottom: TimelineRenderer::new(TimelineConfig::default()),
            keyboard,
            top_surface: top,
            piano_surface: piano,
            bottom_surface: bottom,
            width: 0.0,
            height: 0.0,
            piano_y: 0.0,
            view,
        };
        c.keyboard.set_range(c.view.note_range);
        c.set_align_notes(c.view.align_notes);
        c.set_out_of_range(c.view.out_of_range);
        c
    }

    pub fn view(&self) -> &ViewSettings {
        &self.view
    }

    pub fn keyboard(&self) -> &K {
        &self.keyboard
    }

    /// Recompute the layout for a display of `width` × `height`.
    pub fn resize(&mut self, width: f64, height: f64) {
        self.width = width;
        self.height = height;
        let v = &self.view;

        let top_h = height * v.piano_position;
        let piano_h = height * v.piano_height;
        let bottom_y = top_h + piano_h;
        let bottom_h = (height * (1.0 - v.piano_position) - piano_h).max(0.0);

        self.top.resize(&mut self.top_surface, 0.0, width, top_h);
        self.piano_y = top_h;
        self.keyboard.resize(top_h, width, piano_h);
        self.piano_surface.resize(width, piano_h.max(0.0));
        self.keyboard.set_range(self.view.note_range);
        self.bottom.resize(&mut self.bottom_surface, bottom_y, width, bottom_h);

        if self.view.bottom_same_speed && top_h > 0.0 {
            let top_speed = self.view.top_time / top_h;
            self.view.bottom_time = -bottom_h * top_speed;
        }
        debug!(
            "Layout {}x{}: top {:.0}px, piano {:.0}px, bottom {:.0}px ({:.2}s)",
            width, height, top_h, piano_h, bottom_h, self.view.bottom_time
        );
    }

    /// Draw every region for playback instant `time`.
    pub fn render(&mut self, time: f64, buffer: &StateBuffer) {
        let v = &self.view;
        let top_view = TimelineView {
            time,
            time_range: (0.0, v.top_time),
            note_range: v.note_range,
            channels: v.top_channels,
            colors: &v.colors,
        };
        self.top.draw(&mut self.top_surface, buffer, &self.keyboard, &top_view);

        let bottom_view = TimelineView {
            time_range: (v.bottom_time, 0.0),
            channels: v.bottom_channels,
            ..top_view
        };
        self.bottom.draw(&mut self.bottom_surface, buffer, &self.keyboard, &bottom_view);

        self.keyboard.clear_notes();
        if let Some(state) = buffer.query(time) {
            for (ch, channel) in state.channels.iter().enumerate().take(CHANNEL_COUNT) {
                if !v.piano_channels.contains(ch) {
                    continue;
                }
                for note in &channel.playing {
                    if note.state == EnvelopeState::Release {
                        continue;
                    }
                    self.keyboard.mark_note(
                        note.note.round() as i32,
                        v.note_range,
                        note.volume,
                        v.colors[ch],
                    );
                }
            }
        }
        self.keyboard.draw(&mut self.piano_surface);
    }

    /// The three regions top to bottom, with their y offsets.
    pub fn layers(&self) -> [(f64, &S); 3] {
        [
            (self.top.y_pos(), &self.top_surface),
            (self.piano_y, &self.piano_surface),
            (self.bottom.y_pos(), &self.bottom_surface),
        ]
    }

    /// Oldest instant either viewport can still show at `time`.
    pub fn retention_horizon(&self, time: f64) -> f64 {
        time + self.view.bottom_time.min(0.0) - WINDOW_MARGIN
    }

    /// How far past `time` the buffer must reach to fill the top viewport.
    pub fn lookahead(&self) -> f64 {
        self.view.top_time.max(0.0) + WINDOW_MARGIN
    }

    // ─── Settings ───────────────────────────────────────────────────────

    pub fn set_piano_position(&mut self, position: f64) {
        self.view.piano_position = position.clamp(0.0, 1.0);
        self.relayout();
    }

    pub fn set_piano_height(&mut self, height: f64) {
        self.view.piano_height = height.clamp(0.0, 1.0);
        self.relayout();
    }

    pub fn set_note_range(&mut self, range: NoteRange) {
        self.view.note_range = range;
        self.keyboard.set_range(range);
    }

    pub fn set_align_notes(&mut self, align: bool) {
        self.view.align_notes = align;
        self.top.config.align_to_keyboard = align;
        self.bottom.config.align_to_keyboard = align;
    }

    pub fn set_out_of_range(&mut self, mode: OutOfRangeMode) {
        self.view.out_of_range = mode;
        self.keyboard.set_draw_out_of_range(mode.on_keys());
        self.top.config.draw_out_of_range = mode.on_timeline();
        self.bottom.config.draw_out_of_range = mode.on_timeline();
    }

    pub fn show_channel(&mut self, place: Place, channel: usize) {
        self.mask_mut(place).show(channel);
    }

    pub fn hide_channel(&mut self, place: Place, channel: usize) {
        self.mask_mut(place).hide(channel);
    }

    pub fn set_channel_color(&mut self, channel: usize, color: Color) {
        if let Some(c) = self.view.colors.get_mut(channel) {
            *c = color;
        }
    }

    pub fn set_top_time(&mut self, seconds: f64) {
        self.view.top_time = seconds;
        self.relayout();
    }

    /// Set the bottom window explicitly. Turns same-speed mode off.
    pub fn set_bottom_time(&mut self, seconds: f64) {
        self.view.bottom_same_speed = false;
        self.view.bottom_time = seconds;
    }

    pub fn set_bottom_same_speed(&mut self, same: bool) {
        self.view.bottom_same_speed = same;
        self.relayout();
    }

    fn relayout(&mut self) {
        self.resize(self.width, self.height);
    }

    fn mask_mut(&mut self, place: Place) -> &mut ChannelMask {
        match place {
            Place::Top => &mut self.view.top_channels,
            Place::Piano => &mut self.view.piano_channels,
            Place::Bottom => &mut self.view.bottom_channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyboard::PianoKeyboard;
    use crate::surface::RecordingSurface;
    use crate::types::{ChannelState, NoteEvent, Snapshot};

    fn compositor(view: ViewSettings) -> Compositor<RecordingSurface, PianoKeyboard> {
        let kb = PianoKeyboard::new(view.note_range);
        let mut c = Compositor::new(
            view,
            kb,
            RecordingSurface::default(),
            RecordingSurface::default(),
            RecordingSurface::default(),
        );
        c.resize(1000.0, 1000.0);
        c
    }

    fn buffer() -> StateBuffer {
        let mut b = StateBuffer::new();
        let mut batch = Vec::new();
        for i in 0..40 {
            let mut s = Snapshot::empty(i as f64 * 0.05);
            s.channels[2] = ChannelState {
                playing: vec![NoteEvent { note: 60.2, volume: 1.0, state: EnvelopeState::Sustain }],
            };
            batch.push(s);
        }
        b.append(batch).unwrap();
        b
    }

    #[test]
    fn test_layout() {
        let c = compositor(ViewSettings::default());
        let [(top_y, top), (piano_y, piano), (bottom_y, bottom)] = c.layers();
        assert_eq!(top_y, 0.0);
        assert_eq!(top.size(), (1000.0, 700.0));
        assert_eq!(piano_y, 700.0);
        assert_eq!(piano.size().1, 100.0);
        assert_eq!(bottom_y, 800.0);
        assert!((bottom.size().1 - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_speed_scales_by_height_ratio() {
        let c = compositor(ViewSettings::default());
        // 1.5 s over 700 px; bottom is 200 px
        let expected = -200.0 * 1.5 / 700.0;
        assert!((c.view().bottom_time - expected).abs() < 1e-9);

        let mut c = compositor(ViewSettings {
            bottom_same_speed: false,
            ..ViewSettings::default()
        });
        assert_eq!(c.view().bottom_time, -1.0);
        c.set_bottom_same_speed(true);
        assert!((c.view().bottom_time - expected).abs() < 1e-9);
        c.set_top_time(3.0);
        assert!((c.view().bottom_time - 2.0 * expected).abs() < 1e-9);
        c.set_bottom_time(-0.5);
        assert!(!c.view().bottom_same_speed);
        assert_eq!(c.view().bottom_time, -0.5);
    }

    #[test]
    fn test_render_draws_all_regions() {
        let mut c = compositor(ViewSettings::default());
        let b = buffer();
        c.render(1.0, &b);
        let [(_, top), (_, piano), (_, bottom)] = c.layers();
        assert!(top.rects().count() > 0, "upcoming notes drawn");
        assert!(bottom.rects().count() > 0, "past notes drawn");
        let lit = Color::channel_palette()[2];
        assert!(
            piano.rects().any(|op| matches!(op, crate::surface::DrawOp::Rect { color, .. } if *color == lit)),
            "channel 2 key lit on the piano"
        );
    }

    #[test]
    fn test_hidden_channels() {
        let mut c = compositor(ViewSettings::default());
        c.hide_channel(Place::Top, 2);
        c.hide_channel(Place::Piano, 2);
        let b = buffer();
        c.render(1.0, &b);
        let [(_, top), (_, piano), (_, bottom)] = c.layers();
        assert_eq!(top.rects().count(), 0);
        let lit = Color::channel_palette()[2];
        assert!(!piano.rects().any(|op| matches!(op, crate::surface::DrawOp::Rect { color, .. } if *color == lit)));
        assert!(bottom.rects().count() > 0);

        c.show_channel(Place::Top, 2);
        c.render(1.0, &b);
        assert!(c.layers()[0].1.rects().count() > 0);
    }

    #[test]
    fn test_retention_and_lookahead() {
        let c = compositor(ViewSettings {
            bottom_same_speed: false,
            ..ViewSettings::default()
        });
        assert!((c.retention_horizon(10.0) - 8.9).abs() < 1e-9);
        assert!((c.lookahead() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_mode_parse() {
        assert_eq!("keys".parse::<OutOfRangeMode>(), Ok(OutOfRangeMode::OnKeys));
        assert_eq!("Both".parse::<OutOfRangeMode>(), Ok(OutOfRangeMode::OnBoth));
        assert!("sideways".parse::<OutOfRangeMode>().is_err());
        assert!(OutOfRangeMode::OnBoth.on_keys() && OutOfRangeMode::OnBoth.on_timeline());
        assert!(!OutOfRangeMode::Off.on_keys());
    }
}
