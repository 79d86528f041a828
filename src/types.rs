use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Synthesizer channels per loaded sequence.
pub const CHANNEL_COUNT: usize = 16;

/// Output sample rate of every renderer the driver builds.
pub const SAMPLE_RATE: u32 = 48000;

/// Samples accumulated by a renderer before its pcm sink fires.
pub const PCM_BUFFER_LENGTH: usize = 1024 * 16;

/// Margin added on both ends of a viewport window when gathering snapshots,
/// so notes don't pop in and out at the edges.
pub const WINDOW_MARGIN: f64 = 0.1;

// ─── Synth state ────────────────────────────────────────────────────────────

/// Envelope phase of a sounding voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeState {
    Attack,
    Decay,
    Sustain,
    /// Key released, still fading. Not drawn on-range.
    Release,
    Off,
}

/// One sounding voice at the instant of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Semitone pitch (MIDI numbering), fractional under pitch bend.
    pub note: f64,
    /// Current loudness, 0.0–1.0.
    pub volume: f32,
    pub state: EnvelopeState,
}

/// Every voice sounding on one synthesizer channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub playing: Vec<NoteEvent>,
}

/// Complete synth state after one tick, tagged with absolute playback time.
/// Produced by the driver, consumed by the state buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Playback seconds since the sequence was loaded.
    pub time: f64,
    /// Indexed by channel, always `CHANNEL_COUNT` entries.
    pub channels: Vec<ChannelState>,
}

impl Snapshot {
    /// Silent state at `time`.
    pub fn empty(time: f64) -> Self {
        Self {
            time,
            channels: vec![ChannelState::default(); CHANNEL_COUNT],
        }
    }

    pub fn note_count(&self) -> usize {
        self.channels.iter().map(|c| c.playing.len()).sum()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={:>8.3}s ", self.time)?;
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.playing.is_empty() {
                continue;
            }
            write!(f, " ch{}[", i)?;
            for (j, n) in ch.playing.iter().enumerate() {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{:.1}@{:.2}", n.note, n.volume)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

// ─── Audio data ─────────────────────────────────────────────────────────────

/// A block of rendered mono audio pushed out by a renderer's sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcmBuffer {
    /// Mono f32 samples, normalized -1.0 to 1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

// ─── View primitives ────────────────────────────────────────────────────────

/// Bit per channel; bit `i` set means channel `i` is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask(pub u16);

impl ChannelMask {
    pub const ALL: ChannelMask = ChannelMask(0xffff);
    pub const NONE: ChannelMask = ChannelMask(0);

    pub fn contains(self, channel: usize) -> bool {
        channel < CHANNEL_COUNT && self.0 & (1 << channel) != 0
    }

    pub fn show(&mut self, channel: usize) {
        if channel < CHANNEL_COUNT {
            self.0 |= 1 << channel;
        }
    }

    pub fn hide(&mut self, channel: usize) {
        if channel < CHANNEL_COUNT {
            self.0 &= !(1 << channel);
        }
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Inclusive range of semitones shown on the keyboard and timelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteRange {
    pub low: u8,
    pub high: u8,
}

impl NoteRange {
    /// C-1 through B8, the full range the sequence format can address.
    pub const FULL: NoteRange = NoteRange { low: 0, high: 119 };

    pub fn new(low: u8, high: u8) -> Result<Self, String> {
        if low >= high {
            return Err(format!("note range {}-{} is empty", low, high));
        }
        Ok(Self { low, high })
    }

    /// Number of semitone steps between the bounds.
    pub fn span(&self) -> f64 {
        (self.high - self.low) as f64
    }

    pub fn contains(&self, note: f64) -> bool {
        note >= self.low as f64 && note <= self.high as f64
    }
}

impl std::str::FromStr for NoteRange {
    type Err = String;

    /// Parses `"21-108"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lo, hi) = s
            .split_once('-')
            .ok_or_else(|| format!("expected LOW-HIGH, got {:?}", s))?;
        let lo: u8 = lo.trim().parse().map_err(|e| format!("low note: {}", e))?;
        let hi: u8 = hi.trim().parse().map_err(|e| format!("high note: {}", e))?;
        NoteRange::new(lo, hi)
    }
}

/// 24-bit fill color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };
    pub const WHITE: Color = Color { r: 255, g: 255, b: 255 };

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Hue in degrees, saturation and lightness 0.0–1.0.
    pub fn from_hsl(hue: f32, saturation: f32, lightness: f32) -> Self {
        let h = hue.rem_euclid(360.0) / 60.0;
        let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let (r, g, b) = match h as u32 {
            0 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let m = lightness - c / 2.0;
        let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Self::rgb(to_u8(r), to_u8(g), to_u8(b))
    }

    /// The default per-channel palette: evenly spaced fully-saturated hues.
    pub fn channel_palette() -> [Color; CHANNEL_COUNT] {
        let mut colors = [Color::BLACK; CHANNEL_COUNT];
        for (i, c) in colors.iter_mut().enumerate() {
            *c = Color::from_hsl(i as f32 * 360.0 / CHANNEL_COUNT as f32, 1.0, 0.5);
        }
        colors
    }
}

// ─── Playback clock ─────────────────────────────────────────────────────────

/// Source of the current playback position in seconds.
pub trait PlaybackClock {
    fn time(&self) -> f64;
}

/// Monotonic wall clock, used when no audio output drives playback.
#[derive(Clone)]
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for WallClock {
    fn time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// MIDI note number → frequency.
pub fn midi_to_hz(note: f64) -> f64 {
    440.0 * 2.0f64.powf((note - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mask_show_hide() {
        let mut m = ChannelMask::ALL;
        assert!(m.contains(3));
        m.hide(3);
        assert!(!m.contains(3));
        assert!(m.contains(4));
        m.show(3);
        assert_eq!(m, ChannelMask::ALL);
        assert!(!m.contains(16), "out of range channel is never visible");
    }

    #[test]
    fn test_note_range_parse() {
        let r: NoteRange = "21-108".parse().unwrap();
        assert_eq!(r, NoteRange { low: 21, high: 108 });
        assert!(r.contains(21.0));
        assert!(r.contains(108.0));
        assert!(!r.contains(108.5));
        assert!("60-60".parse::<NoteRange>().is_err());
        assert!("sixty".parse::<NoteRange>().is_err());
    }

    #[test]
    fn test_hsl_primaries() {
        assert_eq!(Color::from_hsl(0.0, 1.0, 0.5), Color::rgb(255, 0, 0));
        assert_eq!(Color::from_hsl(120.0, 1.0, 0.5), Color::rgb(0, 255, 0));
        assert_eq!(Color::from_hsl(240.0, 1.0, 0.5), Color::rgb(0, 0, 255));
        let palette = Color::channel_palette();
        assert_eq!(palette[0], Color::rgb(255, 0, 0));
    }

    #[test]
    fn test_midi_to_hz() {
        assert!((midi_to_hz(69.0) - 440.0).abs() < 1e-9);
        assert!((midi_to_hz(60.0) - 261.63).abs() < 0.01);
    }
}
