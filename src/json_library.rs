//! Self-contained backend for the library traits.
//!
//! Containers are JSON directory trees, banks are JSON scores, and the
//! renderer is a small deterministic voice engine: one sine voice per note
//! with a linear ADSR envelope, ticked at the Nitro sequencer rate.

use crate::error::LibraryError;
use crate::library::{
    Container, DirListing, Library, PcmSink, RendererConfig, SequenceBank, SequenceInfo,
    SequenceRef, SequenceRenderer,
};
use crate::types::*;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;

/// Length of one sequencer tick: 64 × 2728 cycles of the 33.51 MHz bus clock.
pub const TICK_SECONDS: f64 = 64.0 * 2728.0 / 33_513_982.0;

/// Per-voice gain before the mix, keeps a handful of voices below clipping.
const VOICE_GAIN: f64 = 0.2;

// ─── Container ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirNode {
    /// File name → content. Non-string values are stored as their JSON text.
    #[serde(default)]
    pub files: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub dirs: BTreeMap<String, DirNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDoc {
    pub root: DirNode,
}

pub struct JsonContainer {
    root: DirNode,
}

impl JsonContainer {
    fn dir(&self, path: &str) -> Option<&DirNode> {
        let mut node = &self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.dirs.get(part)?;
        }
        Some(node)
    }
}

impl Container for JsonContainer {
    fn read_dir(&self, path: &str) -> Result<DirListing, LibraryError> {
        let node = self
            .dir(path)
            .ok_or_else(|| LibraryError::NotFound(path.to_string()))?;
        Ok(DirListing {
            files: node.files.keys().cloned().collect(),
            directories: node.dirs.keys().cloned().collect(),
        })
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, LibraryError> {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let value = self
            .dir(dir)
            .and_then(|d| d.files.get(name))
            .ok_or_else(|| LibraryError::NotFound(path.to_string()))?;
        match value {
            serde_json::Value::String(s) => Ok(s.clone().into_bytes()),
            other => serde_json::to_vec(other)
                .map_err(|e| LibraryError::MalformedContainer(e.to_string())),
        }
    }
}

// ─── Bank format ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeDoc {
    /// Seconds from silence to full level.
    pub attack: f64,
    /// Seconds from full level down to `sustain`.
    pub decay: f64,
    pub sustain: f32,
    /// Seconds from full level to silence after key-off.
    pub release: f64,
}

impl Default for EnvelopeDoc {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.15,
            sustain: 0.7,
            release: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteDoc {
    /// Beats from the start of the sequence.
    pub start: f64,
    /// Beats held before key-off.
    pub length: f64,
    pub note: u8,
    pub velocity: u8,
}

/// Track-wide pitch bend, in effect from `at` (beats) until the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BendDoc {
    pub at: f64,
    pub semitones: f64,
}

fn unity() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDoc {
    pub channel: usize,
    #[serde(default = "unity")]
    pub volume: f32,
    #[serde(default)]
    pub notes: Vec<NoteDoc>,
    #[serde(default)]
    pub bends: Vec<BendDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDoc {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Beats per minute.
    pub tempo: f64,
    #[serde(default)]
    pub envelope: EnvelopeDoc,
    pub tracks: Vec<TrackDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankDoc {
    pub sequences: Vec<SequenceDoc>,
}

impl BankDoc {
    fn validate(&self) -> Result<(), String> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for seq in &self.sequences {
            if !ids.insert(seq.id) {
                return Err(format!("duplicate sequence id {}", seq.id));
            }
            if let Some(name) = &seq.name {
                if !names.insert(name.as_str()) {
                    return Err(format!("duplicate sequence name {}", name));
                }
            }
            if !(seq.tempo.is_finite() && seq.tempo > 0.0) {
                return Err(format!("sequence {}: tempo must be positive", seq.id));
            }
            let env = &seq.envelope;
            if env.attack < 0.0 || env.decay < 0.0 || env.release < 0.0 {
                return Err(format!("sequence {}: negative envelope time", seq.id));
            }
            if !(0.0..=1.0).contains(&env.sustain) {
                return Err(format!("sequence {}: sustain outside 0..1", seq.id));
            }
            for track in &seq.tracks {
                if track.channel >= CHANNEL_COUNT {
                    return Err(format!(
                        "sequence {}: channel {} out of range",
                        seq.id, track.channel
                    ));
                }
                for n in &track.notes {
                    if n.velocity > 127 || n.note > 127 {
                        return Err(format!("sequence {}: note event out of range", seq.id));
                    }
                    if !(n.start >= 0.0 && n.length > 0.0) {
                        return Err(format!(
                            "sequence {}: note at beat {} has no duration",
                            seq.id, n.start
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct JsonBank {
    doc: BankDoc,
}

impl SequenceBank for JsonBank {
    fn sequences(&self) -> Vec<SequenceInfo> {
        self.doc
            .sequences
            .iter()
            .map(|s| SequenceInfo {
                id: s.id,
                name: s.name.clone(),
            })
            .collect()
    }

    fn renderer(
        &self,
        sequence: &SequenceRef,
        config: RendererConfig,
    ) -> Result<Box<dyn SequenceRenderer>, LibraryError> {
        let seq = self
            .doc
            .sequences
            .iter()
            .find(|s| {
                sequence.matches(&SequenceInfo {
                    id: s.id,
                    name: s.name.clone(),
                })
            })
            .ok_or_else(|| LibraryError::UnknownSequence(sequence.to_string()))?;
        Ok(Box::new(JsonRenderer::new(seq.clone(), config)))
    }
}

/// The backend entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLibrary;

impl Library for JsonLibrary {
    fn open_container(&self, bytes: Vec<u8>) -> Result<Box<dyn Container>, LibraryError> {
        let doc: ContainerDoc = serde_json::from_slice(&bytes)
            .map_err(|e| LibraryError::MalformedContainer(e.to_string()))?;
        Ok(Box::new(JsonContainer { root: doc.root }))
    }

    fn open_bank(&self, bytes: Vec<u8>) -> Result<Box<dyn SequenceBank>, LibraryError> {
        let doc: BankDoc = serde_json::from_slice(&bytes)
            .map_err(|e| LibraryError::MalformedBank(e.to_string()))?;
        doc.validate().map_err(LibraryError::MalformedBank)?;
        Ok(Box::new(JsonBank { doc }))
    }
}

// ─── Voice engine ───────────────────────────────────────────────────────────

struct Voice {
    channel: usize,
    track: usize,
    key: u8,
    /// Beat at which the key is released.
    end_beat: f64,
    gain: f32,
    level: f32,
    state: EnvelopeState,
    phase: f64,
}

/// Renders a `SequenceDoc` tick by tick.
pub struct JsonRenderer {
    sequence: SequenceDoc,
    sample_rate: u32,
    samples_per_tick: f64,
    ticks: u64,
    /// Next unplayed note per track (notes are sorted by start).
    cursors: Vec<usize>,
    /// Bend currently in effect per track.
    bends: Vec<f64>,
    voices: Vec<Voice>,
    /// Fractional samples owed to the next tick.
    sample_debt: f64,
    pcm: Vec<f32>,
    buffer_length: usize,
    sink: PcmSink,
}

impl JsonRenderer {
    pub fn new(mut sequence: SequenceDoc, config: RendererConfig) -> Self {
        for track in &mut sequence.tracks {
            track.notes.sort_by(|a, b| a.start.total_cmp(&b.start));
            track.bends.sort_by(|a, b| a.at.total_cmp(&b.at));
        }
        let tracks = sequence.tracks.len();
        debug!(
            "Renderer for sequence {} ({} tracks, {} bpm)",
            sequence.id, tracks, sequence.tempo
        );
        Self {
            sample_rate: config.sample_rate,
            samples_per_tick: config.sample_rate as f64 * TICK_SECONDS,
            sequence,
            ticks: 0,
            cursors: vec![0; tracks],
            bends: vec![0.0; tracks],
            voices: Vec::new(),
            sample_debt: 0.0,
            pcm: Vec::with_capacity(config.buffer_length),
            buffer_length: config.buffer_length.max(1),
            sink: config.sink,
        }
    }

    fn beat_at(&self, seconds: f64) -> f64 {
        seconds * self.sequence.tempo / 60.0
    }

    fn note_on(&mut self, track: usize, note: &NoteDoc) {
        let channel = self.sequence.tracks[track].channel;
        // One voice per pitch per channel: a repeated key retriggers.
        self.voices
            .retain(|v| !(v.channel == channel && v.key == note.note));
        self.voices.push(Voice {
            channel,
            track,
            key: note.note,
            end_beat: note.start + note.length,
            gain: note.velocity as f32 / 127.0 * self.sequence.tracks[track].volume,
            level: 0.0,
            state: EnvelopeState::Attack,
            phase: 0.0,
        });
    }

    fn advance_envelopes(&mut self, dt: f64) {
        let env = self.sequence.envelope;
        for v in &mut self.voices {
            match v.state {
                EnvelopeState::Attack => {
                    v.level = if env.attack <= 0.0 {
                        1.0
                    } else {
                        v.level + (dt / env.attack) as f32
                    };
                    if v.level >= 1.0 {
                        v.level = 1.0;
                        v.state = EnvelopeState::Decay;
                    }
                }
                EnvelopeState::Decay => {
                    v.level = if env.decay <= 0.0 {
                        env.sustain
                    } else {
                        v.level - (dt / env.decay) as f32 * (1.0 - env.sustain)
                    };
                    if v.level <= env.sustain {
                        v.level = env.sustain;
                        v.state = EnvelopeState::Sustain;
                    }
                }
                EnvelopeState::Sustain => {}
                EnvelopeState::Release => {
                    v.level = if env.release <= 0.0 {
                        0.0
                    } else {
                        v.level - (dt / env.release) as f32
                    };
                    if v.level <= 0.0 {
                        v.level = 0.0;
                        v.state = EnvelopeState::Off;
                    }
                }
                EnvelopeState::Off => {}
            }
        }
        self.voices.retain(|v| v.state != EnvelopeState::Off);
    }

    fn pitch(&self, v: &Voice) -> f64 {
        v.key as f64 + self.bends[v.track]
    }

    fn render_audio(&mut self) {
        self.sample_debt += self.samples_per_tick;
        let count = self.sample_debt.floor() as usize;
        self.sample_debt -= count as f64;

        let increments: Vec<f64> = self
            .voices
            .iter()
            .map(|v| 2.0 * PI * midi_to_hz(self.pitch(v)) / self.sample_rate as f64)
            .collect();

        for _ in 0..count {
            let mut sample = 0.0f64;
            for (v, inc) in self.voices.iter_mut().zip(&increments) {
                sample += v.phase.sin() * (v.level * v.gain) as f64 * VOICE_GAIN;
                v.phase = (v.phase + inc) % (2.0 * PI);
            }
            self.pcm.push(sample as f32);
            if self.pcm.len() >= self.buffer_length {
                self.flush();
            }
        }
    }
}

impl SequenceRenderer for JsonRenderer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn samples_per_tick(&self) -> f64 {
        self.samples_per_tick
    }

    fn tick(&mut self) -> Result<(), LibraryError> {
        self.ticks += 1;
        let to = self.beat_at(self.time());

        for track in 0..self.sequence.tracks.len() {
            while let Some(note) = self.sequence.tracks[track]
                .notes
                .get(self.cursors[track])
                .cloned()
            {
                if note.start >= to {
                    break;
                }
                self.cursors[track] += 1;
                self.note_on(track, &note);
            }
            if let Some(bend) = self.sequence.tracks[track]
                .bends
                .iter()
                .take_while(|b| b.at < to)
                .last()
            {
                self.bends[track] = bend.semitones;
            }
        }

        for v in &mut self.voices {
            if v.end_beat <= to
                && v.state != EnvelopeState::Release
                && v.state != EnvelopeState::Off
            {
                v.state = EnvelopeState::Release;
            }
        }

        self.advance_envelopes(TICK_SECONDS);
        self.render_audio();
        Ok(())
    }

    fn time(&self) -> f64 {
        self.ticks as f64 * self.samples_per_tick / self.sample_rate as f64
    }

    fn channel_states(&self) -> Vec<ChannelState> {
        let mut channels = vec![ChannelState::default(); CHANNEL_COUNT];
        for v in &self.voices {
            channels[v.channel].playing.push(NoteEvent {
                note: self.pitch(v),
                volume: (v.level * v.gain).clamp(0.0, 1.0),
                state: v.state,
            });
        }
        channels
    }

    fn flush(&mut self) {
        if self.pcm.is_empty() {
            return;
        }
        let samples = std::mem::replace(&mut self.pcm, Vec::with_capacity(self.buffer_length));
        (self.sink)(PcmBuffer {
            samples,
            sample_rate: self.sample_rate,
        });
    }
}

// ─── Demo content ───────────────────────────────────────────────────────────

/// A bank with a few short sequences exercising chords, runs, bends and
/// out-of-range notes.
pub fn demo_bank() -> BankDoc {
    let scale = [0u8, 2, 4, 5, 7, 9, 11, 12];

    // Two-octave arpeggio on channel 0, bass on channel 1
    let arpeggio: Vec<NoteDoc> = (0..32)
        .map(|i| NoteDoc {
            start: i as f64 * 0.25,
            length: 0.2,
            note: 60 + scale[i % scale.len()] + if i % 16 >= 8 { 12 } else { 0 },
            velocity: 100,
        })
        .collect();
    let bass: Vec<NoteDoc> = [36u8, 41, 43, 36]
        .iter()
        .enumerate()
        .map(|(i, &n)| NoteDoc {
            start: i as f64 * 2.0,
            length: 1.9,
            note: n,
            velocity: 110,
        })
        .collect();

    // Chord pads spread across channels 2–4, with a bent lead on 5
    let chords = [[60u8, 64, 67], [57, 60, 64], [53, 57, 60], [55, 59, 62]];
    let pads: Vec<TrackDoc> = (0..3)
        .map(|voice| TrackDoc {
            channel: 2 + voice,
            volume: 0.6,
            notes: chords
                .iter()
                .enumerate()
                .map(|(i, chord)| NoteDoc {
                    start: i as f64 * 2.0,
                    length: 2.0,
                    note: chord[voice],
                    velocity: 80,
                })
                .collect(),
            bends: Vec::new(),
        })
        .collect();
    let lead = TrackDoc {
        channel: 5,
        volume: 0.9,
        notes: vec![
            NoteDoc { start: 0.0, length: 3.0, note: 72, velocity: 100 },
            NoteDoc { start: 4.0, length: 3.0, note: 76, velocity: 100 },
            // Outside a standard 88-key range
            NoteDoc { start: 7.5, length: 0.5, note: 112, velocity: 90 },
            NoteDoc { start: 7.5, length: 0.5, note: 12, velocity: 90 },
        ],
        bends: vec![
            BendDoc { at: 1.0, semitones: 0.5 },
            BendDoc { at: 1.5, semitones: 1.0 },
            BendDoc { at: 2.5, semitones: 0.0 },
        ],
    };

    let mut tracks = vec![
        TrackDoc { channel: 0, volume: 1.0, notes: arpeggio, bends: Vec::new() },
        TrackDoc { channel: 1, volume: 1.0, notes: bass, bends: Vec::new() },
    ];
    tracks.extend(pads);
    tracks.push(lead);

    BankDoc {
        sequences: vec![
            SequenceDoc {
                id: 0,
                name: Some("SEQ_DEMO".into()),
                tempo: 120.0,
                envelope: EnvelopeDoc::default(),
                tracks,
            },
            SequenceDoc {
                id: 1,
                name: None,
                tempo: 90.0,
                envelope: EnvelopeDoc { attack: 0.05, decay: 0.3, sustain: 0.5, release: 0.6 },
                tracks: vec![TrackDoc {
                    channel: 9,
                    volume: 1.0,
                    notes: (0..16)
                        .map(|i| NoteDoc {
                            start: i as f64 * 0.5,
                            length: 0.25,
                            note: 48 + (i * 5 % 24) as u8,
                            velocity: 64 + (i * 4) as u8,
                        })
                        .collect(),
                    bends: Vec::new(),
                }],
            },
        ],
    }
}

/// Serialized demo container holding the demo bank twice at different
/// depths, plus unrelated files.
pub fn demo_container_bytes() -> Vec<u8> {
    let bank = serde_json::to_value(demo_bank()).unwrap_or_default();
    let mut sound = DirNode::default();
    sound.files.insert("demo.sdat".into(), bank.clone());
    sound.files.insert("credits.txt".into(), "demo content".into());
    let mut extra = DirNode::default();
    extra.files.insert("copy.sdat".into(), bank);
    sound.dirs.insert("extra".into(), extra);

    let mut root = DirNode::default();
    root.files.insert("banner.bin".into(), "NDS".into());
    root.dirs.insert("sound".into(), sound);
    serde_json::to_vec(&ContainerDoc { root }).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::find_files;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn collect_sink() -> (PcmSink, Arc<Mutex<Vec<PcmBuffer>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let out2 = out.clone();
        (Box::new(move |b| out2.lock().unwrap().push(b)), out)
    }

    fn config(sink: PcmSink) -> RendererConfig {
        RendererConfig {
            sample_rate: SAMPLE_RATE,
            buffer_length: 1024,
            sink,
        }
    }

    fn one_note_bank(length: f64) -> BankDoc {
        BankDoc {
            sequences: vec![SequenceDoc {
                id: 4,
                name: Some("ONE".into()),
                tempo: 60.0,
                envelope: EnvelopeDoc::default(),
                tracks: vec![TrackDoc {
                    channel: 3,
                    volume: 1.0,
                    notes: vec![NoteDoc { start: 0.0, length, note: 60, velocity: 127 }],
                    bends: Vec::new(),
                }],
            }],
        }
    }

    #[test]
    fn test_discovery_scenario() {
        let doc = json!({"root": {
            "files": {"b.sdat": {}, "b.txt": "x"},
            "dirs": {
                "a": {
                    "files": {"x.sdat": {}, "x.sdat.bak": "x"},
                    "dirs": {"c": {"files": {"y.sdat": {}}}}
                },
                "empty": {}
            }
        }});
        let container = JsonLibrary
            .open_container(serde_json::to_vec(&doc).unwrap())
            .unwrap();
        let mut found = find_files(&*container, ".sdat").unwrap();
        found.sort();
        assert_eq!(found, vec!["a/c/y.sdat", "a/x.sdat", "b.sdat"]);
    }

    #[test]
    fn test_read_file_string_and_json() {
        let doc = json!({"root": {"dirs": {"d": {"files": {"t.txt": "hello", "j.sdat": {"k": 1}}}}}});
        let c = JsonLibrary.open_container(serde_json::to_vec(&doc).unwrap()).unwrap();
        assert_eq!(c.read_file("d/t.txt").unwrap(), b"hello");
        let v: serde_json::Value = serde_json::from_slice(&c.read_file("d/j.sdat").unwrap()).unwrap();
        assert_eq!(v["k"], 1);
        assert!(matches!(c.read_file("d/none"), Err(LibraryError::NotFound(_))));
        assert!(matches!(c.read_dir("nope"), Err(LibraryError::NotFound(_))));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            JsonLibrary.open_container(b"not json".to_vec()),
            Err(LibraryError::MalformedContainer(_))
        ));
        let mut bank = one_note_bank(1.0);
        bank.sequences[0].tracks[0].channel = 16;
        assert!(matches!(
            JsonLibrary.open_bank(serde_json::to_vec(&bank).unwrap()),
            Err(LibraryError::MalformedBank(_))
        ));
    }

    #[test]
    fn test_envelope_lifecycle() {
        // 1 beat at 60 bpm = 1 second held, then ~0.25s release
        let bank = JsonLibrary
            .open_bank(serde_json::to_vec(&one_note_bank(1.0)).unwrap())
            .unwrap();
        let (sink, _) = collect_sink();
        let mut r = bank.renderer(&SequenceRef::Id(4), config(sink)).unwrap();

        r.tick().unwrap();
        let first = r.channel_states();
        assert_eq!(first[3].playing.len(), 1);
        assert_eq!(first[3].playing[0].state, EnvelopeState::Attack);
        assert_eq!(first[3].playing[0].note, 60.0);

        let mut seen = vec![first[3].playing[0].state];
        while r.time() < 1.6 {
            r.tick().unwrap();
            if let Some(n) = r.channel_states()[3].playing.first() {
                if seen.last() != Some(&n.state) {
                    seen.push(n.state);
                }
            }
        }
        assert_eq!(
            seen,
            vec![
                EnvelopeState::Attack,
                EnvelopeState::Decay,
                EnvelopeState::Sustain,
                EnvelopeState::Release
            ]
        );
        assert!(r.channel_states()[3].playing.is_empty(), "voice should be gone after release");
    }

    #[test]
    fn test_pcm_sink_fills_buffers() {
        let bank = JsonLibrary
            .open_bank(serde_json::to_vec(&one_note_bank(4.0)).unwrap())
            .unwrap();
        let (sink, out) = collect_sink();
        let mut r = bank.renderer(&SequenceRef::Name("ONE".into()), config(sink)).unwrap();
        for _ in 0..100 {
            r.tick().unwrap();
        }
        // 100 ticks ≈ 25006 samples → 24 full buffers of 1024
        let full = out.lock().unwrap().len();
        assert_eq!(full, 24);
        r.flush();
        let bufs = out.lock().unwrap();
        let total: usize = bufs.iter().map(|b| b.samples.len()).sum();
        assert_eq!(total, (100.0 * r.samples_per_tick()).floor() as usize);
        assert!(bufs[0].samples.iter().any(|s| s.abs() > 0.01), "note should be audible");
    }

    #[test]
    fn test_unknown_sequence() {
        let bank = JsonLibrary
            .open_bank(serde_json::to_vec(&one_note_bank(1.0)).unwrap())
            .unwrap();
        let (sink, _) = collect_sink();
        assert!(matches!(
            bank.renderer(&SequenceRef::Id(99), config(sink)),
            Err(LibraryError::UnknownSequence(_))
        ));
    }

    #[test]
    fn test_demo_container_is_valid() {
        let c = JsonLibrary.open_container(demo_container_bytes()).unwrap();
        let mut banks = find_files(&*c, ".sdat").unwrap();
        banks.sort();
        assert_eq!(banks, vec!["sound/demo.sdat", "sound/extra/copy.sdat"]);
        let bank = JsonLibrary.open_bank(c.read_file("sound/demo.sdat").unwrap()).unwrap();
        let labels: Vec<String> = bank.sequences().iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["SEQ_DEMO", "#1"]);
    }
}
