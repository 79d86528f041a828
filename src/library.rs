//! Contracts for the audio/file library the driver runs on top of.
//!
//! The compute side never parses ROM containers, sequence banks or audio
//! itself; it goes through these traits. `json_library` provides the
//! implementation the CLI and tests use.

use crate::error::LibraryError;
use crate::types::{ChannelState, PcmBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix of sequence-bank files inside a container.
pub const BANK_SUFFIX: &str = ".sdat";

/// Immediate children of one container directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirListing {
    pub files: Vec<String>,
    pub directories: Vec<String>,
}

/// A read-only filesystem image (e.g. a cartridge ROM).
pub trait Container: Send {
    /// List `path`; `""` is the root.
    fn read_dir(&self, path: &str) -> Result<DirListing, LibraryError>;
    fn read_file(&self, path: &str) -> Result<Vec<u8>, LibraryError>;
}

/// Identity of one sequence inside a bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub id: u32,
    pub name: Option<String>,
}

impl SequenceInfo {
    /// Symbolic name, or `#<id>` for anonymous sequences.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("#{}", self.id),
        }
    }
}

/// How a caller picks a sequence: by symbolic name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceRef {
    Name(String),
    Id(u32),
}

impl SequenceRef {
    /// `"#12"` selects id 12, anything else is a name.
    pub fn parse(label: &str) -> Self {
        if let Some(rest) = label.strip_prefix('#') {
            if let Ok(id) = rest.parse() {
                return SequenceRef::Id(id);
            }
        }
        SequenceRef::Name(label.to_string())
    }

    pub fn matches(&self, info: &SequenceInfo) -> bool {
        match self {
            SequenceRef::Name(n) => info.name.as_deref() == Some(n.as_str()),
            SequenceRef::Id(id) => info.id == *id,
        }
    }
}

impl fmt::Display for SequenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceRef::Name(n) => write!(f, "{}", n),
            SequenceRef::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// Receives every full audio buffer a renderer produces.
pub type PcmSink = Box<dyn FnMut(PcmBuffer) + Send>;

pub struct RendererConfig {
    pub sample_rate: u32,
    /// Samples per pcm buffer handed to the sink.
    pub buffer_length: usize,
    pub sink: PcmSink,
}

/// Plays one sequence, one sequencer tick at a time.
pub trait SequenceRenderer: Send {
    fn sample_rate(&self) -> u32;
    /// Fractional: sequencer ticks don't line up with sample boundaries.
    fn samples_per_tick(&self) -> f64;
    /// Advance one tick, rendering its audio. The sink fires whenever a
    /// buffer fills.
    fn tick(&mut self) -> Result<(), LibraryError>;
    /// Playback seconds rendered so far.
    fn time(&self) -> f64;
    /// Voices sounding right now, one entry per channel.
    fn channel_states(&self) -> Vec<ChannelState>;
    /// Hand any partially filled buffer to the sink.
    fn flush(&mut self);
}

/// A parsed sequence bank.
pub trait SequenceBank: Send {
    fn sequences(&self) -> Vec<SequenceInfo>;
    fn renderer(
        &self,
        sequence: &SequenceRef,
        config: RendererConfig,
    ) -> Result<Box<dyn SequenceRenderer>, LibraryError>;
}

/// Entry point of a backend: turns raw bytes into containers and banks.
pub trait Library: Send {
    fn open_container(&self, bytes: Vec<u8>) -> Result<Box<dyn Container>, LibraryError>;
    fn open_bank(&self, bytes: Vec<u8>) -> Result<Box<dyn SequenceBank>, LibraryError>;
}

/// Recursively collect every file under the container root whose name ends
/// with `suffix`, as `/`-joined paths relative to the root.
pub fn find_files(container: &dyn Container, suffix: &str) -> Result<Vec<String>, LibraryError> {
    let mut found = Vec::new();
    walk(container, "", suffix, &mut found)?;
    Ok(found)
}

fn walk(
    container: &dyn Container,
    path: &str,
    suffix: &str,
    found: &mut Vec<String>,
) -> Result<(), LibraryError> {
    let listing = container.read_dir(path)?;
    for file in &listing.files {
        if file.ends_with(suffix) {
            found.push(join(path, file));
        }
    }
    for dir in &listing.directories {
        walk(container, &join(path, dir), suffix, found)?;
    }
    Ok(())
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}
