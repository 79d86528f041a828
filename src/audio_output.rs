//! Pcm playback. The queue and clock are plain Rust; the cpal device stream
//! is behind the `audio` feature.

use crate::types::{PcmBuffer, PlaybackClock};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::warn;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pcm buffers queued ahead of the device.
const QUEUE_BUFFERS: usize = 64;

/// Playback position derived from samples actually handed to the device.
#[derive(Clone)]
pub struct SampleClock {
    played: Arc<AtomicU64>,
    sample_rate: u32,
}

impl PlaybackClock for SampleClock {
    fn time(&self) -> f64 {
        self.played.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }
}

/// Producer half: the control thread pushes pcm buffers in stream order.
#[derive(Clone)]
pub struct PcmSender {
    tx: Sender<Vec<f32>>,
}

impl PcmSender {
    /// Queue a buffer. Returns false if the queue is full and it was dropped.
    pub fn push(&self, buffer: PcmBuffer) -> bool {
        match self.tx.try_send(buffer.samples) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Audio queue full, dropping a pcm buffer");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Consumer half, owned by the device callback. Underruns play silence
/// and do not advance the clock.
pub struct PcmQueue {
    rx: Receiver<Vec<f32>>,
    pending: VecDeque<f32>,
    played: Arc<AtomicU64>,
}

impl PcmQueue {
    pub fn new(sample_rate: u32) -> (PcmSender, PcmQueue, SampleClock) {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_BUFFERS);
        let played = Arc::new(AtomicU64::new(0));
        let clock = SampleClock {
            played: played.clone(),
            sample_rate,
        };
        let queue = PcmQueue {
            rx,
            pending: VecDeque::new(),
            played,
        };
        (PcmSender { tx }, queue, clock)
    }

    /// Fill an interleaved device buffer, copying each mono sample to every
    /// channel.
    pub fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        while self.pending.len() < frames {
            match self.rx.try_recv() {
                Ok(samples) => self.pending.extend(samples),
                Err(_) => break,
            }
        }

        let mut played = 0;
        for frame in out.chunks_mut(channels) {
            let s = match self.pending.pop_front() {
                Some(s) => {
                    played += 1;
                    s
                }
                None => 0.0,
            };
            frame.iter_mut().for_each(|o| *o = s);
        }
        self.played.fetch_add(played, Ordering::Relaxed);
    }
}

#[cfg(feature = "audio")]
pub use device::AudioOutput;

#[cfg(feature = "audio")]
mod device {
    use super::{PcmQueue, PcmSender, SampleClock};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig};
    use log::{error, info};

    /// Live playback via cpal. Holds the stream alive; drop to stop.
    pub struct AudioOutput {
        _stream: Stream,
    }

    impl AudioOutput {
        /// Open the default output device at `sample_rate` and start playing
        /// whatever is pushed into the returned sender.
        pub fn start(sample_rate: u32) -> Result<(Self, PcmSender, SampleClock), String> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "No default audio output device found".to_string())?;
            info!(
                "Audio output: {}",
                device.name().unwrap_or_else(|_| "unknown".into())
            );

            let wanted = cpal::SampleRate(sample_rate);
            let supported = device
                .supported_output_configs()
                .map_err(|e| format!("No supported output config: {e}"))?
                .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
                .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
                .max_by_key(|c| c.sample_format() == SampleFormat::F32)
                .map(|c| c.with_sample_rate(wanted))
                .ok_or_else(|| format!("Output device cannot play {} Hz", sample_rate))?;

            let format = supported.sample_format();
            let config: StreamConfig = supported.into();
            let channels = config.channels as usize;
            info!("Playback config: {}Hz  {} ch  {:?}", sample_rate, channels, format);

            let (sender, mut queue, clock) = PcmQueue::new(sample_rate);
            let err_fn = |e: cpal::StreamError| error!("Audio stream error: {e}");

            let stream = match format {
                SampleFormat::F32 => device
                    .build_output_stream(
                        &config,
                        move |data: &mut [f32], _| queue.fill(data, channels),
                        err_fn,
                        None,
                    )
                    .map_err(|e| e.to_string())?,
                _ => {
                    let mut scratch = Vec::new();
                    device
                        .build_output_stream(
                            &config,
                            move |data: &mut [i16], _| {
                                scratch.resize(data.len(), 0.0f32);
                                queue.fill(&mut scratch, channels);
                                for (o, s) in data.iter_mut().zip(&scratch) {
                                    *o = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                                }
                            },
                            err_fn,
                            None,
                        )
                        .map_err(|e| e.to_string())?
                }
            };
            stream.play().map_err(|e| e.to_string())?;

            Ok((Self { _stream: stream }, sender, clock))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: Vec<f32>) -> PcmBuffer {
        PcmBuffer { samples, sample_rate: 4 }
    }

    #[test]
    fn test_fill_interleaves_and_counts() {
        let (tx, mut q, clock) = PcmQueue::new(4);
        assert!(tx.push(pcm(vec![0.1, 0.2, 0.3])));
        let mut out = [9.0f32; 4];
        q.fill(&mut out, 2);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
        assert_eq!(clock.time(), 0.5);
    }

    #[test]
    fn test_underrun_plays_silence_without_advancing() {
        let (tx, mut q, clock) = PcmQueue::new(4);
        tx.push(pcm(vec![0.5]));
        let mut out = [1.0f32; 3];
        q.fill(&mut out, 1);
        assert_eq!(out, [0.5, 0.0, 0.0]);
        assert_eq!(clock.time(), 0.25);
        q.fill(&mut out, 1);
        assert_eq!(clock.time(), 0.25);
    }

    #[test]
    fn test_full_queue_drops() {
        let (tx, _q, _clock) = PcmQueue::new(4);
        for _ in 0..QUEUE_BUFFERS {
            assert!(tx.push(pcm(vec![0.0])));
        }
        assert!(!tx.push(pcm(vec![0.0])));
    }
}
