use crate::audio_output::PcmSender;
use crate::client::WorkerClient;
use crate::compositor::Compositor;
use crate::console_display::{note_name, AsciiCanvas, ConsoleDisplay};
use crate::error::{RunError, StreamError};
use crate::keyboard::PianoKeyboard;
use crate::protocol::{RendererId, StreamEvent};
use crate::state_buffer::{Prefetcher, StateBuffer};
use crate::types::{EnvelopeState, PlaybackClock};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

/// How snapshots reach the state buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// `tick_seconds` ahead of the clock through a `Prefetcher`.
    Prefetch,
    /// The worker's real-time `state` stream.
    Stream,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub display_hz: u32,
    /// Seconds the buffer is kept ahead of playback, at least what the top
    /// viewport shows.
    pub lookahead: f64,
    /// Seconds simulated per prefetch call.
    pub chunk: f64,
    /// Stop after this many playback seconds.
    pub duration: Option<f64>,
    pub feed: FeedMode,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            display_hz: 30,
            lookahead: 2.0,
            chunk: 0.25,
            duration: None,
            feed: FeedMode::Prefetch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub frames: u64,
    pub snapshots_received: u64,
    pub snapshots_evicted: u64,
    pub prefetch_failures: u64,
    pub last_time: f64,
}

/// Control-side loop: feeds the state buffer, evicts what no viewport can
/// show any more, renders and presents one frame per display tick.
pub struct Coordinator<'a, W: Write> {
    client: &'a WorkerClient,
    stream: Receiver<StreamEvent>,
    sequence: String,
    renderer: RendererId,
    config: CoordinatorConfig,
    buffer: StateBuffer,
    compositor: Compositor<AsciiCanvas, PianoKeyboard>,
    display: ConsoleDisplay<W>,
    prefetcher: Option<Prefetcher>,
    audio: Option<PcmSender>,
    stats: RunStats,
}

impl<'a, W: Write> Coordinator<'a, W> {
    /// `renderer` must have been loaded from `sequence`; the prefetcher
    /// reloads it by name when it has to resynchronize.
    pub fn new(
        client: &'a WorkerClient,
        stream: Receiver<StreamEvent>,
        sequence: &str,
        renderer: RendererId,
        config: CoordinatorConfig,
        compositor: Compositor<AsciiCanvas, PianoKeyboard>,
        display: ConsoleDisplay<W>,
    ) -> Self {
        Self {
            client,
            stream,
            sequence: sequence.to_string(),
            renderer,
            config,
            buffer: StateBuffer::new(),
            compositor,
            display,
            prefetcher: None,
            audio: None,
            stats: RunStats::default(),
        }
    }

    /// Route pcm buffers to an audio output.
    pub fn with_audio(mut self, audio: PcmSender) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn buffer(&self) -> &StateBuffer {
        &self.buffer
    }

    pub fn compositor(&self) -> &Compositor<AsciiCanvas, PianoKeyboard> {
        &self.compositor
    }

    /// Get snapshots flowing: prime the buffer, or start the worker stream.
    /// Blocks until playback can begin.
    pub fn start(&mut self) -> Result<(), RunError> {
        match self.config.feed {
            FeedMode::Prefetch => {
                let lookahead = self.config.lookahead.max(self.compositor.lookahead());
                let mut prefetcher = Prefetcher::new(
                    self.sequence.as_str(),
                    self.renderer,
                    lookahead,
                    self.config.chunk,
                );
                prefetcher.prime(self.client, &mut self.buffer)?;
                self.prefetcher = Some(prefetcher);
                // Pcm rendered while priming goes to the audio queue
                self.pump()?;
            }
            FeedMode::Stream => {
                self.client.start_stream(self.renderer).wait()?;
            }
        }
        Ok(())
    }

    /// Run frames until `duration` elapses or the stream closes.
    pub fn run(&mut self, clock: &dyn PlaybackClock) -> Result<RunStats, RunError> {
        let hz = self.config.display_hz.max(1);
        let period = Duration::from_secs_f64(1.0 / hz as f64);
        info!("Coordinator running at {} Hz ({:?} feed)", hz, self.config.feed);

        let result = self.frames(clock, period);
        if self.config.feed == FeedMode::Stream {
            if let Err(e) = self.client.stop_stream().wait() {
                warn!("stop_stream failed: {}", e);
            }
        }
        result?;

        self.stats.prefetch_failures = self.prefetcher.as_ref().map_or(0, |p| p.failures());
        info!(
            "Coordinator done after {} frames ({:.2}s, {} snapshots received, {} evicted, {} dropped)",
            self.stats.frames,
            self.stats.last_time,
            self.stats.snapshots_received,
            self.stats.snapshots_evicted,
            self.client.dropped_stream_events()
        );
        Ok(self.stats.clone())
    }

    fn frames(&mut self, clock: &dyn PlaybackClock, period: Duration) -> Result<(), RunError> {
        let mut next = Instant::now();
        loop {
            let time = clock.time();
            if self.config.duration.map_or(false, |d| time >= d) {
                return Ok(());
            }

            self.pump()?;
            if let Some(p) = self.prefetcher.as_mut() {
                p.poll(self.client, &mut self.buffer, time);
            }
            let horizon = self.compositor.retention_horizon(time);
            self.stats.snapshots_evicted += self.buffer.evict_before(horizon) as u64;

            self.compositor.render(time, &self.buffer);
            let status = self.status_line(time);
            let [(_, top), (_, piano), (_, bottom)] = self.compositor.layers();
            self.display.present(&[top, piano, bottom], &status)?;
            self.stats.frames += 1;
            self.stats.last_time = time;
            if self.stats.frames % 300 == 0 {
                debug!("{} frames, {} snapshots buffered", self.stats.frames, self.buffer.len());
            }

            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
    }

    /// Drain the stream ring without blocking.
    fn pump(&mut self) -> Result<(), RunError> {
        for event in self.stream.try_iter() {
            match event {
                StreamEvent::Pcm(buffer) => {
                    if let Some(audio) = &self.audio {
                        audio.push(buffer);
                    }
                }
                StreamEvent::State(snapshot) => {
                    self.stats.snapshots_received += 1;
                    if let Err(e) = self.buffer.append(vec![snapshot]) {
                        warn!("Dropping streamed snapshot: {}", e);
                    }
                }
                StreamEvent::Closed(StreamError::Disconnected) => {
                    return Err(StreamError::Disconnected.into());
                }
                StreamEvent::Closed(e) => {
                    if self.config.feed == FeedMode::Stream {
                        return Err(e.into());
                    }
                    warn!("Ignoring stream close in prefetch mode: {}", e);
                }
            }
        }
        Ok(())
    }

    fn status_line(&self, time: f64) -> String {
        let mut notes: Vec<i32> = self
            .buffer
            .query(time)
            .map(|s| {
                s.channels
                    .iter()
                    .flat_map(|c| c.playing.iter())
                    .filter(|n| n.state != EnvelopeState::Release)
                    .map(|n| n.note.round() as i32)
                    .collect()
            })
            .unwrap_or_default();
        notes.sort_unstable();
        notes.dedup();
        let names: Vec<String> = notes.iter().map(|&n| note_name(n)).collect();
        format!(
            "t={:6.2}s  buffered {:.2}-{:.2}s ({})  {}",
            time,
            self.buffer.earliest_time().unwrap_or(0.0),
            self.buffer.latest_time().unwrap_or(0.0),
            self.buffer.len(),
            names.join(" ")
        )
    }
}
