use crate::error::{CommandError, CommandResult, LibraryError, StreamError};
use crate::library::{
    find_files, Container, Library, RendererConfig, SequenceBank, SequenceRef, SequenceRenderer,
    BANK_SUFFIX,
};
use crate::protocol::*;
use crate::types::*;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::fs;
use std::time::{Duration, Instant};

/// How far streaming may fall behind real time before it gives up catching
/// up and resynchronizes.
const MAX_STREAM_LAG: Duration = Duration::from_millis(250);

/// A one-slot owned resource. Replacing the occupant retires the previous
/// one and bumps the generation, so callers holding an old generation can be
/// told their instance is gone.
pub struct Slot<T> {
    label: &'static str,
    item: Option<T>,
    generation: u64,
}

impl<T> Slot<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            item: None,
            generation: 0,
        }
    }

    /// Install `item`, retiring the current occupant. Returns the new
    /// generation.
    pub fn replace(&mut self, item: T) -> u64 {
        if self.item.take().is_some() {
            info!("Retiring {} #{}", self.label, self.generation);
        }
        self.generation += 1;
        self.item = Some(item);
        debug!("Installed {} #{}", self.label, self.generation);
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.item.is_none()
    }

    pub fn require(&self) -> CommandResult<&T> {
        self.item
            .as_ref()
            .ok_or_else(|| CommandError::Precondition(format!("no {} loaded", self.label)))
    }

    /// Borrow the occupant only if it is still generation `generation`.
    pub fn require_generation(&mut self, generation: u64) -> CommandResult<&mut T> {
        let active = self.generation;
        let label = self.label;
        let item = self
            .item
            .as_mut()
            .ok_or_else(|| CommandError::Precondition(format!("no {} loaded", label)))?;
        if generation != active {
            return Err(CommandError::StaleRenderer {
                requested: generation,
                active,
            });
        }
        Ok(item)
    }
}

/// Most ticks one `tick_seconds` call may run (about 340 s at the Nitro
/// tick rate).
pub const MAX_TICKS_PER_CALL: usize = 1 << 16;

/// Ticks needed to cover `seconds` of playback, or `None` past
/// `MAX_TICKS_PER_CALL`.
pub fn tick_count(sample_rate: u32, samples_per_tick: f64, seconds: f64) -> Option<usize> {
    let ticks = (sample_rate as f64 * seconds / samples_per_tick).ceil();
    if ticks.is_finite() && ticks >= 0.0 && ticks <= MAX_TICKS_PER_CALL as f64 {
        Some(ticks as usize)
    } else {
        None
    }
}

/// Package the renderer's current voice state.
pub fn capture(renderer: &dyn SequenceRenderer) -> Snapshot {
    Snapshot {
        time: renderer.time(),
        channels: renderer.channel_states(),
    }
}

/// Compute-side owner of the loaded container, bank and renderer.
///
/// Every command either fully succeeds or leaves all three slots exactly as
/// they were: replacements are built first and installed last.
pub struct Driver {
    library: Box<dyn Library>,
    out: Sender<WorkerMessage>,
    container: Slot<Box<dyn Container>>,
    bank: Slot<Box<dyn SequenceBank>>,
    renderer: Slot<Box<dyn SequenceRenderer>>,
    /// Next real-time tick while streaming.
    stream_next: Option<Instant>,
}

impl Driver {
    pub fn new(library: Box<dyn Library>, out: Sender<WorkerMessage>) -> Self {
        Self {
            library,
            out,
            container: Slot::new("container"),
            bank: Slot::new("sequence bank"),
            renderer: Slot::new("renderer"),
            stream_next: None,
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────

    /// Open a container file and list every sequence bank in it.
    pub fn parse_container(&mut self, args: PathArgs) -> CommandResult<Vec<String>> {
        let bytes = fs::read(&args.path).map_err(LibraryError::from)?;
        let container = self.library.open_container(bytes)?;
        let banks = find_files(&*container, BANK_SUFFIX)?;
        info!("Container {}: {} sequence banks", args.path, banks.len());
        self.container.replace(container);
        Ok(banks)
    }

    /// Parse a bank without activating it; returns its sequence count.
    pub fn check_bank(&mut self, args: PathArgs) -> CommandResult<usize> {
        let bank = self.open_bank(&args.path)?;
        Ok(bank.sequences().len())
    }

    pub fn use_bank(&mut self, args: PathArgs) -> CommandResult<()> {
        let bank = self.open_bank(&args.path)?;
        info!("Using bank {} ({} sequences)", args.path, bank.sequences().len());
        self.bank.replace(bank);
        Ok(())
    }

    pub fn sequence_names(&mut self) -> CommandResult<Vec<String>> {
        let bank = self.bank.require()?;
        Ok(bank.sequences().iter().map(|s| s.label()).collect())
    }

    pub fn load_sequence(&mut self, args: LoadSequenceArgs) -> CommandResult<RendererId> {
        let bank = self.bank.require()?;
        let out = self.out.clone();
        let config = RendererConfig {
            sample_rate: SAMPLE_RATE,
            buffer_length: PCM_BUFFER_LENGTH,
            sink: Box::new(move |buffer| {
                let _ = out.send(WorkerMessage::Pcm(buffer));
            }),
        };
        let renderer = bank.renderer(&SequenceRef::parse(&args.name), config)?;
        if self.stream_next.take().is_some() {
            info!("Stopping stream of retired renderer #{}", self.renderer.generation());
        }
        let id = self.renderer.replace(renderer);
        info!("Loaded sequence {} as renderer #{}", args.name, id);
        Ok(id)
    }

    /// Advance the renderer by `seconds` worth of ticks, one snapshot each.
    pub fn tick_seconds(&mut self, args: TickArgs) -> CommandResult<Vec<Snapshot>> {
        if !(args.seconds.is_finite() && args.seconds >= 0.0) {
            return Err(CommandError::InvalidPayload(format!(
                "seconds must be finite and non-negative, got {}",
                args.seconds
            )));
        }
        let renderer = self.renderer.require_generation(args.renderer)?;
        let n = tick_count(renderer.sample_rate(), renderer.samples_per_tick(), args.seconds)
            .ok_or_else(|| {
                CommandError::InvalidPayload(format!(
                    "{}s exceeds {} ticks per call",
                    args.seconds, MAX_TICKS_PER_CALL
                ))
            })?;
        let mut snapshots = Vec::new();
        for _ in 0..n {
            renderer.tick()?;
            snapshots.push(capture(&**renderer));
        }
        debug!(
            "Renderer #{}: {} ticks, now at {:.3}s",
            args.renderer,
            n,
            renderer.time()
        );
        Ok(snapshots)
    }

    pub fn start_stream(&mut self, args: RendererArgs) -> CommandResult<()> {
        self.renderer.require_generation(args.renderer)?;
        info!("Streaming renderer #{}", args.renderer);
        self.stream_next = Some(Instant::now());
        Ok(())
    }

    pub fn stop_stream(&mut self) -> CommandResult<()> {
        if self.stream_next.take().is_some() {
            info!("Stream stopped");
        }
        Ok(())
    }

    pub fn flush_audio(&mut self, args: RendererArgs) -> CommandResult<()> {
        self.renderer.require_generation(args.renderer)?.flush();
        Ok(())
    }

    fn open_bank(&self, path: &str) -> CommandResult<Box<dyn SequenceBank>> {
        let container = self.container.require()?;
        let bytes = container.read_file(path)?;
        Ok(self.library.open_bank(bytes)?)
    }

    // ─── Streaming ──────────────────────────────────────────────────────

    /// When the next streamed tick is due, if streaming.
    pub fn stream_deadline(&self) -> Option<Instant> {
        self.stream_next
    }

    /// Perform one real-time tick and push its snapshot. A failing tick
    /// closes the stream with a terminal event.
    pub fn stream_tick(&mut self) {
        let Some(due) = self.stream_next else {
            return;
        };
        let renderer = match self.renderer.require_generation(self.renderer.generation()) {
            Ok(r) => r,
            Err(e) => {
                self.close_stream(StreamError::Renderer(e.to_string()));
                return;
            }
        };
        if let Err(e) = renderer.tick() {
            warn!("Stream tick failed: {}", e);
            self.close_stream(StreamError::Renderer(e.to_string()));
            return;
        }
        let period = Duration::from_secs_f64(
            renderer.samples_per_tick() / renderer.sample_rate() as f64,
        );
        let snapshot = capture(&**renderer);
        if self.out.send(WorkerMessage::State(snapshot)).is_err() {
            self.stream_next = None;
            return;
        }

        let mut next = due + period;
        let now = Instant::now();
        if now > next + MAX_STREAM_LAG {
            warn!("Stream fell {:?} behind, resynchronizing", now - next);
            next = now;
        }
        self.stream_next = Some(next);
    }

    fn close_stream(&mut self, error: StreamError) {
        self.stream_next = None;
        let _ = self.out.send(WorkerMessage::Closed(error));
    }
}
