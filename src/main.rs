use seqscope::client::{ClientConfig, WorkerClient};
use seqscope::compositor::{Compositor, OutOfRangeMode, ViewSettings};
use seqscope::console_display::{AsciiCanvas, ConsoleDisplay};
use seqscope::coordinator::{Coordinator, CoordinatorConfig, FeedMode};
use seqscope::json_library::{demo_container_bytes, JsonLibrary};
use seqscope::keyboard::PianoKeyboard;
use seqscope::types::*;
use seqscope::wav_export::WavExporter;

use clap::Parser;
use log::{error, info};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "seqscope")]
#[command(about = "Scrolling piano-roll visualizer for sequenced music")]
struct Cli {
    /// Container file to open (JSON container image)
    container: Option<PathBuf>,

    /// Use the built-in demo container instead of a file
    #[arg(long)]
    demo: bool,

    /// List sequence banks and their sequences, then exit
    #[arg(long)]
    list: bool,

    /// Sequence bank inside the container (default: first found)
    #[arg(long)]
    bank: Option<String>,

    /// Sequence name, or #<id> (default: first in the bank)
    #[arg(long)]
    sequence: Option<String>,

    /// Render audio to this WAV file instead of visualizing
    #[arg(long)]
    export: Option<PathBuf>,

    /// Seconds of audio to export
    #[arg(long, default_value_t = 30.0)]
    seconds: f64,

    /// Notes shown, as LOW-HIGH MIDI numbers
    #[arg(long, default_value = "0-119")]
    note_range: NoteRange,

    /// Seconds of upcoming notes in the top timeline
    #[arg(long, default_value_t = 1.5)]
    top_seconds: f64,

    /// Seconds of past notes in the bottom timeline (negative). Implies --no-same-speed
    #[arg(long, allow_hyphen_values = true)]
    bottom_seconds: Option<f64>,

    /// Don't match the bottom timeline's scroll speed to the top one
    #[arg(long)]
    no_same_speed: bool,

    /// Piano height as a fraction of the display
    #[arg(long, default_value_t = 0.1)]
    piano_height: f64,

    /// Piano position (top edge) as a fraction of the display
    #[arg(long, default_value_t = 0.7)]
    piano_position: f64,

    /// Spread notes evenly instead of aligning them with piano keys
    #[arg(long)]
    no_align: bool,

    /// Where out-of-range notes are shown: keys, timeline, both or off
    #[arg(long, default_value = "keys")]
    out_of_range: OutOfRangeMode,

    /// Hide a channel everywhere (repeatable)
    #[arg(long)]
    hide_channel: Vec<usize>,

    /// Display width in character cells
    #[arg(long, default_value_t = 120)]
    cols: usize,

    /// Display height in character cells, including the status line
    #[arg(long, default_value_t = 40)]
    rows: usize,

    /// Display refresh rate (Hz)
    #[arg(long, default_value_t = 30)]
    display_hz: u32,

    /// Seconds of state simulated ahead of playback
    #[arg(long, default_value_t = 2.0)]
    lookahead: f64,

    /// Worker call timeout (ms)
    #[arg(long, default_value_t = 5000)]
    call_timeout_ms: u64,

    /// Stop after this many seconds of playback
    #[arg(long)]
    duration: Option<f64>,

    /// Feed the display from the worker's real-time stream instead of prefetching
    #[arg(long)]
    stream: bool,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let container = match (&cli.container, cli.demo) {
        (Some(path), _) => path.clone(),
        (None, true) => {
            let path = std::env::temp_dir().join("seqscope-demo.json");
            fs::write(&path, demo_container_bytes())?;
            path
        }
        (None, false) => return Err("no container given (pass a path or --demo)".into()),
    };

    info!("═══════════════════════════════════════════════");
    info!("  SEQSCOPE v{}", env!("CARGO_PKG_VERSION"));
    info!("  Container: {}", container.display());
    info!("  Audio: {}", if cfg!(feature = "audio") { "cpal" } else { "off (wall clock)" });
    info!("═══════════════════════════════════════════════");

    let config = ClientConfig {
        call_timeout: Duration::from_millis(cli.call_timeout_ms),
        ..ClientConfig::default()
    };
    let (client, stream) = WorkerClient::spawn(Box::new(JsonLibrary), config)?;

    let banks = client.parse_container(&container.to_string_lossy()).wait()?;
    if banks.is_empty() {
        return Err("container holds no sequence banks".into());
    }

    // ─── Listing ────────────────────────────────────────────────────
    if cli.list {
        for bank in &banks {
            let count = client.check_bank(bank).wait()?;
            println!("{} ({} sequences)", bank, count);
            client.use_bank(bank).wait()?;
            for name in client.sequence_names().wait()? {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    // ─── Selection ──────────────────────────────────────────────────
    let bank = cli.bank.clone().unwrap_or_else(|| banks[0].clone());
    client.use_bank(&bank).wait()?;
    let names = client.sequence_names().wait()?;
    let sequence = match &cli.sequence {
        Some(s) => s.clone(),
        None => names.first().cloned().ok_or("bank holds no sequences")?,
    };
    info!("Playing {} from {}", sequence, bank);

    // ─── Export ─────────────────────────────────────────────────────
    if let Some(path) = &cli.export {
        WavExporter::new(&client, &stream).export(&sequence, cli.seconds, path)?;
        return Ok(());
    }

    // ─── Visualization ──────────────────────────────────────────────
    let renderer = client.load_sequence(&sequence).wait()?;

    let mut view = ViewSettings {
        note_range: cli.note_range,
        piano_height: cli.piano_height,
        piano_position: cli.piano_position,
        top_time: cli.top_seconds,
        bottom_same_speed: !cli.no_same_speed && cli.bottom_seconds.is_none(),
        align_notes: !cli.no_align,
        out_of_range: cli.out_of_range,
        ..ViewSettings::default()
    };
    if let Some(b) = cli.bottom_seconds {
        view.bottom_time = b;
    }
    for &ch in &cli.hide_channel {
        view.top_channels.hide(ch);
        view.piano_channels.hide(ch);
        view.bottom_channels.hide(ch);
    }

    let mut compositor = Compositor::new(
        view,
        PianoKeyboard::new(cli.note_range),
        AsciiCanvas::new(0, 0),
        AsciiCanvas::new(0, 0),
        AsciiCanvas::new(0, 0),
    );
    // Last row is the status line
    compositor.resize(cli.cols as f64, cli.rows.saturating_sub(1) as f64);

    let coordinator_config = CoordinatorConfig {
        display_hz: cli.display_hz,
        lookahead: cli.lookahead,
        duration: cli.duration,
        feed: if cli.stream { FeedMode::Stream } else { FeedMode::Prefetch },
        ..CoordinatorConfig::default()
    };
    let mut coordinator = Coordinator::new(
        &client,
        stream,
        &sequence,
        renderer,
        coordinator_config,
        compositor,
        ConsoleDisplay::stdout(),
    );

    #[cfg(feature = "audio")]
    {
        let (_output, sender, clock) = seqscope::audio_output::AudioOutput::start(SAMPLE_RATE)?;
        coordinator = coordinator.with_audio(sender);
        coordinator.start()?;
        coordinator.run(&clock)?;
    }
    #[cfg(not(feature = "audio"))]
    {
        coordinator.start()?;
        let clock = WallClock::new();
        coordinator.run(&clock)?;
    }

    Ok(())
}
