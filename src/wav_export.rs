use crate::client::WorkerClient;
use crate::error::ExportError;
use crate::protocol::StreamEvent;
use crate::types::SAMPLE_RATE;
use crossbeam_channel::Receiver;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Seconds simulated per `tick_seconds` call while exporting.
const EXPORT_CHUNK_SECONDS: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub samples: u64,
    pub sample_rate: u32,
    pub snapshots: usize,
}

impl ExportSummary {
    pub fn duration_secs(&self) -> f64 {
        self.samples as f64 / self.sample_rate as f64
    }
}

/// Renders a sequence through the worker and writes its pcm stream as a
/// mono 32-bit float WAV file.
pub struct WavExporter<'a> {
    client: &'a WorkerClient,
    stream: &'a Receiver<StreamEvent>,
}

impl<'a> WavExporter<'a> {
    /// `stream` must be the stream receiver that belongs to `client`.
    pub fn new(client: &'a WorkerClient, stream: &'a Receiver<StreamEvent>) -> Self {
        Self { client, stream }
    }

    /// Load `sequence` (from the active bank) and write its first `seconds`
    /// of audio to `path`.
    pub fn export(&self, sequence: &str, seconds: f64, path: &Path) -> Result<ExportSummary, ExportError> {
        let renderer = self.client.load_sequence(sequence).wait()?;
        // Anything queued before the load belongs to an earlier renderer
        let stale = self.stream.try_iter().count();
        if stale > 0 {
            debug!("Discarded {} stream events before export", stale);
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(path, spec)?;
        let target = (seconds.max(0.0) * SAMPLE_RATE as f64).round() as u64;
        let mut summary = ExportSummary {
            samples: 0,
            sample_rate: SAMPLE_RATE,
            snapshots: 0,
        };

        info!("Exporting {} ({:.1}s) → {:?}", sequence, seconds, path);
        let mut simulated = 0.0;
        while simulated < seconds {
            let chunk = EXPORT_CHUNK_SECONDS.min(seconds - simulated);
            summary.snapshots += self.client.tick_seconds(renderer, chunk).wait()?.len();
            simulated += chunk;
            self.drain(&mut writer, target, &mut summary)?;
        }
        self.client.flush_audio(renderer).wait()?;
        self.drain(&mut writer, target, &mut summary)?;
        writer.finalize()?;

        if summary.samples < target {
            warn!(
                "Export ended {} samples short of {:.1}s",
                target - summary.samples,
                seconds
            );
        }
        info!(
            "Wrote {:.2}s ({} samples, {} snapshots) to {:?}",
            summary.duration_secs(),
            summary.samples,
            summary.snapshots,
            path
        );
        Ok(summary)
    }

    /// Write every queued pcm buffer, stopping at `target` samples.
    fn drain(
        &self,
        writer: &mut WavWriter<BufWriter<File>>,
        target: u64,
        summary: &mut ExportSummary,
    ) -> Result<(), ExportError> {
        for event in self.stream.try_iter() {
            match event {
                StreamEvent::Pcm(buffer) => {
                    if buffer.sample_rate != SAMPLE_RATE {
                        warn!("Pcm buffer at {} Hz in a {} Hz export", buffer.sample_rate, SAMPLE_RATE);
                    }
                    let room = target.saturating_sub(summary.samples) as usize;
                    for &s in buffer.samples.iter().take(room) {
                        writer.write_sample(s)?;
                    }
                    summary.samples += buffer.samples.len().min(room) as u64;
                }
                StreamEvent::State(_) => {}
                StreamEvent::Closed(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
