//! Control-side history of synth snapshots.

use crate::client::{PendingCall, WorkerClient};
use crate::error::{BufferError, CommandError, CommandResult};
use crate::protocol::RendererId;
use crate::types::{Snapshot, WINDOW_MARGIN};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

/// Time-ordered queue of immutable snapshot batches.
///
/// Each batch is the result of one `tick_seconds` call or one streamed
/// snapshot. Batches are never mutated once appended, so a draw can read the
/// buffer in the same frame as the latest append.
#[derive(Default)]
pub struct StateBuffer {
    batches: VecDeque<Arc<[Snapshot]>>,
    len: usize,
}

impl StateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one batch. Empty batches are ignored. The batch must be
    /// strictly increasing and start after everything already buffered.
    pub fn append(&mut self, batch: Vec<Snapshot>) -> Result<(), BufferError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        if let Some(i) = batch.windows(2).position(|w| w[1].time <= w[0].time) {
            return Err(BufferError::Unordered(i + 1));
        }
        if let Some(latest) = self.latest_time() {
            if first.time <= latest {
                return Err(BufferError::OutOfOrder {
                    start: first.time,
                    latest,
                });
            }
        }

        for snapshot in &batch {
            if let Some(ch) = duplicate_pitch(snapshot) {
                warn!(
                    "Snapshot at {:.4}s holds the same pitch twice on channel {}",
                    snapshot.time, ch
                );
                break;
            }
        }

        self.len += batch.len();
        self.batches.push_back(Arc::from(batch));
        Ok(())
    }

    /// The snapshot with the greatest time at or before `time`.
    pub fn query(&self, time: f64) -> Option<&Snapshot> {
        self.last_where(|s| s.time <= time)
    }

    /// The snapshot with the greatest time strictly before `time`.
    pub fn before(&self, time: f64) -> Option<&Snapshot> {
        self.last_where(|s| s.time < time)
    }

    /// Every snapshot within `[start - margin, end + margin]`, in time order.
    pub fn range(&self, start: f64, end: f64) -> impl Iterator<Item = &Snapshot> + '_ {
        let lo = start - WINDOW_MARGIN;
        let hi = end + WINDOW_MARGIN;
        self.batches
            .iter()
            .skip_while(move |b| b.last().map_or(true, |s| s.time < lo))
            .flat_map(|b| b.iter())
            .skip_while(move |s| s.time < lo)
            .take_while(move |s| s.time <= hi)
    }

    /// Drop whole batches that lie entirely before `horizon`, keeping the
    /// batch that holds the last snapshot at or before it. Returns the number
    /// of snapshots dropped.
    pub fn evict_before(&mut self, horizon: f64) -> usize {
        let mut dropped = 0;
        while self.batches.len() > 1 && self.batches[1][0].time <= horizon {
            if let Some(batch) = self.batches.pop_front() {
                dropped += batch.len();
            }
        }
        self.len -= dropped;
        if dropped > 0 {
            debug!("Evicted {} snapshots before {:.3}s", dropped, horizon);
        }
        dropped
    }

    pub fn latest_time(&self) -> Option<f64> {
        self.batches.back().and_then(|b| b.last()).map(|s| s.time)
    }

    pub fn earliest_time(&self) -> Option<f64> {
        self.batches.front().and_then(|b| b.first()).map(|s| s.time)
    }

    /// Buffered snapshots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.batches.clear();
        self.len = 0;
    }

    fn last_where(&self, pred: impl Fn(&Snapshot) -> bool) -> Option<&Snapshot> {
        let batch = self.batches.iter().rev().find(|b| b.first().map_or(false, &pred))?;
        let n = batch.partition_point(&pred);
        batch.get(n.checked_sub(1)?)
    }
}

/// Index of the first channel holding two voices at the same pitch.
fn duplicate_pitch(snapshot: &Snapshot) -> Option<usize> {
    snapshot.channels.iter().position(|ch| {
        ch.playing.iter().enumerate().any(|(i, a)| {
            ch.playing[i + 1..].iter().any(|b| b.note == a.note)
        })
    })
}

// ─── Prefetch ───────────────────────────────────────────────────────────────

/// Smallest chunk the prefetcher shrinks to after timeouts.
const MIN_CHUNK: f64 = 0.01;

/// The one call a `Prefetcher` may have outstanding.
enum InFlight {
    Tick(PendingCall<Vec<Snapshot>>),
    Reload(PendingCall<RendererId>),
}

enum Finished {
    Tick(CommandResult<Vec<Snapshot>>),
    Reload(CommandResult<RendererId>),
}

impl InFlight {
    fn poll(&self) -> Option<Finished> {
        match self {
            InFlight::Tick(call) => call.poll().map(Finished::Tick),
            InFlight::Reload(call) => call.poll().map(Finished::Reload),
        }
    }

    fn wait(self) -> Finished {
        match self {
            InFlight::Tick(call) => Finished::Tick(call.wait()),
            InFlight::Reload(call) => Finished::Reload(call.wait()),
        }
    }
}

/// Keeps a `StateBuffer` filled ahead of the playback clock by issuing
/// `tick_seconds` calls, never more than one at a time.
///
/// An advance call that fails after the worker may have ticked (timeout,
/// renderer failure) leaves the renderer ahead of the buffer. The prefetcher
/// then reloads the sequence and replays it up to the buffered time,
/// discarding what is already buffered, so every instant is appended exactly
/// once and without gaps.
pub struct Prefetcher {
    sequence: String,
    renderer: RendererId,
    lookahead: f64,
    chunk: f64,
    in_flight: Option<InFlight>,
    /// Renderer must be replaced before the next advance.
    desynced: bool,
    /// While replaying: the buffered time the new renderer must pass.
    replay_to: Option<f64>,
    failures: u64,
    resyncs: u64,
}

impl Prefetcher {
    /// `sequence`: name `renderer` was loaded from, used to reload it.
    /// `lookahead`: seconds past the playback time the buffer must reach.
    /// `chunk`: seconds simulated per call.
    pub fn new(sequence: impl Into<String>, renderer: RendererId, lookahead: f64, chunk: f64) -> Self {
        Self {
            sequence: sequence.into(),
            renderer,
            lookahead,
            chunk: chunk.max(MIN_CHUNK),
            in_flight: None,
            desynced: false,
            replay_to: None,
            failures: 0,
            resyncs: 0,
        }
    }

    pub fn renderer(&self) -> RendererId {
        self.renderer
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Times the renderer was reloaded to recover from a failed advance.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Seconds currently simulated per call.
    pub fn chunk(&self) -> f64 {
        self.chunk
    }

    /// True while a reload or replay is pending.
    pub fn resyncing(&self) -> bool {
        self.desynced || self.replay_to.is_some()
    }

    /// Fill the buffer up to the lookahead before playback starts. Blocks.
    /// Fails with the first call error; the prefetcher stays consistent and
    /// `poll` recovers from it.
    pub fn prime(&mut self, client: &WorkerClient, buffer: &mut StateBuffer) -> CommandResult<()> {
        if let Some(call) = self.in_flight.take() {
            self.finish(call.wait(), buffer);
        }
        while self.resyncing() || buffer.latest_time().unwrap_or(0.0) < self.lookahead {
            let Some(call) = self.issue(client, buffer, 0.0) else {
                break;
            };
            match call.wait() {
                Finished::Tick(Ok(batch)) if batch.is_empty() => break,
                Finished::Tick(Err(e)) => {
                    self.finish(Finished::Tick(Err(e.clone())), buffer);
                    return Err(e);
                }
                Finished::Reload(Err(e)) => {
                    self.finish(Finished::Reload(Err(e.clone())), buffer);
                    return Err(e);
                }
                done => {
                    self.finish(done, buffer);
                }
            }
        }
        info!(
            "Primed {} snapshots up to {:.3}s",
            buffer.len(),
            buffer.latest_time().unwrap_or(0.0)
        );
        Ok(())
    }

    /// Collect a finished call, then issue the next one if the buffer trails
    /// `playback_time + lookahead` or a resync is pending. Never blocks.
    /// Returns true when snapshots were appended.
    pub fn poll(&mut self, client: &WorkerClient, buffer: &mut StateBuffer, playback_time: f64) -> bool {
        let mut appended = false;
        if let Some(call) = &self.in_flight {
            match call.poll() {
                None => return false,
                Some(done) => {
                    self.in_flight = None;
                    appended = self.finish(done, buffer);
                }
            }
        }
        self.in_flight = self.issue(client, buffer, playback_time);
        appended
    }

    /// The next call to make, if any.
    fn issue(&mut self, client: &WorkerClient, buffer: &StateBuffer, playback_time: f64) -> Option<InFlight> {
        if self.desynced {
            return Some(InFlight::Reload(client.load_sequence(&self.sequence)));
        }
        let covered = buffer.latest_time().unwrap_or(f64::NEG_INFINITY);
        if self.replay_to.is_some() || covered < playback_time + self.lookahead {
            return Some(InFlight::Tick(client.tick_seconds(self.renderer, self.chunk)));
        }
        None
    }

    fn finish(&mut self, done: Finished, buffer: &mut StateBuffer) -> bool {
        match done {
            Finished::Tick(Ok(batch)) => self.accept(batch, buffer),
            Finished::Tick(Err(e)) => {
                self.failures += 1;
                warn!("Prefetch for renderer #{} failed: {}", self.renderer, e);
                match e {
                    // The worker may have ticked (part of) the call
                    CommandError::Timeout(_) => {
                        self.chunk = (self.chunk / 2.0).max(MIN_CHUNK);
                        self.desynced = true;
                    }
                    CommandError::Library(_) | CommandError::Handler(_) | CommandError::Cancelled(_) => {
                        self.desynced = true;
                    }
                    _ => {}
                }
                false
            }
            Finished::Reload(Ok(renderer)) => {
                self.resyncs += 1;
                self.desynced = false;
                self.replay_to = buffer.latest_time();
                info!(
                    "Reloaded {} as renderer #{}, replaying to {:.3}s",
                    self.sequence,
                    renderer,
                    self.replay_to.unwrap_or(0.0)
                );
                self.renderer = renderer;
                false
            }
            Finished::Reload(Err(e)) => {
                self.failures += 1;
                warn!("Reloading {} failed: {}", self.sequence, e);
                false
            }
        }
    }

    fn accept(&mut self, mut batch: Vec<Snapshot>, buffer: &mut StateBuffer) -> bool {
        if let Some(target) = self.replay_to {
            batch.retain(|s| s.time > target);
            if batch.is_empty() {
                return false;
            }
            debug!("Replay of renderer #{} passed {:.3}s", self.renderer, target);
            self.replay_to = None;
        }
        let n = batch.len();
        match buffer.append(batch) {
            Ok(()) => {
                debug!("Prefetched {} snapshots", n);
                n > 0
            }
            Err(e) => {
                warn!("Prefetched batch rejected: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelState, EnvelopeState, NoteEvent, CHANNEL_COUNT};

    fn snaps(times: &[f64]) -> Vec<Snapshot> {
        times.iter().map(|&t| Snapshot::empty(t)).collect()
    }

    fn buffer(batches: &[&[f64]]) -> StateBuffer {
        let mut b = StateBuffer::new();
        for batch in batches {
            b.append(snaps(batch)).unwrap();
        }
        b
    }

    #[test]
    fn test_query_greatest_at_or_before() {
        let b = buffer(&[&[0.0, 0.5], &[1.0, 1.5]]);
        assert_eq!(b.query(2.0).unwrap().time, 1.5);
        assert_eq!(b.query(1.0).unwrap().time, 1.0);
        assert_eq!(b.query(0.99).unwrap().time, 0.5);
        assert_eq!(b.query(0.0).unwrap().time, 0.0);
        assert!(b.query(-1.0).is_none());
        assert!(StateBuffer::new().query(5.0).is_none());
    }

    #[test]
    fn test_query_is_monotone() {
        let b = buffer(&[&[0.0, 0.3, 0.6], &[0.9], &[1.2, 1.5, 1.8]]);
        let mut last = f64::NEG_INFINITY;
        for i in 0..250 {
            let t = -0.2 + i as f64 * 0.01;
            if let Some(s) = b.query(t) {
                assert!(s.time <= t, "query({}) returned {}", t, s.time);
                assert!(s.time >= last, "query({}) went backwards", t);
                last = s.time;
            }
        }
    }

    #[test]
    fn test_before_is_strict() {
        let b = buffer(&[&[0.0, 0.5, 1.0]]);
        assert_eq!(b.before(1.0).unwrap().time, 0.5);
        assert_eq!(b.before(1.01).unwrap().time, 1.0);
        assert!(b.before(0.0).is_none());
    }

    #[test]
    fn test_range_includes_margin() {
        let b = buffer(&[&[0.0, 0.85, 0.95], &[1.0, 1.5, 2.05, 2.15]]);
        let times: Vec<f64> = b.range(1.0, 2.0).map(|s| s.time).collect();
        assert_eq!(times, vec![0.95, 1.0, 1.5, 2.05]);
        assert_eq!(b.range(10.0, 11.0).count(), 0);
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let mut b = buffer(&[&[0.0, 0.5]]);
        assert_eq!(
            b.append(snaps(&[0.5, 0.7])),
            Err(BufferError::OutOfOrder { start: 0.5, latest: 0.5 })
        );
        assert_eq!(b.append(snaps(&[0.6, 0.6])), Err(BufferError::Unordered(1)));
        assert_eq!(b.len(), 2);
        b.append(Vec::new()).unwrap();
        assert_eq!(b.batch_count(), 1);
        b.append(snaps(&[0.6])).unwrap();
        assert_eq!(b.latest_time(), Some(0.6));
    }

    #[test]
    fn test_duplicate_pitch_is_accepted() {
        let mut s = Snapshot::empty(0.0);
        let voice = NoteEvent { note: 60.0, volume: 1.0, state: EnvelopeState::Sustain };
        s.channels[3] = ChannelState { playing: vec![voice, voice] };
        assert_eq!(duplicate_pitch(&s), Some(3));
        let mut b = StateBuffer::new();
        b.append(vec![s]).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.query(0.0).unwrap().channels.len(), CHANNEL_COUNT);
    }

    #[test]
    fn test_eviction_keeps_answers_inside_horizon() {
        let mut b = buffer(&[&[0.0, 0.25], &[0.5, 0.75], &[1.0, 1.25], &[1.5, 1.75]]);
        let times = [1.1, 1.2, 1.3, 1.6, 2.0];
        let before: Vec<f64> = times.iter().map(|&t| b.query(t).unwrap().time).collect();

        let dropped = b.evict_before(1.1);
        assert_eq!(dropped, 4);
        assert_eq!(b.earliest_time(), Some(1.0));
        let after: Vec<f64> = times.iter().map(|&t| b.query(t).unwrap().time).collect();
        assert_eq!(before, after);
        assert_eq!(b.before(1.1).unwrap().time, 1.0);

        // Never empties the buffer
        b.evict_before(100.0);
        assert_eq!(b.batch_count(), 1);
        assert_eq!(b.latest_time(), Some(1.75));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut b = buffer(&[&[0.0, 1.0]]);
        b.clear();
        assert!(b.is_empty());
        assert!(b.latest_time().is_none());
        b.append(snaps(&[0.0])).unwrap();
    }
}
