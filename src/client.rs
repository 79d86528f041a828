//! Control-side handle on the worker thread.
//!
//! Calls are correlated through a pending table keyed by call id. A
//! dispatcher thread routes replies to their callers, pushes stream events
//! into a bounded ring (dropping the oldest when full) and sweeps expired
//! deadlines.

use crate::error::{CommandError, CommandResult, StreamError};
use crate::library::Library;
use crate::protocol::*;
use crate::types::Snapshot;
use crate::worker::Worker;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the dispatcher checks for expired calls when idle.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to every call that doesn't name its own.
    pub call_timeout: Duration,
    /// Stream events held before the oldest is dropped.
    pub stream_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            stream_capacity: 4096,
        }
    }
}

struct PendingEntry {
    name: String,
    deadline: Instant,
    reply: Sender<CallOutcome>,
}

#[derive(Clone, Default)]
struct PendingTable(Arc<Mutex<HashMap<CallId, PendingEntry>>>);

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingEntry>> {
        // A panic while holding the lock can't leave the map half-updated
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve `id` exactly once. Returns false if it was already resolved.
    fn resolve(&self, id: CallId, outcome: CallOutcome) -> bool {
        match self.lock().remove(&id) {
            Some(entry) => {
                let _ = entry.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    fn sweep(&self, now: Instant) {
        let mut table = self.lock();
        let expired: Vec<CallId> = table
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = table.remove(&id) {
                warn!("Call {} ({}) timed out", id, entry.name);
                let _ = entry.reply.send(CallOutcome::Error(CommandError::Timeout(id)));
            }
        }
    }

    fn fail_all(&self, error: CommandError) {
        for (_, entry) in self.lock().drain() {
            let _ = entry.reply.send(CallOutcome::Error(error.clone()));
        }
    }
}

/// A call that has been sent and not yet consumed.
pub struct PendingCall<R> {
    id: CallId,
    rx: Receiver<CallOutcome>,
    table: PendingTable,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> PendingCall<R> {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Block until the call resolves (reply, error, timeout or cancel).
    pub fn wait(self) -> CommandResult<R> {
        match self.rx.recv() {
            Ok(outcome) => decode(outcome),
            Err(_) => Err(CommandError::Disconnected),
        }
    }

    /// Non-blocking check. `Some` is returned once; drop the call after it.
    pub fn poll(&self) -> Option<CommandResult<R>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(decode(outcome)),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Some(Err(CommandError::Disconnected))
            }
        }
    }

    /// Resolve the call with `Cancelled` if it is still pending. A reply
    /// arriving later is dropped.
    pub fn cancel(&self) {
        if self.table.resolve(self.id, CallOutcome::Error(CommandError::Cancelled(self.id))) {
            debug!("Call {} cancelled", self.id);
        }
    }
}

fn decode<R: DeserializeOwned>(outcome: CallOutcome) -> CommandResult<R> {
    let result: CommandResult<Value> = outcome.into();
    Ok(serde_json::from_value(result?)?)
}

/// Owns the worker thread and the dispatcher thread. Dropping the client
/// shuts both down.
pub struct WorkerClient {
    ctrl: Sender<ControlMessage>,
    table: PendingTable,
    next_id: AtomicU64,
    call_timeout: Duration,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl WorkerClient {
    /// Start a worker on its own thread. Returns the client and the
    /// receiving end of the stream ring.
    pub fn spawn(
        library: Box<dyn Library>,
        config: ClientConfig,
    ) -> io::Result<(Self, Receiver<StreamEvent>)> {
        let (ctrl_tx, ctrl_rx) = unbounded::<ControlMessage>();
        let (out_tx, out_rx) = unbounded::<WorkerMessage>();

        let worker = thread::Builder::new()
            .name("worker".into())
            .spawn(move || Worker::new(library, ctrl_rx, out_tx).run())?;

        let (mut client, stream) = Self::attach(ctrl_tx, out_rx, config)?;
        client.worker = Some(worker);
        Ok((client, stream))
    }

    /// Wire a client onto an existing pair of channels.
    pub fn attach(
        ctrl: Sender<ControlMessage>,
        events: Receiver<WorkerMessage>,
        config: ClientConfig,
    ) -> io::Result<(Self, Receiver<StreamEvent>)> {
        let table = PendingTable::default();
        let dropped = Arc::new(AtomicU64::new(0));
        let (stream_tx, stream_rx) = bounded(config.stream_capacity.max(1));

        let dispatcher = {
            let ring = StreamRing {
                tx: stream_tx,
                rx: stream_rx.clone(),
                dropped: dropped.clone(),
            };
            let table = table.clone();
            thread::Builder::new()
                .name("dispatch".into())
                .spawn(move || dispatch(events, table, ring))?
        };

        let client = Self {
            ctrl,
            table,
            next_id: AtomicU64::new(1),
            call_timeout: config.call_timeout,
            dropped,
            worker: None,
            dispatcher: Some(dispatcher),
        };
        Ok((client, stream_rx))
    }

    pub fn call<P: Serialize, R: DeserializeOwned>(&self, name: &str, payload: &P) -> PendingCall<R> {
        self.call_with_timeout(name, payload, self.call_timeout)
    }

    pub fn call_with_timeout<P: Serialize, R: DeserializeOwned>(
        &self,
        name: &str,
        payload: &P,
        timeout: Duration,
    ) -> PendingCall<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = bounded(1);
        let call = PendingCall {
            id,
            rx,
            table: self.table.clone(),
            _result: PhantomData,
        };

        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                let _ = reply.send(CallOutcome::Error(e.into()));
                return call;
            }
        };

        self.table.lock().insert(
            id,
            PendingEntry {
                name: name.to_string(),
                deadline: Instant::now() + timeout,
                reply,
            },
        );
        let request = ControlMessage::Call(CallRequest {
            id,
            name: name.to_string(),
            payload,
        });
        if self.ctrl.send(request).is_err() {
            self.table
                .resolve(id, CallOutcome::Error(CommandError::Disconnected));
        }
        call
    }

    /// Calls sent and not yet resolved.
    pub fn pending_calls(&self) -> usize {
        self.table.lock().len()
    }

    /// Stream events discarded because the ring was full.
    pub fn dropped_stream_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ─── Typed commands ─────────────────────────────────────────────────

    pub fn parse_container(&self, path: &str) -> PendingCall<Vec<String>> {
        self.call(PARSE_CONTAINER, &PathArgs { path: path.into() })
    }

    pub fn check_bank(&self, path: &str) -> PendingCall<usize> {
        self.call(CHECK_BANK, &PathArgs { path: path.into() })
    }

    pub fn use_bank(&self, path: &str) -> PendingCall<()> {
        self.call(USE_BANK, &PathArgs { path: path.into() })
    }

    pub fn sequence_names(&self) -> PendingCall<Vec<String>> {
        self.call(SEQUENCE_NAMES, &json!({}))
    }

    pub fn load_sequence(&self, name: &str) -> PendingCall<RendererId> {
        self.call(LOAD_SEQUENCE, &LoadSequenceArgs { name: name.into() })
    }

    pub fn tick_seconds(&self, renderer: RendererId, seconds: f64) -> PendingCall<Vec<Snapshot>> {
        self.call(TICK_SECONDS, &TickArgs { renderer, seconds })
    }

    pub fn start_stream(&self, renderer: RendererId) -> PendingCall<()> {
        self.call(START_STREAM, &RendererArgs { renderer })
    }

    pub fn stop_stream(&self) -> PendingCall<()> {
        self.call(STOP_STREAM, &json!({}))
    }

    pub fn flush_audio(&self, renderer: RendererId) -> PendingCall<()> {
        self.call(FLUSH_AUDIO, &RendererArgs { renderer })
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        let _ = self.ctrl.send(ControlMessage::Shutdown);
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
        if let Some(h) = self.dispatcher.take() {
            let _ = h.join();
        }
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Bounded stream queue that makes room by discarding its oldest event.
struct StreamRing {
    tx: Sender<StreamEvent>,
    rx: Receiver<StreamEvent>,
    dropped: Arc<AtomicU64>,
}

impl StreamRing {
    fn push(&self, mut event: StreamEvent) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    event = back;
                    if self.rx.try_recv().is_ok() {
                        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if n == 1 || n % 1000 == 0 {
                            warn!("Stream ring full: {} events dropped", n);
                        }
                    }
                }
                // We hold a receiver ourselves
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn dispatch(events: Receiver<WorkerMessage>, table: PendingTable, ring: StreamRing) {
    loop {
        match events.recv_timeout(SWEEP_INTERVAL) {
            Ok(WorkerMessage::Call(response)) => {
                let id = response.id;
                if !table.resolve(id, response.outcome) {
                    debug!("Dropping late reply for call {}", id);
                }
            }
            Ok(WorkerMessage::Pcm(buffer)) => ring.push(StreamEvent::Pcm(buffer)),
            Ok(WorkerMessage::State(snapshot)) => ring.push(StreamEvent::State(snapshot)),
            Ok(WorkerMessage::Closed(error)) => {
                warn!("Worker closed the stream: {}", error);
                ring.push(StreamEvent::Closed(error));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("Worker disconnected");
                table.fail_all(CommandError::Disconnected);
                ring.push(StreamEvent::Closed(StreamError::Disconnected));
                return;
            }
        }
        table.sweep(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client whose "worker" is the test itself.
    fn harness(
        config: ClientConfig,
    ) -> (WorkerClient, Receiver<StreamEvent>, Receiver<ControlMessage>, Sender<WorkerMessage>) {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (client, stream) = WorkerClient::attach(ctrl_tx, out_rx, config).unwrap();
        (client, stream, ctrl_rx, out_tx)
    }

    fn next_call(rx: &Receiver<ControlMessage>) -> CallRequest {
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            ControlMessage::Call(req) => req,
            other => panic!("expected a call, got {:?}", other),
        }
    }

    fn reply(tx: &Sender<WorkerMessage>, id: CallId, outcome: CallOutcome) {
        tx.send(WorkerMessage::Call(CallResponse { id, outcome })).unwrap();
    }

    #[test]
    fn test_replies_are_correlated_by_id() {
        let (client, _stream, ctrl, out) = harness(ClientConfig::default());
        let a = client.check_bank("a.sdat");
        let b = client.check_bank("b.sdat");
        let ra = next_call(&ctrl);
        let rb = next_call(&ctrl);
        assert_eq!(ra.name, CHECK_BANK);
        assert_eq!(ra.payload, json!({"path": "a.sdat"}));
        assert_ne!(ra.id, rb.id);

        // Answer out of order
        reply(&out, rb.id, CallOutcome::Data(json!(2)));
        reply(&out, ra.id, CallOutcome::Data(json!(7)));
        assert_eq!(a.wait(), Ok(7));
        assert_eq!(b.wait(), Ok(2));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn test_error_reply() {
        let (client, _stream, ctrl, out) = harness(ClientConfig::default());
        let call = client.sequence_names();
        let req = next_call(&ctrl);
        let err = CommandError::Precondition("no sequence bank loaded".into());
        reply(&out, req.id, CallOutcome::Error(err.clone()));
        assert_eq!(call.wait(), Err(err));
    }

    #[test]
    fn test_timeout_and_late_reply() {
        let config = ClientConfig {
            call_timeout: Duration::from_millis(30),
            ..ClientConfig::default()
        };
        let (client, _stream, ctrl, out) = harness(config);
        let call = client.load_sequence("SEQ_DEMO");
        let req = next_call(&ctrl);
        let id = call.id();
        assert_eq!(call.wait(), Err(CommandError::Timeout(id)));

        // The late reply is dropped, the client keeps working
        reply(&out, req.id, CallOutcome::Data(json!(1)));
        let next: PendingCall<RendererId> = client.call_with_timeout(
            LOAD_SEQUENCE,
            &LoadSequenceArgs { name: "SEQ_DEMO".into() },
            Duration::from_secs(5),
        );
        let req = next_call(&ctrl);
        reply(&out, req.id, CallOutcome::Data(json!(2)));
        assert_eq!(next.wait(), Ok(2));
    }

    #[test]
    fn test_cancel() {
        let (client, _stream, ctrl, out) = harness(ClientConfig::default());
        let call = client.tick_seconds(1, 0.5);
        let req = next_call(&ctrl);
        assert!(call.poll().is_none());
        call.cancel();
        reply(&out, req.id, CallOutcome::Data(json!([])));
        assert_eq!(call.wait(), Err(CommandError::Cancelled(req.id)));
    }

    #[test]
    fn test_disconnect_fails_pending_and_closes_stream() {
        let (client, stream, ctrl, out) = harness(ClientConfig::default());
        let call = client.use_bank("sound/demo.sdat");
        next_call(&ctrl);
        drop(out);
        assert_eq!(call.wait(), Err(CommandError::Disconnected));
        assert_eq!(
            stream.recv_timeout(Duration::from_secs(1)).unwrap(),
            StreamEvent::Closed(StreamError::Disconnected)
        );
    }

    #[test]
    fn test_stream_ring_drops_oldest() {
        let config = ClientConfig {
            stream_capacity: 4,
            ..ClientConfig::default()
        };
        let (client, stream, ctrl, out) = harness(config);
        for i in 0..10 {
            out.send(WorkerMessage::State(Snapshot::empty(i as f64))).unwrap();
        }
        // Flush the dispatcher through a call round trip
        let call = client.stop_stream();
        let req = next_call(&ctrl);
        reply(&out, req.id, CallOutcome::Data(Value::Null));
        call.wait().unwrap();

        let times: Vec<f64> = stream
            .try_iter()
            .map(|e| match e {
                StreamEvent::State(s) => s.time,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(times, vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(client.dropped_stream_events(), 6);
    }
}
