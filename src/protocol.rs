//! Messages crossing the worker boundary.
//!
//! Both directions are plain enums moved over crossbeam channels. Their serde
//! form is the `{"type": ..., "data": ...}` envelope, used for logging and
//! kept stable by tests.

use crate::error::{CommandError, StreamError};
use crate::types::{PcmBuffer, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one in-flight call, unique per client.
pub type CallId = u64;

/// Generation of the renderer slot on the compute side.
pub type RendererId = u64;

// ─── Command names ──────────────────────────────────────────────────────────

pub const PARSE_CONTAINER: &str = "parse_container";
pub const CHECK_BANK: &str = "check_bank";
pub const USE_BANK: &str = "use_bank";
pub const SEQUENCE_NAMES: &str = "sequence_names";
pub const LOAD_SEQUENCE: &str = "load_sequence";
pub const TICK_SECONDS: &str = "tick_seconds";
pub const START_STREAM: &str = "start_stream";
pub const STOP_STREAM: &str = "stop_stream";
pub const FLUSH_AUDIO: &str = "flush_audio";

// ─── Envelopes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: CallId,
    pub name: String,
    pub payload: Value,
}

/// Outcome of a call, serialized as `{"data": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Data(Value),
    Error(CommandError),
}

impl From<Result<Value, CommandError>> for CallOutcome {
    fn from(r: Result<Value, CommandError>) -> Self {
        match r {
            Ok(v) => CallOutcome::Data(v),
            Err(e) => CallOutcome::Error(e),
        }
    }
}

impl From<CallOutcome> for Result<Value, CommandError> {
    fn from(o: CallOutcome) -> Self {
        match o {
            CallOutcome::Data(v) => Ok(v),
            CallOutcome::Error(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: CallId,
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

/// Control → compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ControlMessage {
    Call(CallRequest),
    Shutdown,
}

/// Compute → control. `Call` answers one request; the rest form the
/// one-way stream and are never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkerMessage {
    Call(CallResponse),
    Pcm(PcmBuffer),
    State(Snapshot),
    /// Terminal: nothing more follows on the stream until it is restarted.
    Closed(StreamError),
}

/// Stream half of `WorkerMessage`, as delivered to the control side.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Pcm(PcmBuffer),
    State(Snapshot),
    Closed(StreamError),
}

// ─── Payloads ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSequenceArgs {
    /// Symbolic name, or `#<id>`.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickArgs {
    pub renderer: RendererId,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererArgs {
    pub renderer: RendererId,
}
