use crate::driver::Driver;
use crate::error::{CommandError, CommandResult};
use crate::library::Library;
use crate::protocol::*;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

/// A command handler: decodes its payload, runs against the driver, encodes
/// its result.
pub type Handler = fn(&mut Driver, Value) -> CommandResult<Value>;

/// Name → handler table consulted for every incoming call.
pub struct Registry {
    handlers: HashMap<&'static str, Handler>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Every command the driver implements.
    pub fn with_driver_commands() -> Self {
        let mut r = Self::empty();
        r.register(PARSE_CONTAINER, |d, v| encode(d.parse_container(decode(v)?)));
        r.register(CHECK_BANK, |d, v| encode(d.check_bank(decode(v)?)));
        r.register(USE_BANK, |d, v| encode(d.use_bank(decode(v)?)));
        r.register(SEQUENCE_NAMES, |d, _| encode(d.sequence_names()));
        r.register(LOAD_SEQUENCE, |d, v| encode(d.load_sequence(decode(v)?)));
        r.register(TICK_SECONDS, |d, v| encode(d.tick_seconds(decode(v)?)));
        r.register(START_STREAM, |d, v| encode(d.start_stream(decode(v)?)));
        r.register(STOP_STREAM, |d, _| encode(d.stop_stream()));
        r.register(FLUSH_AUDIO, |d, v| encode(d.flush_audio(decode(v)?)));
        r
    }

    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    /// Run the handler registered under `name`. Unknown names and panicking
    /// handlers come back as errors; the driver stays usable either way.
    pub fn dispatch(&self, driver: &mut Driver, name: &str, payload: Value) -> CommandResult<Value> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(driver, payload))) {
            Ok(result) => result,
            Err(cause) => Err(CommandError::Handler(panic_message(cause.as_ref()))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> CommandResult<T> {
    Ok(serde_json::from_value(payload)?)
}

fn encode<T: Serialize>(result: CommandResult<T>) -> CommandResult<Value> {
    serde_json::to_value(result?).map_err(|e| CommandError::Handler(e.to_string()))
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The compute side: executes calls one at a time and, while streaming,
/// ticks the renderer between calls.
pub struct Worker {
    rx: Receiver<ControlMessage>,
    out: Sender<WorkerMessage>,
    driver: Driver,
    registry: Registry,
}

impl Worker {
    pub fn new(
        library: Box<dyn Library>,
        rx: Receiver<ControlMessage>,
        out: Sender<WorkerMessage>,
    ) -> Self {
        Self {
            driver: Driver::new(library, out.clone()),
            rx,
            out,
            registry: Registry::with_driver_commands(),
        }
    }

    /// Run until shutdown or until the control side goes away.
    /// Blocks the calling thread.
    pub fn run(mut self) {
        info!("Worker running");
        let mut calls: u64 = 0;

        loop {
            let msg = match self.driver.stream_deadline() {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(m) => Some(m),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(m) => Some(m),
                    Err(_) => break,
                },
            };

            match msg {
                Some(ControlMessage::Call(req)) => {
                    calls += 1;
                    debug!("call {} {}", req.id, req.name);
                    let result = self.registry.dispatch(&mut self.driver, &req.name, req.payload);
                    if let Err(e) = &result {
                        warn!("{} (call {}) failed: {}", req.name, req.id, e);
                    }
                    let response = WorkerMessage::Call(CallResponse {
                        id: req.id,
                        outcome: result.into(),
                    });
                    if self.out.send(response).is_err() {
                        break;
                    }
                }
                Some(ControlMessage::Shutdown) => break,
                None => self.driver.stream_tick(),
            }
        }

        info!("Worker shutting down after {} calls", calls);
    }
}
