//! Per-device worker threads.
//!
//! Each physical channel is moved onto its own thread and reached through a
//! [`ChannelHandle`], which implements [`InstrumentChannel`] itself. A device
//! that stops answering then costs the caller at most the configured timeout
//! instead of blocking the control loop indefinitely.

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, warn};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{Command, InstrumentChannel, Query};
use crate::error::ControlError;

enum Request {
    Probe,
    Write(Command),
    Read(Query),
}

struct Envelope {
    request: Request,
    reply: Sender<Result<f64, ControlError>>,
}

/// Handle to a channel running on its own thread.
pub struct ChannelHandle {
    name: String,
    requests: Option<Sender<Envelope>>,
    timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn spawn(mut channel: Box<dyn InstrumentChannel>, timeout: Duration) -> Self {
        let name = channel.name().to_string();
        // Rendezvous: a request is only accepted once the worker is idle
        let (requests, inbox) = bounded::<Envelope>(0);

        let worker = thread::Builder::new()
            .name(format!("{name} worker"))
            .spawn(move || {
                debug!("{} worker started", channel.name());
                for envelope in inbox {
                    let result = match envelope.request {
                        Request::Probe => channel.probe().map(|_| 0.0),
                        Request::Write(command) => channel.write(command).map(|_| 0.0),
                        Request::Read(query) => channel.read(query),
                    };
                    // The caller may have given up already
                    let _ = envelope.reply.send(result);
                }
                debug!("{} worker stopped", channel.name());
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start {name} worker: {e}");
                None
            }
        };

        Self {
            name,
            requests: Some(requests),
            timeout,
            worker,
        }
    }

    fn call(&self, request: Request, operation: String) -> Result<f64, ControlError> {
        let requests = self.requests.as_ref().ok_or(ControlError::Disconnected)?;
        let (reply, answer) = bounded(1);
        let deadline = Instant::now() + self.timeout;

        match requests.send_deadline(Envelope { request, reply }, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("{} still busy, {operation} not sent", self.name);
                return Err(ControlError::timeout(&self.name, operation));
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(ControlError::unavailable(&self.name, "worker stopped"));
            }
        }

        match answer.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ControlError::timeout(&self.name, operation)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ControlError::unavailable(&self.name, "worker stopped"))
            }
        }
    }
}

impl InstrumentChannel for ChannelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        self.call(Request::Probe, "probe".into()).map(|_| ())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        self.call(Request::Write(command), format!("{command:?}"))
            .map(|_| ())
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        self.call(Request::Read(query), format!("{query:?}"))
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        // Closing the request side ends the worker loop
        self.requests.take();

        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + self.timeout;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!("{} worker did not stop in time; detaching", self.name);
            }
        }
    }
}
