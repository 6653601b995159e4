//! The serialized control loop.
//!
//! One thread owns the settings store, the run state and every instrument.
//! Timers and operator requests arrive as [`Event`]s and are handled one at a
//! time, so a poll never observes a half-applied commit. Callers talk to the
//! loop through a cloneable [`Controller`].

use crossbeam_channel::{Receiver, Sender, TrySendError, after, bounded, select, tick, unbounded};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::commit::CommitOrchestrator;
use crate::config::{AppConfig, TimingConfig};
use crate::datalog::DataLogger;
use crate::error::ControlError;
use crate::instrument::Instruments;
use crate::run_state::RunStateMachine;
use crate::settings::SettingsStore;
use crate::shutdown::{ShutdownReport, ShutdownSequencer};
use crate::telemetry::TelemetryPoller;
use crate::types::{CandidateEdit, CommitResult, Quantity, RunState, TelemetrySample};

/// Subscriber queue depth; slow subscribers miss samples instead of stalling the loop.
const SUBSCRIBER_CAPACITY: usize = 64;

pub enum Event {
    PollTick,
    LogTick,
    CommitRequested {
        edits: Vec<CandidateEdit>,
        reply: Sender<Result<CommitResult, ControlError>>,
    },
    TerminateRequested {
        reply: Sender<ShutdownReport>,
    },
    StopFlow {
        reply: Sender<ShutdownReport>,
    },
    Subscribe(Sender<TelemetrySample>),
    Shutdown,
}

pub struct ControlLoop {
    instruments: Instruments,
    store: SettingsStore,
    run_state: RunStateMachine,
    orchestrator: CommitOrchestrator,
    poller: TelemetryPoller,
    sequencer: ShutdownSequencer,
    logger: DataLogger,
    timing: TimingConfig,
    latest: Option<TelemetrySample>,
    subscribers: Vec<Sender<TelemetrySample>>,
    shared_state: Arc<RwLock<RunState>>,
    closed: bool,
}

impl ControlLoop {
    pub fn new(instruments: Instruments, logger: DataLogger, config: &AppConfig) -> Self {
        let mirror_scale = config
            .heater
            .secondary
            .as_ref()
            .map_or(1.0, |secondary| secondary.setpoint_scale);

        Self {
            instruments,
            store: SettingsStore::new(&config.limits),
            run_state: RunStateMachine::new(),
            orchestrator: CommitOrchestrator::new(mirror_scale),
            poller: TelemetryPoller::new(config.sensor.resistivity_scale),
            sequencer: ShutdownSequencer::new(),
            logger,
            timing: config.timing.clone(),
            latest: None,
            subscribers: Vec::new(),
            shared_state: Arc::new(RwLock::new(RunState::Standby)),
            closed: false,
        }
    }

    /// Start the loop on its own thread.
    pub fn spawn(self) -> (Controller, JoinHandle<()>) {
        let (requests, inbox) = unbounded();
        let controller = Controller {
            requests,
            run_state: Arc::clone(&self.shared_state),
        };
        let handle = thread::spawn(move || self.run(inbox));
        (controller, handle)
    }

    fn run(mut self, inbox: Receiver<Event>) {
        info!("Control loop started");
        let poll = tick(self.timing.poll_interval());
        let mut log_timer = after(self.log_interval());

        loop {
            let event = select! {
                recv(poll) -> _ => Event::PollTick,
                recv(log_timer) -> _ => Event::LogTick,
                // Every controller dropped
                recv(inbox) -> msg => msg.unwrap_or(Event::Shutdown),
            };

            let rearm = matches!(
                event,
                Event::LogTick | Event::CommitRequested { .. } | Event::TerminateRequested { .. }
            );
            if !self.handle(event) {
                break;
            }
            if rearm {
                log_timer = after(self.log_interval());
            }
        }

        self.close();
        info!("Control loop stopped");
    }

    /// Handle one event. Returns false when the loop should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::PollTick => self.poll(),
            Event::LogTick => {
                let sample = self
                    .latest
                    .clone()
                    .unwrap_or_else(|| TelemetrySample::empty(self.run_state.state()));
                // Failures are reported by the logger and retried next cadence
                let _ = self.logger.append(&sample, self.run_state.state());
            }
            Event::CommitRequested { edits, reply } => {
                let result = self.orchestrator.commit(
                    &edits,
                    &mut self.store,
                    &mut self.run_state,
                    &mut self.instruments,
                );
                self.publish_state();
                let _ = reply.send(result);
            }
            Event::TerminateRequested { reply } => {
                let report = self.terminate();
                let _ = reply.send(report);
            }
            Event::StopFlow { reply } => {
                info!("Stopping flow");
                let _ = reply.send(self.sequencer.stop_flow(&mut self.instruments));
            }
            Event::Subscribe(subscriber) => self.subscribers.push(subscriber),
            Event::Shutdown => return false,
        }
        true
    }

    fn poll(&mut self) {
        let flow = Some(self.store.committed(Quantity::Flow));
        let sample = self
            .poller
            .poll(&mut self.instruments, flow, self.run_state.state());

        self.subscribers.retain(|subscriber| match subscriber.try_send(sample.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.latest = Some(sample);
    }

    fn terminate(&mut self) -> ShutdownReport {
        let report = self
            .sequencer
            .terminate(&mut self.run_state, &mut self.store, &mut self.instruments);
        self.publish_state();
        report
    }

    fn log_interval(&self) -> Duration {
        self.run_state.log_interval(&self.timing)
    }

    fn publish_state(&self) {
        *self.shared_state.write() = self.run_state.state();
    }

    /// Drive everything to safe state once before the loop goes away.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Closing: driving instruments to safe state");
        let report = self.terminate();
        if !report.is_clean() {
            warn!("{} safe-state write(s) failed on close", report.failures.len());
        }
        debug!("{} records in {:?}", self.logger.records_written(), self.logger.path());
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        // Covers unwinding out of the loop thread
        self.close();
    }
}

/// Cloneable handle for talking to a running [`ControlLoop`].
#[derive(Clone)]
pub struct Controller {
    requests: Sender<Event>,
    run_state: Arc<RwLock<RunState>>,
}

impl Controller {
    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Event) -> Result<T, ControlError> {
        let (reply, answer) = bounded(1);
        self.requests
            .send(make(reply))
            .map_err(|_| ControlError::Disconnected)?;
        answer.recv().map_err(|_| ControlError::Disconnected)
    }

    pub fn commit(&self, edits: Vec<CandidateEdit>) -> Result<CommitResult, ControlError> {
        self.request(|reply| Event::CommitRequested { edits, reply })?
    }

    pub fn terminate(&self) -> Result<ShutdownReport, ControlError> {
        self.request(|reply| Event::TerminateRequested { reply })
    }

    pub fn stop_flow(&self) -> Result<ShutdownReport, ControlError> {
        self.request(|reply| Event::StopFlow { reply })
    }

    /// Receive every telemetry sample from now on.
    pub fn subscribe(&self) -> Result<Receiver<TelemetrySample>, ControlError> {
        let (sender, receiver) = bounded(SUBSCRIBER_CAPACITY);
        self.requests
            .send(Event::Subscribe(sender))
            .map_err(|_| ControlError::Disconnected)?;
        Ok(receiver)
    }

    pub fn run_state(&self) -> RunState {
        *self.run_state.read()
    }

    /// Ask the loop to drive instruments safe and stop. Does not wait.
    pub fn request_shutdown(&self) {
        let _ = self.requests.send(Event::Shutdown);
    }
}
