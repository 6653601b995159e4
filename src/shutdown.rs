use log::{info, warn};

use crate::error::ControlError;
use crate::instrument::{Command, InstrumentChannel, Instruments};
use crate::run_state::RunStateMachine;
use crate::settings::SettingsStore;
use crate::types::Quantity;

/// One safe-state write that did not go through.
#[derive(Debug)]
pub struct ShutdownFailure {
    pub device: String,
    pub command: Command,
    pub error: ControlError,
}

/// What the safe-state sequence managed to do.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives every instrument to zero/off.
///
/// The sequence never stops at the first failure: every write is attempted
/// and failures are collected into the report.
#[derive(Debug, Default)]
pub struct ShutdownSequencer;

impl ShutdownSequencer {
    pub fn new() -> Self {
        Self
    }

    /// Full termination: gate commits, zero the hardware, reset the store
    /// entries that were zeroed, and return to standby.
    pub fn terminate(
        &self,
        run_state: &mut RunStateMachine,
        store: &mut SettingsStore,
        instruments: &mut Instruments,
    ) -> ShutdownReport {
        info!("Terminating: driving instruments to safe state");
        run_state.begin_terminate();

        let mut report = ShutdownReport::default();

        let voltage = attempt(instruments.supply.as_mut(), Command::SetVoltage(0.0), &mut report);
        let current = attempt(instruments.supply.as_mut(), Command::SetCurrent(0.0), &mut report);
        let rate = attempt(instruments.pump.as_mut(), Command::SetFlowRate(0.0), &mut report);
        let stopped = attempt(instruments.pump.as_mut(), Command::StopFlow, &mut report);
        let heater = attempt(instruments.heater.as_mut(), Command::SetSetpoint(0.0), &mut report);
        if let Some(secondary) = instruments.secondary_heater.as_mut() {
            attempt(secondary.as_mut(), Command::SetSetpoint(0.0), &mut report);
        }

        for (quantity, zeroed) in [
            (Quantity::Voltage, voltage),
            (Quantity::Current, current),
            (Quantity::Flow, rate && stopped),
            (Quantity::Temperature, heater),
        ] {
            if zeroed {
                store.reset(quantity);
            }
        }

        run_state.finish_terminate();

        if report.is_clean() {
            info!("Safe state reached");
        } else {
            warn!(
                "Safe state incomplete: {} write(s) failed",
                report.failures.len()
            );
        }
        report
    }

    /// Stop the pump without touching settings or run state.
    pub fn stop_flow(&self, instruments: &mut Instruments) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        attempt(instruments.pump.as_mut(), Command::SetFlowRate(0.0), &mut report);
        attempt(instruments.pump.as_mut(), Command::StopFlow, &mut report);
        report
    }
}

fn attempt(channel: &mut dyn InstrumentChannel, command: Command, report: &mut ShutdownReport) -> bool {
    match channel.write(command) {
        Ok(()) => true,
        Err(error) => {
            warn!("{}: {:?} failed: {}", channel.name(), command, error);
            report.failures.push(ShutdownFailure {
                device: channel.name().to_string(),
                command,
                error,
            });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::instrument::tests::mock_instruments;
    use crate::types::RunState;

    fn running_store() -> SettingsStore {
        let mut store = SettingsStore::default();
        store.record_applied(Quantity::Voltage, 10.5);
        store.record_applied(Quantity::Current, 250.0);
        store.record_applied(Quantity::Flow, 100.0);
        store.record_applied(Quantity::Temperature, 40.0);
        store
    }

    #[test]
    fn zeroes_everything_and_returns_to_standby() {
        let (mut instruments, stand) = mock_instruments();
        let mut store = running_store();
        let mut run_state = RunStateMachine::new();
        run_state.begin_commit().unwrap();
        run_state.finish_commit();

        let report = ShutdownSequencer::new().terminate(&mut run_state, &mut store, &mut instruments);

        assert!(report.is_clean());
        assert_eq!(run_state.state(), RunState::Standby);
        assert!(run_state.commit_allowed());
        assert_eq!(
            stand.supply.lock().writes,
            vec![Command::SetVoltage(0.0), Command::SetCurrent(0.0)]
        );
        assert_eq!(
            stand.pump.lock().writes,
            vec![Command::SetFlowRate(0.0), Command::StopFlow]
        );
        assert_eq!(stand.heater.lock().writes, vec![Command::SetSetpoint(0.0)]);
        assert_eq!(stand.secondary.lock().writes, vec![Command::SetSetpoint(0.0)]);
        for quantity in Quantity::ALL {
            assert_eq!(store.committed(quantity), 0.0);
            assert!(!store.has_been_set(quantity));
        }
    }

    #[test]
    fn one_failure_does_not_stop_the_sequence() {
        let (mut instruments, stand) = mock_instruments();
        stand.supply.lock().fail_all_writes = Some(ErrorKind::DeviceTimeout);
        let mut store = running_store();
        let mut run_state = RunStateMachine::new();

        let report = ShutdownSequencer::new().terminate(&mut run_state, &mut store, &mut instruments);

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].error.kind(), ErrorKind::DeviceTimeout);
        assert_eq!(stand.pump.lock().writes.len(), 2);
        assert_eq!(stand.heater.lock().writes.len(), 1);
        // Supply was not zeroed, so the store still reflects the hardware
        assert_eq!(store.committed(Quantity::Voltage), 10.5);
        assert_eq!(store.committed(Quantity::Flow), 0.0);
        assert_eq!(run_state.state(), RunState::Standby);
    }

    #[test]
    fn terminate_twice_is_harmless() {
        let (mut instruments, stand) = mock_instruments();
        let mut store = running_store();
        let mut run_state = RunStateMachine::new();
        let sequencer = ShutdownSequencer::new();

        assert!(sequencer.terminate(&mut run_state, &mut store, &mut instruments).is_clean());
        assert!(sequencer.terminate(&mut run_state, &mut store, &mut instruments).is_clean());

        assert_eq!(stand.supply.lock().writes.len(), 4);
        assert_eq!(store.committed(Quantity::Voltage), 0.0);
        assert_eq!(run_state.state(), RunState::Standby);
        assert!(run_state.commit_allowed());
    }

    #[test]
    fn stop_flow_leaves_store_alone() {
        let (mut instruments, stand) = mock_instruments();
        let report = ShutdownSequencer::new().stop_flow(&mut instruments);
        assert!(report.is_clean());
        assert_eq!(
            stand.pump.lock().writes,
            vec![Command::SetFlowRate(0.0), Command::StopFlow]
        );
        assert!(stand.supply.lock().writes.is_empty());
    }
}
