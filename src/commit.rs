//! Commit orchestration: turns a batch of candidate edits into ordered
//! instrument writes and per-quantity outcomes.

use log::{debug, info, warn};

use crate::error::ControlError;
use crate::instrument::{Command, InstrumentChannel, Instruments};
use crate::run_state::RunStateMachine;
use crate::settings::SettingsStore;
use crate::types::{CandidateEdit, CommitResult, Outcome, Quantity, SkipReason};

pub struct CommitOrchestrator {
    /// Factor applied to temperature before the raw secondary heater write
    mirror_scale: f64,
}

impl CommitOrchestrator {
    pub fn new(mirror_scale: f64) -> Self {
        Self { mirror_scale }
    }

    /// Apply one batch of edits.
    ///
    /// Quantities are processed in [`Quantity::ALL`] order. A quantity with no
    /// edit in `edits` is treated as an empty field. Every quantity gets an
    /// outcome; partial application is reported, never rolled back.
    pub fn commit(
        &self,
        edits: &[CandidateEdit],
        store: &mut SettingsStore,
        run_state: &mut RunStateMachine,
        instruments: &mut Instruments,
    ) -> Result<CommitResult, ControlError> {
        let first_commit = run_state.begin_commit()?;
        let mut result = CommitResult::default();

        for quantity in Quantity::ALL {
            let edit = edits
                .iter()
                .rev()
                .find(|e| e.quantity == quantity)
                .cloned()
                .unwrap_or_else(|| CandidateEdit::unchanged(quantity));

            let outcome = self.resolve(&edit, first_commit, store, instruments, &mut result.warnings);
            match &outcome {
                Outcome::Rejected { text } => warn!("Rejected {quantity} entry {text:?}"),
                Outcome::Failed { message, .. } => warn!("{quantity} not applied: {message}"),
                other => info!("{quantity}: {other:?}"),
            }
            result.push(quantity, outcome);
        }

        run_state.finish_commit();
        Ok(result)
    }

    fn resolve(
        &self,
        edit: &CandidateEdit,
        first_commit: bool,
        store: &mut SettingsStore,
        instruments: &mut Instruments,
        warnings: &mut Vec<String>,
    ) -> Outcome {
        let quantity = edit.quantity;

        let value = match store.validate(edit) {
            Ok(Some(value)) => value,
            Ok(None) if first_commit => return Outcome::Skipped(SkipReason::FirstCommit),
            Ok(None) if !store.has_been_set(quantity) => {
                return Outcome::Skipped(SkipReason::NeverSet);
            }
            Ok(None) => {
                let kept = store.committed(quantity);
                return match dispatch(quantity, kept, instruments) {
                    Ok(()) => Outcome::Refreshed(kept),
                    Err(e) => failed(e),
                };
            }
            Err(_) => {
                return Outcome::Rejected {
                    text: edit.text().unwrap_or_default().to_string(),
                };
            }
        };

        if let Err(e) = dispatch(quantity, value, instruments) {
            return failed(e);
        }
        store.record_applied(quantity, value);

        if quantity == Quantity::Temperature {
            if let Some(secondary) = instruments.secondary_heater.as_mut() {
                let raw = (value * self.mirror_scale).round();
                if let Err(e) = write(secondary.as_mut(), Command::SetSetpoint(raw)) {
                    warn!("Secondary heater setpoint not mirrored: {e}");
                    warnings.push(format!("secondary heater: {e}"));
                }
            }
        }

        Outcome::Applied(value)
    }
}

/// Send `value` for `quantity` to its instrument.
fn dispatch(quantity: Quantity, value: f64, instruments: &mut Instruments) -> Result<(), ControlError> {
    match quantity {
        Quantity::Voltage => write(instruments.supply.as_mut(), Command::SetVoltage(value)),
        Quantity::Current => write(instruments.supply.as_mut(), Command::SetCurrent(value)),
        Quantity::Flow => {
            write(instruments.pump.as_mut(), Command::SetFlowRate(value))?;
            // A zero rate keeps the pump idle
            if value != 0.0 {
                write(instruments.pump.as_mut(), Command::StartFlow)?;
            }
            Ok(())
        }
        Quantity::Temperature => write(instruments.heater.as_mut(), Command::SetSetpoint(value)),
    }
}

fn write(channel: &mut dyn InstrumentChannel, command: Command) -> Result<(), ControlError> {
    debug!("{} <- {:?}", channel.name(), command);
    channel.write(command)
}

fn failed(e: ControlError) -> Outcome {
    Outcome::Failed {
        kind: e.kind(),
        message: e.to_string(),
    }
}
