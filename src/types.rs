use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ControlError, ErrorKind};

/// The four operator-controlled process quantities, in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Voltage,
    Current,
    Flow,
    Temperature,
}

impl Quantity {
    /// Fixed dispatch order within one commit.
    pub const ALL: [Quantity; 4] = [
        Quantity::Voltage,
        Quantity::Current,
        Quantity::Flow,
        Quantity::Temperature,
    ];

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "mA",
            Quantity::Flow => "mL/min",
            Quantity::Temperature => "°C",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Flow => "flow",
            Quantity::Temperature => "temperature",
        };
        write!(f, "{name}")
    }
}

impl TryFrom<&str> for Quantity {
    type Error = ControlError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "voltage" | "v" => Ok(Quantity::Voltage),
            "current" | "i" => Ok(Quantity::Current),
            "flow" | "f" => Ok(Quantity::Flow),
            "temperature" | "temp" | "t" => Ok(Quantity::Temperature),
            other => Err(ControlError::Config(format!("Unknown quantity: {other}"))),
        }
    }
}

/// Inclusive validity range for a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Last-committed state of one quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantitySetting {
    pub quantity: Quantity,
    pub committed_value: f64,
    pub valid_range: ValidRange,
    pub unit: &'static str,
    /// True once a value has been applied to hardware since the last reset.
    pub has_been_set: bool,
}

impl QuantitySetting {
    pub fn new(quantity: Quantity, valid_range: ValidRange) -> Self {
        Self {
            quantity,
            committed_value: 0.0,
            valid_range,
            unit: quantity.unit(),
            has_been_set: false,
        }
    }
}

/// One field of a commit request. `None` or blank text means "no change requested".
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEdit {
    pub quantity: Quantity,
    pub raw_text: Option<String>,
}

impl CandidateEdit {
    pub fn new(quantity: Quantity, raw_text: impl Into<String>) -> Self {
        Self {
            quantity,
            raw_text: Some(raw_text.into()),
        }
    }

    pub fn unchanged(quantity: Quantity) -> Self {
        Self {
            quantity,
            raw_text: None,
        }
    }

    /// Trimmed text, or `None` when the field was left empty.
    pub fn text(&self) -> Option<&str> {
        self.raw_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty field on the first commit since standby.
    FirstCommit,
    /// Empty field for a quantity that has never been applied.
    NeverSet,
}

/// Per-quantity result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(f64),
    Refreshed(f64),
    Skipped(SkipReason),
    Rejected { text: String },
    /// The instrument write failed; the store keeps its previous value.
    Failed { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitResult {
    pub outcomes: Vec<(Quantity, Outcome)>,
    /// Auxiliary write failures that did not change a quantity's outcome.
    pub warnings: Vec<String>,
}

impl CommitResult {
    pub fn push(&mut self, quantity: Quantity, outcome: Outcome) {
        self.outcomes.push((quantity, outcome));
    }

    pub fn get(&self, quantity: Quantity) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(q, _)| *q == quantity)
            .map(|(_, outcome)| outcome)
    }
}

/// Coarse lifecycle phase of the control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Standby,
    Initializing,
    Running,
    Terminating,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Standby => "Standby",
            RunState::Initializing => "Initializing",
            RunState::Running => "Running",
            RunState::Terminating => "Terminating",
        };
        write!(f, "{name}")
    }
}

/// One poll tick worth of read-back and derived values.
///
/// `None` means the reading was unavailable this tick; it is never replaced by zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Local>,
    /// Stack voltage in V
    pub voltage: Option<f64>,
    /// Stack current in mA
    pub current: Option<f64>,
    /// Stack power in W
    pub power: Option<f64>,
    /// Water resistivity in MΩ
    pub resistivity: Option<f64>,
    /// Commanded flow rate in mL/min
    pub flow: Option<f64>,
    /// Primary heater present value in °C
    pub temperature: Option<f64>,
    pub run_state: RunState,
}

impl TelemetrySample {
    pub fn empty(run_state: RunState) -> Self {
        Self {
            timestamp: Local::now(),
            voltage: None,
            current: None,
            power: None,
            resistivity: None,
            flow: None,
            temperature: None,
            run_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_edit_text_counts_as_unchanged() {
        assert_eq!(CandidateEdit::new(Quantity::Flow, "   ").text(), None);
        assert_eq!(CandidateEdit::unchanged(Quantity::Flow).text(), None);
        assert_eq!(CandidateEdit::new(Quantity::Flow, " 12 ").text(), Some("12"));
    }

    #[test]
    fn range_rejects_nan_and_bounds() {
        let range = ValidRange::new(0.0, 100.0);
        assert!(range.contains(0.0));
        assert!(range.contains(100.0));
        assert!(!range.contains(100.01));
        assert!(!range.contains(f64::NAN));
    }

    #[test]
    fn quantity_names_parse() {
        assert_eq!(Quantity::try_from("Temp").unwrap(), Quantity::Temperature);
        assert!(Quantity::try_from("pressure").is_err());
    }
}
