use std::collections::BTreeMap;

use crate::config::LimitsConfig;
use crate::error::ControlError;
use crate::types::{CandidateEdit, Quantity, QuantitySetting};

/// Last-committed value and validation rule for every controlled quantity.
///
/// Only the commit orchestrator and the shutdown sequencer mutate it, and only
/// after the matching instrument write succeeded.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings: BTreeMap<Quantity, QuantitySetting>,
}

impl SettingsStore {
    pub fn new(limits: &LimitsConfig) -> Self {
        let settings = Quantity::ALL
            .into_iter()
            .map(|q| (q, QuantitySetting::new(q, limits.range(q))))
            .collect();
        Self { settings }
    }

    pub fn get(&self, quantity: Quantity) -> &QuantitySetting {
        // Every quantity is inserted at construction
        &self.settings[&quantity]
    }

    pub fn committed(&self, quantity: Quantity) -> f64 {
        self.get(quantity).committed_value
    }

    pub fn has_been_set(&self, quantity: Quantity) -> bool {
        self.get(quantity).has_been_set
    }

    /// Parse and range-check an edit.
    ///
    /// Returns `Ok(None)` when the edit requests no change.
    pub fn validate(&self, edit: &CandidateEdit) -> Result<Option<f64>, ControlError> {
        let Some(text) = edit.text() else {
            return Ok(None);
        };
        let invalid = || ControlError::InvalidInput {
            quantity: edit.quantity,
            text: text.to_string(),
        };
        let value: f64 = text.parse().map_err(|_| invalid())?;
        if !self.get(edit.quantity).valid_range.contains(value) {
            return Err(invalid());
        }
        Ok(Some(value))
    }

    /// Record a value that reached the hardware.
    pub(crate) fn record_applied(&mut self, quantity: Quantity, value: f64) {
        if let Some(setting) = self.settings.get_mut(&quantity) {
            setting.committed_value = value;
            setting.has_been_set = true;
        }
    }

    /// Back to the boot default after the instrument was zeroed.
    pub(crate) fn reset(&mut self, quantity: Quantity) {
        if let Some(setting) = self.settings.get_mut(&quantity) {
            setting.committed_value = 0.0;
            setting.has_been_set = false;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuantitySetting> {
        self.settings.values()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn starts_at_zero_and_unset() {
        let store = SettingsStore::default();
        for setting in store.iter() {
            assert_eq!(setting.committed_value, 0.0);
            assert!(!setting.has_been_set);
        }
        assert_eq!(store.get(Quantity::Current).unit, "mA");
    }

    #[test]
    fn blank_text_requests_no_change() {
        let store = SettingsStore::default();
        assert_eq!(store.validate(&CandidateEdit::new(Quantity::Voltage, "  ")).unwrap(), None);
        assert_eq!(store.validate(&CandidateEdit::unchanged(Quantity::Flow)).unwrap(), None);
    }

    #[test]
    fn accepts_values_inside_range() {
        let store = SettingsStore::default();
        let edit = CandidateEdit::new(Quantity::Voltage, " 61.425 ");
        assert_eq!(store.validate(&edit).unwrap(), Some(61.425));
        let edit = CandidateEdit::new(Quantity::Flow, "0");
        assert_eq!(store.validate(&edit).unwrap(), Some(0.0));
    }

    #[test]
    fn rejects_garbage_and_out_of_range() {
        let store = SettingsStore::default();
        for text in ["abc", "61.5", "-1", "NaN", "inf", "1e5"] {
            let err = store
                .validate(&CandidateEdit::new(Quantity::Voltage, text))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{text}");
        }
    }

    #[test]
    fn record_and_reset() {
        let mut store = SettingsStore::default();
        store.record_applied(Quantity::Temperature, 40.0);
        assert_eq!(store.committed(Quantity::Temperature), 40.0);
        assert!(store.has_been_set(Quantity::Temperature));

        store.reset(Quantity::Temperature);
        assert_eq!(store.committed(Quantity::Temperature), 0.0);
        assert!(!store.has_been_set(Quantity::Temperature));
    }
}
