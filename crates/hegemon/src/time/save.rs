//! Persistent time state.
//!
//! Only the clock itself is saved: the current date, the speed setting, and
//! the paused flag. Scheduled events and in-transit messages are owned by
//! whatever scheduled them and are expected to be re-armed on load.

use super::date::{days_in_month, GameDate, TimeScale};
use super::TimeError;
use serde::{Deserialize, Serialize};

/// The serialized blob. Field order is fixed, so identical inputs always
/// produce byte-identical TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub scale: u8,
    pub paused: bool,
}

impl SaveState {
    pub fn new(date: GameDate, scale: TimeScale, paused: bool) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
            hour: date.hour,
            scale: scale.ordinal(),
            paused,
        }
    }

    /// Validates and unpacks the blob.
    pub fn unpack(&self) -> Result<(GameDate, TimeScale, bool), TimeError> {
        if !(1..=12).contains(&self.month)
            || self.day < 1
            || self.day > days_in_month(self.month)
            || self.hour >= 24
        {
            return Err(TimeError::InvalidDate {
                year: self.year,
                month: self.month,
                day: self.day,
                hour: self.hour,
            });
        }
        let scale = TimeScale::from_ordinal(self.scale).ok_or(TimeError::InvalidScale(self.scale))?;
        Ok((
            GameDate::new(self.year, self.month, self.day, self.hour),
            scale,
            self.paused,
        ))
    }

    pub fn to_toml(&self) -> String {
        toml::to_string(self).expect("time save state always serializes")
    }

    pub fn from_toml(blob: &str) -> Result<Self, TimeError> {
        toml::from_str(blob).map_err(|error| TimeError::MalformedSave(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::date::{GameDate, TimeScale};
    use super::SaveState;

    #[test]
    fn save_load_save_is_byte_identical() {
        let state = SaveState::new(GameDate::new(1066, 10, 14, 6), TimeScale::Fast, true);

        let first = state.to_toml();
        let reloaded = SaveState::from_toml(&first).unwrap();
        let second = reloaded.to_toml();

        assert_eq!(first, second);
        assert_eq!(reloaded, state);
    }

    #[test]
    fn unpack_rejects_nonsense_dates() {
        let mut state = SaveState::new(GameDate::new(1066, 10, 14, 6), TimeScale::Normal, false);
        state.month = 13;
        assert!(state.unpack().is_err());

        state.month = 2;
        state.day = 30;
        assert!(state.unpack().is_err());

        state.day = 28;
        state.scale = 9;
        assert!(state.unpack().is_err());
    }
}
