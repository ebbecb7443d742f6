pub mod board;
pub mod calibration;
pub mod controller;

use serde_derive::{Deserialize, Serialize};

use crate::constants::{MAX_CHANNEL, MIN_CHANNEL};
use crate::error::HvError;

pub use board::{Alarm, ChannelState, ChannelStatus};
pub use calibration::CalibrationResult;
pub use controller::{HvController, PowerTarget};

/// A validated HV channel id, also the bus unit id of its board
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for ChannelId {
    type Error = HvError;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (MIN_CHANNEL..=MAX_CHANNEL).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(HvError::InvalidChannel(value))
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # ChannelConfig
/// Settings to apply to a channel. A field left as None keeps the value already in the board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub voltage_set: Option<u16>,
    pub threshold_set: Option<u16>,
    pub limit_trip_time: Option<u16>,
    pub limit_voltage: Option<u16>,
    pub limit_current: Option<u16>,
    pub limit_temperature: Option<u16>,
    pub rate_up: Option<u16>,
    pub rate_down: Option<u16>,
}

impl ChannelConfig {
    pub fn voltage(voltage_set: u16) -> Self {
        Self { voltage_set: Some(voltage_set), ..Default::default() }
    }

    /// The operating point used on the bench: voltage plus the usual limits and ramp rates
    pub fn standard(voltage_set: u16) -> Self {
        Self {
            voltage_set: Some(voltage_set),
            threshold_set: Some(100),
            limit_trip_time: Some(2),
            limit_voltage: Some(100),
            limit_current: Some(5),
            limit_temperature: Some(50),
            rate_up: Some(25),
            rate_down: Some(25),
        }
    }

    /// Register writes in the order they are applied to the board
    pub fn writes(&self) -> Vec<(u16, u16)> {
        use board::register;
        [
            (register::VOLTAGE_SET, self.voltage_set),
            (register::THRESHOLD, self.threshold_set),
            (register::LIMIT_TRIP_TIME, self.limit_trip_time),
            (register::LIMIT_VOLTAGE, self.limit_voltage),
            (register::LIMIT_CURRENT, self.limit_current),
            (register::LIMIT_TEMPERATURE, self.limit_temperature),
            (register::RATE_UP, self.rate_up),
            (register::RATE_DOWN, self.rate_down),
        ]
        .into_iter()
        .filter_map(|(address, value)| value.map(|v| (address, v)))
        .collect()
    }
}

/// Outcome of a batch operation: channels that succeeded and channels that were rejected or failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub valid: Vec<i64>,
    pub not_valid: Vec<i64>,
}

/// Split requested channel numbers into in-range ids and rejected raw values, keeping the request order
pub fn partition_channels(channels: &[i64]) -> (Vec<ChannelId>, Vec<i64>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for channel in channels {
        match ChannelId::try_from(*channel) {
            Ok(id) => valid.push(id),
            Err(_) => rejected.push(*channel),
        }
    }
    (valid, rejected)
}
