use std::fmt::Display;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ProtocolError;
use crate::hv::{ChannelConfig, ChannelReport, ChannelState};

/// Identity of a client on the control socket, as set by the client and reported by the router
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/*
    Handshake tokens. These travel as raw frames, never as JSON.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Ping,
    Alive,
    Connected,
    Init,
    Ready,
}

impl Token {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Ping => TOKEN_PING,
            Self::Alive => TOKEN_ALIVE,
            Self::Connected => TOKEN_CONNECTED,
            Self::Init => TOKEN_INIT,
            Self::Ready => TOKEN_READY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "heartbeat",
            Self::Alive => "alive acknowledgment",
            Self::Connected => "connection confirmation",
            Self::Init => "initialization trigger",
            Self::Ready => "bring-up completion",
        }
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        self.as_bytes() == payload
    }
}

/// Channels as an operator or a peer may write them: a list of numbers, "all" or "1,2,5"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSelection {
    List(Vec<i64>),
    Text(String),
}

impl ChannelSelection {
    pub fn all() -> Self {
        Self::Text(String::from("all"))
    }

    /// Normalize into the ordered list of requested channel numbers. Range checks happen downstream.
    pub fn resolve(&self) -> Result<Vec<i64>, ProtocolError> {
        match self {
            Self::List(channels) => Ok(channels.clone()),
            Self::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("all") {
                    return Ok(ALL_CHANNELS.map(|c| c as i64).collect());
                }
                text.split(',')
                    .map(|part| part.trim().parse::<i64>())
                    .collect::<Result<Vec<i64>, _>>()
                    .map_err(|_| ProtocolError::BadChannelSelection(text.to_string()))
            }
        }
    }
}

impl FromStr for ChannelSelection {
    type Err = ProtocolError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let selection = Self::Text(s.to_string());
        selection.resolve()?;
        Ok(selection)
    }
}

impl Display for ChannelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List(channels) => write!(f, "{:?}", channels),
            Self::Text(text) => write!(f, "{}", text),
        }
    }
}

/*
    Steady state commands. The outer tag is "type", the inner one "command".
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ClientCommand(ClientCommand),
    RcCommand(RcCommand),
    HvCommand(HvCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RcCommand {
    WriteAddress { address: u16, value: u32 },
    ReadAddress { address: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HvCommand {
    SetInitConfiguration {
        port: String,
        channel: ChannelSelection,
        #[serde(default)]
        voltage_set: Option<u16>,
        #[serde(default)]
        threshold_set: Option<u16>,
        #[serde(default)]
        limit_trip_time: Option<u16>,
        #[serde(default)]
        limit_voltage: Option<u16>,
        #[serde(default)]
        limit_current: Option<u16>,
        #[serde(default)]
        limit_temperature: Option<u16>,
        #[serde(default)]
        rate_up: Option<u16>,
        #[serde(default)]
        rate_down: Option<u16>,
    },
    SetVoltage {
        port: String,
        channel: ChannelSelection,
        voltage_set: u16,
    },
    SetPowerOn {
        port: String,
        channel: ChannelSelection,
    },
    SetPowerOff {
        port: String,
        channel: ChannelSelection,
    },
    HvCalibration {
        port: String,
        channels: ChannelSelection,
    },
    Monitor {
        port: String,
        channel: ChannelSelection,
    },
}

impl HvCommand {
    pub fn init_configuration(port: &str, channel: ChannelSelection, config: &ChannelConfig) -> Self {
        Self::SetInitConfiguration {
            port: port.to_string(),
            channel,
            voltage_set: config.voltage_set,
            threshold_set: config.threshold_set,
            limit_trip_time: config.limit_trip_time,
            limit_voltage: config.limit_voltage,
            limit_current: config.limit_current,
            limit_temperature: config.limit_temperature,
            rate_up: config.rate_up,
            rate_down: config.rate_down,
        }
    }

    pub fn port(&self) -> &str {
        match self {
            Self::SetInitConfiguration { port, .. }
            | Self::SetVoltage { port, .. }
            | Self::SetPowerOn { port, .. }
            | Self::SetPowerOff { port, .. }
            | Self::HvCalibration { port, .. }
            | Self::Monitor { port, .. } => port,
        }
    }
}

impl Command {
    /// The tag a correct reply to this command carries
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            Self::ClientCommand(ClientCommand::Exit) => ResponseKind::ClientExit,
            Self::RcCommand(RcCommand::WriteAddress { .. }) => ResponseKind::RcWrite,
            Self::RcCommand(RcCommand::ReadAddress { .. }) => ResponseKind::RcRead,
            Self::HvCommand(hv) => match hv {
                HvCommand::SetInitConfiguration { .. } => ResponseKind::HvInitConf,
                HvCommand::SetVoltage { .. } => ResponseKind::HvVoltageSet,
                HvCommand::SetPowerOn { .. } => ResponseKind::HvPowerOn,
                HvCommand::SetPowerOff { .. } => ResponseKind::HvPowerOff,
                HvCommand::HvCalibration { .. } => ResponseKind::HvCalibration,
                HvCommand::Monitor { .. } => ResponseKind::HvMonitor,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", content = "result", rename_all = "snake_case")]
pub enum Response {
    RcWrite(bool),
    RcRead(Option<u32>),
    HvInitConf(ChannelReport),
    HvVoltageSet(ChannelReport),
    HvPowerOn(bool),
    HvPowerOff(bool),
    HvCalibration(bool),
    HvMonitor(Vec<ChannelState>),
    ClientExit(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    RcWrite,
    RcRead,
    HvInitConf,
    HvVoltageSet,
    HvPowerOn,
    HvPowerOff,
    HvCalibration,
    HvMonitor,
    ClientExit,
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Self::RcWrite(_) => ResponseKind::RcWrite,
            Self::RcRead(_) => ResponseKind::RcRead,
            Self::HvInitConf(_) => ResponseKind::HvInitConf,
            Self::HvVoltageSet(_) => ResponseKind::HvVoltageSet,
            Self::HvPowerOn(_) => ResponseKind::HvPowerOn,
            Self::HvPowerOff(_) => ResponseKind::HvPowerOff,
            Self::HvCalibration(_) => ResponseKind::HvCalibration,
            Self::HvMonitor(_) => ResponseKind::HvMonitor,
            Self::ClientExit(_) => ResponseKind::ClientExit,
        }
    }
}

impl Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::RcWrite => "rc_write",
            Self::RcRead => "rc_read",
            Self::HvInitConf => "hv_init_conf",
            Self::HvVoltageSet => "hv_voltage_set",
            Self::HvPowerOn => "hv_power_on",
            Self::HvPowerOff => "hv_power_off",
            Self::HvCalibration => "hv_calibration",
            Self::HvMonitor => "hv_monitor",
            Self::ClientExit => "client_exit",
        };
        write!(f, "{}", tag)
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}
