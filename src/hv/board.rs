use std::fmt::Display;

use serde_derive::{Deserialize, Serialize};

use crate::constants::{CALIB_DISCRIMINATOR_SCALE, CALIB_LINEAR_SCALE};
use crate::error::HardwareError;
use crate::modbus::RegisterTransport;

use super::calibration::CalibrationResult;

/// HV board register map
pub mod register {
    pub const ADDRESS: u16 = 0x0000;
    pub const STATUS: u16 = 0x0006;
    pub const TEMPERATURE: u16 = 0x0007;
    pub const LIMIT_TRIP_TIME: u16 = 0x0022;
    pub const RATE_UP: u16 = 0x0023;
    pub const RATE_DOWN: u16 = 0x0024;
    pub const LIMIT_CURRENT: u16 = 0x0025;
    pub const VOLTAGE_SET: u16 = 0x0026;
    pub const LIMIT_VOLTAGE: u16 = 0x0027;
    pub const CURRENT_LSB: u16 = 0x0028;
    pub const CURRENT_MSB: u16 = 0x0029;
    pub const VOLTAGE_LSB: u16 = 0x002A;
    pub const VOLTAGE_MSB: u16 = 0x002B;
    pub const THRESHOLD: u16 = 0x002D;
    pub const ALARM: u16 = 0x002E;
    pub const LIMIT_TEMPERATURE: u16 = 0x002F;
    pub const CALIB_SLOPE_LSB: u16 = 0x0030;
    pub const CALIB_SLOPE_MSB: u16 = 0x0031;
    pub const CALIB_OFFSET_LSB: u16 = 0x0032;
    pub const CALIB_OFFSET_MSB: u16 = 0x0033;
    pub const CALIB_DISCRIMINATOR: u16 = 0x0034;
    pub const MONITOR_BLOCK_LEN: u16 = 48;

    pub const POWER_COIL: u16 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Up,
    Down,
    RampUp,
    RampDown,
    TripUp,
    TripDown,
    Trip,
    Undefined,
}

impl From<u16> for ChannelStatus {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Up,
            1 => Self::Down,
            2 => Self::RampUp,
            3 => Self::RampDown,
            4 => Self::TripUp,
            5 => Self::TripDown,
            6 => Self::Trip,
            _ => Self::Undefined,
        }
    }
}

impl ChannelStatus {
    /// UP and DOWN are the only states a channel settles in
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }
}

impl Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::RampUp => "RUP",
            Self::RampDown => "RDN",
            Self::TripUp => "TUP",
            Self::TripDown => "TDN",
            Self::Trip => "TRIP",
            Self::Undefined => "undef",
        };
        write!(f, "{}", name)
    }
}

/// Alarm bitmask of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alarm(pub u16);

impl Alarm {
    pub const OVER_VOLTAGE: u16 = 1;
    pub const UNDER_VOLTAGE: u16 = 2;
    pub const OVER_CURRENT: u16 = 4;
    pub const OVER_TEMPERATURE: u16 = 8;

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        let names: Vec<&str> = [
            (Self::OVER_VOLTAGE, "OV"),
            (Self::UNDER_VOLTAGE, "UV"),
            (Self::OVER_CURRENT, "OC"),
            (Self::OVER_TEMPERATURE, "OT"),
        ]
        .iter()
        .filter(|(bit, _)| self.0 & bit != 0)
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join(" "))
    }
}

/// Snapshot of the monitor registers of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel: u8,
    pub status: ChannelStatus,
    pub alarm: Alarm,
    pub voltage: f64,
    pub current: f64,
    pub temperature: f64,
    pub voltage_set: u16,
    pub rate_up: u16,
    pub rate_down: u16,
    pub limit_voltage: u16,
    pub limit_current: u16,
    pub limit_temperature: u16,
    pub limit_trip_time: u16,
    pub threshold: u16,
}

/// Temperature register: integer part in the high byte, thousandths in the low byte
pub fn decode_temperature(raw: u16) -> f64 {
    let integer = ((raw >> 8) & 0xFF) as f64;
    let fraction = (raw & 0xFF) as f64 / 1000.0;
    ((integer + fraction) * 100.0).round() / 100.0
}

/// Voltage and current readbacks: 32-bit value over two registers, in thousandths
fn decode_readback(lsb: u16, msb: u16) -> f64 {
    (((msb as u32) << 16) + lsb as u32) as f64 / 1000.0
}

/// Slope and offset are signed 32-bit fixed point (x10000) split over two registers
pub fn encode_linear(value: f64) -> (u16, u16) {
    let raw = (value * CALIB_LINEAR_SCALE) as i32 as u32;
    ((raw & 0xFFFF) as u16, ((raw >> 16) & 0xFFFF) as u16)
}

pub fn decode_linear(lsb: u16, msb: u16) -> f64 {
    let raw = ((msb as u32) << 16) | lsb as u32;
    raw as i32 as f64 / CALIB_LINEAR_SCALE
}

pub fn decode_discriminator(raw: u16) -> f64 {
    raw as f64 / CALIB_DISCRIMINATOR_SCALE
}

/// # HvBoard
/// Register level view of one HV channel, addressed by its bus unit id.
pub struct HvBoard<'a> {
    bus: &'a mut dyn RegisterTransport,
    unit: u8,
}

impl<'a> HvBoard<'a> {
    pub fn new(bus: &'a mut dyn RegisterTransport, unit: u8) -> Self {
        Self { bus, unit }
    }

    fn read(&mut self, address: u16) -> Result<u16, HardwareError> {
        self.bus.read_register(self.unit, address)
    }

    fn write(&mut self, address: u16, value: u16) -> Result<(), HardwareError> {
        self.bus.write_register(self.unit, address, value)
    }

    /// The bus address the board reports for itself
    pub fn address(&mut self) -> Result<u16, HardwareError> {
        self.read(register::ADDRESS)
    }

    pub fn status(&mut self) -> Result<ChannelStatus, HardwareError> {
        Ok(ChannelStatus::from(self.read(register::STATUS)?))
    }

    pub fn alarm(&mut self) -> Result<Alarm, HardwareError> {
        Ok(Alarm(self.read(register::ALARM)?))
    }

    pub fn voltage(&mut self) -> Result<f64, HardwareError> {
        let lsb = self.read(register::VOLTAGE_LSB)?;
        let msb = self.read(register::VOLTAGE_MSB)?;
        Ok(decode_readback(lsb, msb))
    }

    pub fn set_voltage(&mut self, value: u16) -> Result<(), HardwareError> {
        self.write(register::VOLTAGE_SET, value)
    }

    /// Write one of the configuration registers
    pub fn write_setting(&mut self, address: u16, value: u16) -> Result<(), HardwareError> {
        self.write(address, value)
    }

    pub fn set_rate_up(&mut self, value: u16) -> Result<(), HardwareError> {
        self.write(register::RATE_UP, value)
    }

    pub fn set_rate_down(&mut self, value: u16) -> Result<(), HardwareError> {
        self.write(register::RATE_DOWN, value)
    }

    pub fn power_on(&mut self) -> Result<(), HardwareError> {
        self.bus.write_coil(self.unit, register::POWER_COIL, true)
    }

    pub fn power_off(&mut self) -> Result<(), HardwareError> {
        self.bus.write_coil(self.unit, register::POWER_COIL, false)
    }

    pub fn write_calibration_slope(&mut self, slope: f64) -> Result<(), HardwareError> {
        let (lsb, msb) = encode_linear(slope);
        self.write(register::CALIB_SLOPE_LSB, lsb)?;
        self.write(register::CALIB_SLOPE_MSB, msb)
    }

    pub fn write_calibration_offset(&mut self, offset: f64) -> Result<(), HardwareError> {
        let (lsb, msb) = encode_linear(offset);
        self.write(register::CALIB_OFFSET_LSB, lsb)?;
        self.write(register::CALIB_OFFSET_MSB, msb)
    }

    pub fn read_calibration(&mut self) -> Result<CalibrationResult, HardwareError> {
        let slope = decode_linear(self.read(register::CALIB_SLOPE_LSB)?, self.read(register::CALIB_SLOPE_MSB)?);
        let offset = decode_linear(self.read(register::CALIB_OFFSET_LSB)?, self.read(register::CALIB_OFFSET_MSB)?);
        let discriminator = decode_discriminator(self.read(register::CALIB_DISCRIMINATOR)?);
        Ok(CalibrationResult { slope, offset, discriminator })
    }

    /// Read the whole monitor block in one transaction
    pub fn monitor(&mut self) -> Result<ChannelState, HardwareError> {
        let regs = self.bus.read_registers(self.unit, register::ADDRESS, register::MONITOR_BLOCK_LEN)?;
        if regs.len() < register::MONITOR_BLOCK_LEN as usize {
            return Err(HardwareError::BadResponse(self.unit));
        }
        let at = |address: u16| regs[address as usize];
        Ok(ChannelState {
            channel: self.unit,
            status: ChannelStatus::from(at(register::STATUS)),
            alarm: Alarm(at(register::ALARM)),
            voltage: decode_readback(at(register::VOLTAGE_LSB), at(register::VOLTAGE_MSB)),
            current: decode_readback(at(register::CURRENT_LSB), at(register::CURRENT_MSB)),
            temperature: decode_temperature(at(register::TEMPERATURE)),
            voltage_set: at(register::VOLTAGE_SET),
            rate_up: at(register::RATE_UP),
            rate_down: at(register::RATE_DOWN),
            limit_voltage: at(register::LIMIT_VOLTAGE),
            limit_current: at(register::LIMIT_CURRENT),
            limit_temperature: at(register::LIMIT_TEMPERATURE),
            limit_trip_time: at(register::LIMIT_TRIP_TIME),
            threshold: at(register::THRESHOLD),
        })
    }
}
