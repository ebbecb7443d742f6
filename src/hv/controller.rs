use std::sync::Arc;

use bit_set::BitSet;

use crate::clock::SharedClock;
use crate::constants::*;
use crate::error::{HardwareError, HvError};
use crate::modbus::RegisterTransport;

use super::board::{ChannelState, ChannelStatus, HvBoard};
use super::calibration::{linear_regression, trimmed_mean, CalibrationResult};
use super::{partition_channels, ChannelConfig, ChannelId, ChannelReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTarget {
    On,
    Off,
}

impl PowerTarget {
    fn status(&self) -> ChannelStatus {
        match self {
            Self::On => ChannelStatus::Up,
            Self::Off => ChannelStatus::Down,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/*
    A power sequence tracks the channels that were commanded and have not yet been observed
    in the target state. Each poll round removes the channels that settled, raised an alarm
    or stopped answering. The sequence is done when nothing is pending.
 */
#[derive(Debug)]
struct PowerSequence {
    target: PowerTarget,
    pending: BitSet,
    failed: BitSet,
}

impl PowerSequence {
    fn new(target: PowerTarget) -> Self {
        Self { target, pending: BitSet::new(), failed: BitSet::new() }
    }

    fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    fn succeeded(&self) -> bool {
        self.pending.is_empty() && self.failed.is_empty()
    }

    fn fail(&mut self, channel: usize) {
        self.pending.remove(channel);
        self.failed.insert(channel);
    }

    fn poll(&mut self, controller: &mut HvController) {
        let channels: Vec<usize> = self.pending.iter().collect();
        for channel in channels {
            let unit = channel as u8;
            let mut board = match controller.open(unit) {
                Ok(board) => board,
                Err(e) => {
                    log::warn!("Channel {} cannot be opened anymore: {}", unit, e);
                    self.fail(channel);
                    continue;
                }
            };

            match board.alarm() {
                Ok(alarm) if !alarm.is_none() => {
                    log::warn!("Alarm powering {} channel {}: {}", self.target.verb(), unit, alarm);
                    self.fail(channel);
                    continue;
                }
                Ok(_) => (),
                Err(e) => {
                    log::error!("Could not read the alarm of channel {}: {}", unit, e);
                    self.fail(channel);
                    continue;
                }
            }

            match board.status() {
                Ok(status) if status == self.target.status() => {
                    log::info!("Channel {} is now {}", unit, status);
                    self.pending.remove(channel);
                }
                Ok(status) => log::debug!("Channel {} is {}", unit, status),
                Err(e) => {
                    log::error!("Could not read the status of channel {}: {}", unit, e);
                    self.fail(channel);
                }
            }
        }
    }
}

/// # HvController
/// Drives the HV boards sharing one serial bus. Every operation takes raw requested channel numbers,
/// rejects those outside of the valid range before touching the bus, and reports per channel so that
/// one bad board never spoils a batch.
pub struct HvController {
    bus: Box<dyn RegisterTransport>,
    clock: SharedClock,
}

impl HvController {
    pub fn new(bus: Box<dyn RegisterTransport>, clock: SharedClock) -> Self {
        Self { bus, clock }
    }

    fn board(&mut self, channel: u8) -> HvBoard<'_> {
        HvBoard::new(self.bus.as_mut(), channel)
    }

    fn probe(&mut self, channel: u8) -> Result<u16, HardwareError> {
        let mut last_error = HardwareError::NoResponse(channel);
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.board(channel).address() {
                Ok(address) => return Ok(address),
                Err(e) => {
                    log::debug!("Probe {}/{} of channel {} failed: {}", attempt, PROBE_ATTEMPTS, channel, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Open a channel: the board must answer on its address register
    pub fn open(&mut self, channel: u8) -> Result<HvBoard<'_>, HvError> {
        match self.probe(channel) {
            Ok(_) => Ok(self.board(channel)),
            Err(source) => Err(HvError::OpenFailed { channel, source }),
        }
    }

    /// Open a channel and check that the board behind it reports the same address
    pub fn select(&mut self, channel: u8) -> Result<HvBoard<'_>, HvError> {
        let found = self
            .probe(channel)
            .map_err(|source| HvError::OpenFailed { channel, source })?;
        if found != channel as u16 {
            return Err(HvError::AddressMismatch { channel, found });
        }
        Ok(self.board(channel))
    }

    fn wait_terminal(&mut self, channel: u8) -> Result<ChannelStatus, HvError> {
        loop {
            let status = self.board(channel).status()?;
            if status.is_terminal() {
                return Ok(status);
            }
            log::debug!("Channel {} is {}, waiting", channel, status);
            self.clock.sleep(STATUS_POLL_INTERVAL);
        }
    }

    /// Apply the present settings of config to one channel and wait until it settles in UP or DOWN.
    /// Blocks for as long as the hardware ramps.
    pub fn configure(&mut self, channel: ChannelId, config: &ChannelConfig) -> Result<ChannelStatus, HvError> {
        let unit = channel.get();
        let clock = Arc::clone(&self.clock);
        let mut board = self.select(unit)?;
        clock.sleep(SETTLE_DELAY);
        for (address, value) in config.writes() {
            board.write_setting(address, value)?;
            clock.sleep(SETTLE_DELAY);
        }
        self.wait_terminal(unit)
    }

    pub fn configure_channels(&mut self, channels: &[i64], config: &ChannelConfig) -> ChannelReport {
        let (ids, rejected) = partition_channels(channels);
        let mut report = ChannelReport { valid: Vec::new(), not_valid: Vec::new() };
        for channel in rejected {
            log::warn!("Channel {} is out of range. Ignored.", channel);
            report.not_valid.push(channel);
        }
        for id in ids {
            log::info!("Configuring channel {}", id);
            match self.configure(id, config) {
                Ok(status) => {
                    log::info!("Channel {} configured, status {}", id, status);
                    report.valid.push(id.get() as i64);
                }
                Err(e) => {
                    log::error!("Configuration of channel {} failed: {}", id, e);
                    report.not_valid.push(id.get() as i64);
                }
            }
        }
        report
    }

    pub fn set_voltage(&mut self, channels: &[i64], voltage: u16) -> ChannelReport {
        self.configure_channels(channels, &ChannelConfig::voltage(voltage))
    }

    /// Power the requested channels on or off and wait for every commanded channel to settle.
    /// Returns true only if all of them reached the target state without an alarm, false if none
    /// could be commanded at all.
    pub fn power(&mut self, channels: &[i64], target: PowerTarget) -> bool {
        let (ids, rejected) = partition_channels(channels);
        for channel in rejected {
            log::warn!("Channel {} is out of range. Ignored.", channel);
        }

        let mut sequence = PowerSequence::new(target);
        for id in ids {
            let unit = id.get();
            log::info!("Powering {} channel {}", target.verb(), unit);
            let commanded = self.open(unit).and_then(|mut board| {
                let result = match target {
                    PowerTarget::On => board.power_on(),
                    PowerTarget::Off => board.power_off(),
                };
                result.map_err(HvError::from)
            });
            match commanded {
                Ok(()) => {
                    sequence.pending.insert(unit as usize);
                }
                Err(e) => log::warn!("Impossible to power {} channel {}: {}", target.verb(), unit, e),
            }
        }

        if sequence.is_settled() {
            log::warn!("No channels were successfully opened");
            return false;
        }
        log::info!("Started powering {} {} channels. Checking status...", target.verb(), sequence.pending.len());

        loop {
            sequence.poll(self);
            if sequence.is_settled() {
                break;
            }
            self.clock.sleep(STATUS_POLL_INTERVAL);
        }

        if sequence.succeeded() {
            log::info!("All channels reached {}", target.status());
        } else {
            let failed: Vec<usize> = sequence.failed.iter().collect();
            log::warn!("Some channels never reached {}: {:?}", target.status(), failed);
        }
        sequence.succeeded()
    }

    pub fn power_on(&mut self, channels: &[i64]) -> bool {
        self.power(channels, PowerTarget::On)
    }

    pub fn power_off(&mut self, channels: &[i64]) -> bool {
        self.power(channels, PowerTarget::Off)
    }

    fn wait_for_status(&mut self, channel: u8, target: ChannelStatus) -> Result<(), HvError> {
        while self.board(channel).status()? != target {
            self.clock.sleep(CALIBRATION_POLL_INTERVAL);
        }
        Ok(())
    }

    fn sample_voltage(&mut self, channel: u8) -> Result<f64, HvError> {
        let mut samples = Vec::with_capacity(CALIBRATION_SAMPLES);
        for _ in 0..CALIBRATION_SAMPLES {
            samples.push(self.board(channel).voltage()?);
            self.clock.sleep(CALIBRATION_SAMPLE_INTERVAL);
        }
        log::debug!("Channel {} samples: {:?}", channel, samples);
        trimmed_mean(&samples).ok_or(HvError::SingularRegression)
    }

    /// Sweep one channel through the calibration targets, fit measured against expected voltage and
    /// store the fit in the board. Leaves the channel off at the idle voltage. Takes several minutes.
    pub fn calibrate(&mut self, channel: ChannelId) -> Result<CalibrationResult, HvError> {
        let unit = channel.get();
        let clock = Arc::clone(&self.clock);

        let mut board = self.select(unit)?;
        log::warn!("Calibrating channel {}: erasing current calibration values", unit);
        board.write_calibration_slope(1.0)?;
        board.write_calibration_offset(0.0)?;

        log::info!("Set fast ramp rates ({} V/s)", CALIBRATION_RAMP_RATE);
        board.set_rate_up(CALIBRATION_RAMP_RATE)?;
        board.set_rate_down(CALIBRATION_RAMP_RATE)?;

        log::info!("Start calibration with status=DOWN Vset={}V", CALIBRATION_IDLE_VOLTAGE);
        board.set_voltage(CALIBRATION_IDLE_VOLTAGE)?;
        board.power_off()?;
        let floor = CALIBRATION_TARGETS[0] as f64;
        while self.board(unit).voltage()? > floor {
            clock.sleep(CALIBRATION_POLL_INTERVAL);
        }

        self.board(unit).power_on()?;
        let mut points: Vec<(f64, f64)> = Vec::with_capacity(CALIBRATION_TARGETS.len());
        for target in CALIBRATION_TARGETS {
            log::info!("Channel {} Vset = {}V", unit, target);
            self.board(unit).set_voltage(target)?;
            clock.sleep(CALIBRATION_POLL_INTERVAL);
            self.wait_for_status(unit, ChannelStatus::Up)?;
            clock.sleep(CALIBRATION_LEVELING_DELAY);
            let mean = self.sample_voltage(unit)?;
            log::info!("Channel {} Vset = {}V reached, mean = {}", unit, target, mean);
            points.push((mean, target as f64));
        }

        let (slope, offset) = linear_regression(&points).ok_or(HvError::SingularRegression)?;
        log::info!("Channel {} slope = {}, offset = {}", unit, slope, offset);

        let mut board = self.board(unit);
        board.write_calibration_slope(slope)?;
        board.write_calibration_offset(offset)?;
        let stored = board.read_calibration()?;

        log::info!("Stop calibration with status=DOWN Vset={}V", CALIBRATION_IDLE_VOLTAGE);
        board.set_voltage(CALIBRATION_IDLE_VOLTAGE)?;
        board.power_off()?;
        Ok(stored)
    }

    /// Calibrate each requested channel in turn. True only if every one of them was calibrated.
    pub fn calibrate_channels(&mut self, channels: &[i64]) -> bool {
        let (ids, rejected) = partition_channels(channels);
        let mut all_calibrated = rejected.is_empty() && !ids.is_empty();
        for channel in rejected {
            log::warn!("Channel {} is out of range. Ignored.", channel);
        }
        for id in ids {
            log::info!("Calibrating channel {}", id);
            match self.calibrate(id) {
                Ok(result) => log::info!(
                    "Channel {} calibrated: slope {:.4} offset {:.4} discriminator {:.2}",
                    id,
                    result.slope,
                    result.offset,
                    result.discriminator
                ),
                Err(e) => {
                    log::error!("Calibration of channel {} failed: {}", id, e);
                    all_calibrated = false;
                }
            }
        }
        all_calibrated
    }

    /// Snapshot of every requested channel that answers
    pub fn monitor(&mut self, channels: &[i64]) -> Vec<ChannelState> {
        let (ids, _) = partition_channels(channels);
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            match self.open(id.get()).and_then(|mut board| board.monitor().map_err(HvError::from)) {
                Ok(state) => states.push(state),
                Err(e) => log::warn!("Could not monitor channel {}: {}", id, e),
            }
        }
        states
    }
}
