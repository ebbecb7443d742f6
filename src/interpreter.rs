use std::collections::hash_map::Entry;
use std::time::Duration;

use fxhash::FxHashMap;

use crate::clock::SharedClock;
use crate::config::{ClientConfig, RegisterWrite};
use crate::constants::RC_WRITE_DELAY;
use crate::error::{HandshakeError, HardwareError};
use crate::handshake::LocalBringUp;
use crate::helper::HelperProcess;
use crate::hv::{ChannelConfig, ChannelReport, HvController};
use crate::modbus::RegisterTransport;
use crate::protocol::{decode, ChannelSelection, ClientCommand, Command, HvCommand, RcCommand, Response};
use crate::run_control::RunControl;

/// Opens the register bus behind a serial port name
pub type BusOpener = Box<dyn FnMut(&str) -> Result<Box<dyn RegisterTransport>, HardwareError>>;

/// What the client does after one message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Reply(Response),
    /// Send the acknowledgment, then go back to the handshake
    Exit(Response),
    Ignored,
}

/// What the client does on the initialization trigger
#[derive(Debug, Clone, PartialEq)]
pub struct BringUpPlan {
    pub rc_writes: Vec<RegisterWrite>,
    pub hv_port: String,
    pub hv_config: ChannelConfig,
    pub helper_command: Vec<String>,
    pub helper_stop_command: Vec<String>,
    pub helper_grace: Duration,
}

impl From<&ClientConfig> for BringUpPlan {
    fn from(config: &ClientConfig) -> Self {
        Self {
            rc_writes: config.bring_up_rc.clone(),
            hv_port: config.hv_port.clone(),
            hv_config: config.bring_up_hv.clone(),
            helper_command: config.helper_command.clone(),
            helper_stop_command: config.helper_stop_command.clone(),
            helper_grace: config.helper_grace(),
        }
    }
}

fn rejected_report(channels: &[i64]) -> ChannelReport {
    ChannelReport { valid: Vec::new(), not_valid: channels.to_vec() }
}

/// # Interpreter
/// Client side of the steady state protocol. Every decoded command runs its local action and yields
/// exactly one response; messages that are not commands are logged and ignored.
pub struct Interpreter {
    buses: FxHashMap<String, HvController>,
    opener: BusOpener,
    run_control: Box<dyn RunControl>,
    helper: Option<HelperProcess>,
    plan: BringUpPlan,
    clock: SharedClock,
}

impl Interpreter {
    pub fn new(opener: BusOpener, run_control: Box<dyn RunControl>, plan: BringUpPlan, clock: SharedClock) -> Self {
        Self { buses: FxHashMap::default(), opener, run_control, helper: None, plan, clock }
    }

    /// The controller of the bus on port, opened on first use
    fn controller(&mut self, port: &str) -> Result<&mut HvController, HardwareError> {
        match self.buses.entry(port.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let bus = (self.opener)(port)?;
                log::info!("Opened HV bus on {}", port);
                Ok(entry.insert(HvController::new(bus, self.clock.clone())))
            }
        }
    }

    pub fn helper_running(&mut self) -> bool {
        self.helper.as_mut().map(|helper| helper.is_running()).unwrap_or(false)
    }

    fn stop_helper(&mut self) -> bool {
        match self.helper.take() {
            Some(mut helper) => match helper.stop(&self.plan.helper_stop_command, self.plan.helper_grace) {
                Ok(status) => {
                    log::info!("Acquisition helper terminated ({})", status);
                    true
                }
                Err(e) => {
                    log::error!("Could not stop the acquisition helper: {}", e);
                    false
                }
            },
            None => {
                log::info!("No acquisition helper running");
                true
            }
        }
    }

    pub fn handle(&mut self, payload: &[u8]) -> Outcome {
        let command: Command = match decode(payload) {
            Ok(command) => command,
            Err(e) => {
                log::error!("Ignoring message {:?}: {}", String::from_utf8_lossy(payload), e);
                return Outcome::Ignored;
            }
        };
        log::info!("Received the following command {:?}", command);
        match command {
            Command::ClientCommand(ClientCommand::Exit) => {
                log::info!("Exit command received. Stopping the acquisition helper");
                Outcome::Exit(Response::ClientExit(self.stop_helper()))
            }
            Command::RcCommand(rc) => Outcome::Reply(self.run_rc(rc)),
            Command::HvCommand(hv) => Outcome::Reply(self.run_hv(hv)),
        }
    }

    fn run_rc(&mut self, command: RcCommand) -> Response {
        match command {
            RcCommand::WriteAddress { address, value } => match self.run_control.write(address, value) {
                Ok(()) => {
                    log::info!("Successfully wrote the value {} in register {}", value, address);
                    Response::RcWrite(true)
                }
                Err(e) => {
                    log::error!("It was not possible to write the value {} in register {}: {}", value, address, e);
                    Response::RcWrite(false)
                }
            },
            RcCommand::ReadAddress { address } => match self.run_control.read(address) {
                Ok(value) => Response::RcRead(Some(value)),
                Err(e) => {
                    log::error!("It was not possible to read register {}: {}", address, e);
                    Response::RcRead(None)
                }
            },
        }
    }

    fn run_hv(&mut self, command: HvCommand) -> Response {
        let port = command.port().to_string();
        match command {
            HvCommand::SetInitConfiguration {
                channel,
                voltage_set,
                threshold_set,
                limit_trip_time,
                limit_voltage,
                limit_current,
                limit_temperature,
                rate_up,
                rate_down,
                ..
            } => {
                let config = ChannelConfig {
                    voltage_set,
                    threshold_set,
                    limit_trip_time,
                    limit_voltage,
                    limit_current,
                    limit_temperature,
                    rate_up,
                    rate_down,
                };
                Response::HvInitConf(self.configure(&port, &channel, &config))
            }
            HvCommand::SetVoltage { channel, voltage_set, .. } => {
                Response::HvVoltageSet(self.configure(&port, &channel, &ChannelConfig::voltage(voltage_set)))
            }
            HvCommand::SetPowerOn { channel, .. } => {
                Response::HvPowerOn(self.with_channels(&port, &channel, |hv, channels| hv.power_on(channels)).unwrap_or(false))
            }
            HvCommand::SetPowerOff { channel, .. } => {
                Response::HvPowerOff(self.with_channels(&port, &channel, |hv, channels| hv.power_off(channels)).unwrap_or(false))
            }
            HvCommand::HvCalibration { channels, .. } => Response::HvCalibration(
                self.with_channels(&port, &channels, |hv, channels| hv.calibrate_channels(channels))
                    .unwrap_or(false),
            ),
            HvCommand::Monitor { channel, .. } => {
                Response::HvMonitor(self.with_channels(&port, &channel, |hv, channels| hv.monitor(channels)).unwrap_or_default())
            }
        }
    }

    /// Resolve the selection and run action on the controller of port. None when either step fails.
    fn with_channels<T>(
        &mut self,
        port: &str,
        selection: &ChannelSelection,
        action: impl FnOnce(&mut HvController, &[i64]) -> T,
    ) -> Option<T> {
        let channels = match selection.resolve() {
            Ok(channels) => channels,
            Err(e) => {
                log::error!("{}", e);
                return None;
            }
        };
        match self.controller(port) {
            Ok(hv) => Some(action(hv, &channels)),
            Err(e) => {
                log::error!("Could not open the HV bus on {}: {}", port, e);
                None
            }
        }
    }

    fn configure(&mut self, port: &str, selection: &ChannelSelection, config: &ChannelConfig) -> ChannelReport {
        let requested = selection.resolve().unwrap_or_default();
        let report = self.with_channels(port, selection, |hv, channels| hv.configure_channels(channels, config));
        let report = report.unwrap_or_else(|| rejected_report(&requested));
        log::info!(
            "Configured channels {:?}, could not configure {:?}",
            report.valid,
            report.not_valid
        );
        report
    }

    fn write_rc_sequence(&mut self) -> Result<(), HandshakeError> {
        let writes = self.plan.rc_writes.clone();
        for RegisterWrite { address, value } in writes {
            self.run_control
                .write(address, value)
                .map_err(|e| HandshakeError::BringUp(format!("RC write {} <- {} failed: {}", address, value, e)))?;
            self.clock.sleep(RC_WRITE_DELAY);
        }
        Ok(())
    }
}

impl LocalBringUp for Interpreter {
    fn bring_up(&mut self) -> Result<(), HandshakeError> {
        self.write_rc_sequence()?;

        let port = self.plan.hv_port.clone();
        let config = self.plan.hv_config.clone();
        let all = ChannelSelection::all();
        let report = self
            .with_channels(&port, &all, |hv, channels| hv.configure_channels(channels, &config))
            .ok_or_else(|| HandshakeError::BringUp(format!("HV bus {} unavailable", port)))?;
        if report.valid.is_empty() {
            return Err(HandshakeError::BringUp(String::from("no HV channel could be configured")));
        }
        if !report.not_valid.is_empty() {
            log::warn!("HV channels {:?} were not configured", report.not_valid);
        }
        let powered = self
            .with_channels(&port, &all, |hv, channels| hv.power_on(channels))
            .unwrap_or(false);
        if !powered {
            return Err(HandshakeError::BringUp(String::from("HV power on failed")));
        }

        if self.helper.is_some() {
            log::warn!("Acquisition helper from a previous session still around, stopping it");
            self.stop_helper();
        }
        log::info!("Executing the acquisition helper: {:?}", self.plan.helper_command);
        let helper = HelperProcess::start(&self.plan.helper_command)
            .map_err(|e| HandshakeError::BringUp(format!("helper did not start: {}", e)))?;
        self.helper = Some(helper);
        Ok(())
    }
}
