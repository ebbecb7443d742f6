use crate::clock::SharedClock;
use crate::config::ServerConfig;
use crate::constants::*;
use crate::daq::{AcquisitionKind, AcquisitionSession, RunRequest, RunSummary};
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::{AcquisitionError, ServerError};
use crate::handshake::ServerHandshake;
use crate::hv::{ChannelConfig, ChannelReport, ChannelState};
use crate::instruments::InstrumentManager;
use crate::protocol::{ChannelSelection, ClientCommand, ClientId, Command, HvCommand, RcCommand, Response};
use crate::registry::ClientRegistry;
use crate::transport::{DaqConnector, RouterTransport, ZmqDaqConnector, ZmqRouter};

/// Polarizer calibration: one acquisition per angle in [start_angle, start_angle + amplitude)
#[derive(Debug, Clone, PartialEq)]
pub struct PolarizerScan {
    pub start_angle: u32,
    pub step: u32,
    pub amplitude: u32,
    pub near_wheel: u32,
    pub far_wheel: u32,
    pub voltage: u16,
    pub timer: u64,
    pub run_id: String,
}

/// Single photoelectron spectrum at a fixed optical setting
#[derive(Debug, Clone, PartialEq)]
pub struct SpeRun {
    pub polarizer_angle: f64,
    pub near_wheel: u32,
    pub far_wheel: u32,
    pub voltage: u16,
    pub timer: u64,
    pub run_id: String,
}

/// Gain curve: one acquisition per voltage from voltage_start to voltage_end
#[derive(Debug, Clone, PartialEq)]
pub struct GainCurve {
    pub polarizer_angle: f64,
    pub near_wheel: u32,
    pub far_wheel: u32,
    pub voltage_start: u16,
    pub voltage_end: u16,
    pub voltage_step: u16,
    pub timer: u64,
    pub run_id: String,
}

/// Every combination of wheel positions from the starting ones to the last position
#[derive(Debug, Clone, PartialEq)]
pub struct WheelScan {
    pub polarizer_angle: f64,
    pub near_start: u32,
    pub far_start: u32,
    pub voltage: u16,
    pub timer: u64,
    pub run_id: String,
}

fn all_succeeded(replies: &[Reply], succeeded: impl Fn(&Response) -> bool) -> bool {
    !replies.is_empty() && replies.iter().all(|reply| reply.response().map(&succeeded).unwrap_or(false))
}

fn channel_reports(replies: Vec<Reply>) -> Vec<(ClientId, ChannelReport)> {
    let mut reports = Vec::with_capacity(replies.len());
    for reply in replies {
        match reply.outcome {
            Ok(Response::HvInitConf(report)) | Ok(Response::HvVoltageSet(report)) => {
                log::info!(
                    "Client {}: configured channels {:?}, not configured {:?}",
                    reply.client,
                    report.valid,
                    report.not_valid
                );
                reports.push((reply.client, report));
            }
            _ => log::error!("Client {} did not report its channels", reply.client),
        }
    }
    reports
}

/// # ControlServer
/// Owns the control socket, the registry of connected clients and the DMA data path. Low level
/// commands are fanned out to every Ready client; the procedures chain them into measurements.
pub struct ControlServer {
    router: Box<dyn RouterTransport>,
    registry: ClientRegistry,
    daq: Box<dyn DaqConnector>,
    instruments: InstrumentManager,
    clock: SharedClock,
    config: ServerConfig,
    batch: u32,
}

impl ControlServer {
    pub fn new(
        router: Box<dyn RouterTransport>,
        daq: Box<dyn DaqConnector>,
        instruments: InstrumentManager,
        clock: SharedClock,
        config: ServerConfig,
    ) -> Self {
        Self { router, registry: ClientRegistry::new(), daq, instruments, clock, config, batch: 0 }
    }

    /// Bind the control socket and prepare the DMA data path on the configured ports
    pub fn bind(context: &zmq::Context, instruments: InstrumentManager, clock: SharedClock, config: ServerConfig) -> Result<Self, ServerError> {
        let router = ZmqRouter::bind(context, config.control_port)?;
        let daq = ZmqDaqConnector::new(context.clone(), config.daq_port);
        Ok(Self::new(Box::new(router), Box::new(daq), instruments, clock, config))
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.registry.ready_clients()
    }

    pub fn batch(&self) -> u32 {
        self.batch
    }

    pub fn instruments(&mut self) -> &mut InstrumentManager {
        &mut self.instruments
    }

    /// Shake hands until num_clients are Ready. The batch is only taken on success.
    pub fn connect(&mut self, num_clients: usize, batch: u32) -> bool {
        let settings = self.config.handshake_settings();
        let connected = ServerHandshake::new(self.router.as_mut(), &mut self.registry, self.clock.as_ref(), &settings)
            .accept(num_clients);
        if connected {
            self.batch = batch;
            log::info!("Connection with all the multiPMTs was successful, batch {}", batch);
        } else {
            log::error!("Something went wrong during the handshake with the multiPMTs");
        }
        connected
    }

    fn broadcast(&mut self, command: Command) -> Vec<Reply> {
        let clients = self.registry.ready_clients();
        if clients.is_empty() {
            log::warn!("No clients connected, {:?} not sent", command);
            return Vec::new();
        }
        match Dispatcher::new(self.router.as_mut(), self.config.reply_timeout()).dispatch(&clients, &command) {
            Ok(replies) => replies,
            Err(e) => {
                log::error!("Could not dispatch {:?}: {}", command, e);
                Vec::new()
            }
        }
    }

    /* Low level commands */

    pub fn rc_write(&mut self, address: u16, value: u32) -> bool {
        let replies = self.broadcast(Command::RcCommand(RcCommand::WriteAddress { address, value }));
        let written = all_succeeded(&replies, |response| matches!(response, Response::RcWrite(true)));
        if written {
            log::info!("Wrote {} in register {} on every client", value, address);
        } else {
            log::error!("Writing {} in register {} failed on some clients", value, address);
        }
        written
    }

    pub fn rc_read(&mut self, address: u16) -> Vec<(ClientId, Option<u32>)> {
        self.broadcast(Command::RcCommand(RcCommand::ReadAddress { address }))
            .into_iter()
            .map(|reply| {
                let value = match reply.outcome {
                    Ok(Response::RcRead(value)) => value,
                    _ => None,
                };
                log::info!("Client {}: register {} = {:?}", reply.client, address, value);
                (reply.client, value)
            })
            .collect()
    }

    pub fn set_init_configuration(
        &mut self,
        port: &str,
        channels: ChannelSelection,
        config: &ChannelConfig,
    ) -> Vec<(ClientId, ChannelReport)> {
        channel_reports(self.broadcast(Command::HvCommand(HvCommand::init_configuration(port, channels, config))))
    }

    pub fn set_voltage(&mut self, port: &str, channels: ChannelSelection, voltage: u16) -> Vec<(ClientId, ChannelReport)> {
        let command = HvCommand::SetVoltage { port: port.to_string(), channel: channels, voltage_set: voltage };
        channel_reports(self.broadcast(Command::HvCommand(command)))
    }

    pub fn power_on(&mut self, port: &str, channels: ChannelSelection) -> bool {
        let command = HvCommand::SetPowerOn { port: port.to_string(), channel: channels };
        let replies = self.broadcast(Command::HvCommand(command));
        all_succeeded(&replies, |response| matches!(response, Response::HvPowerOn(true)))
    }

    pub fn power_off(&mut self, port: &str, channels: ChannelSelection) -> bool {
        let command = HvCommand::SetPowerOff { port: port.to_string(), channel: channels };
        let replies = self.broadcast(Command::HvCommand(command));
        all_succeeded(&replies, |response| matches!(response, Response::HvPowerOff(true)))
    }

    /// Sent to each client on its own, like every other command
    pub fn hv_calibration(&mut self, port: &str, channels: ChannelSelection) -> bool {
        let command = HvCommand::HvCalibration { port: port.to_string(), channels };
        let replies = self.broadcast(Command::HvCommand(command));
        all_succeeded(&replies, |response| matches!(response, Response::HvCalibration(true)))
    }

    pub fn monitor(&mut self, port: &str, channels: ChannelSelection) -> Vec<(ClientId, Vec<ChannelState>)> {
        let command = HvCommand::Monitor { port: port.to_string(), channel: channels };
        self.broadcast(Command::HvCommand(command))
            .into_iter()
            .filter_map(|reply| match reply.outcome {
                Ok(Response::HvMonitor(states)) => Some((reply.client, states)),
                _ => None,
            })
            .collect()
    }

    pub fn init_wheels(&mut self, near: u32, far: u32) -> bool {
        self.instruments.init_wheels(near, far)
    }

    pub fn init_polarizer(&mut self, angle: f64) -> bool {
        self.instruments.init_polarizer(angle)
    }

    /* Acquisition */

    /// One timed acquisition: enable the DMA, check the signal (not for pedestals), empty the FIFO,
    /// record. The DMA is disabled again whatever the outcome.
    pub fn acquire(
        &mut self,
        suffix: &str,
        kind: AcquisitionKind,
        run_id: Option<&str>,
        timer: Option<u64>,
    ) -> Result<RunSummary, AcquisitionError> {
        let seconds = match timer {
            Some(seconds) if seconds >= MIN_ACQUISITION_SECONDS => seconds,
            other => return Err(AcquisitionError::InvalidTimer(other)),
        };
        let request = RunRequest {
            duration: Some(std::time::Duration::from_secs(seconds)),
            suffix: suffix.to_string(),
            kind,
            run_id: run_id.map(String::from),
            batch: self.batch,
        };

        self.rc_write(RC_DMA_ENABLE, DMA_ENABLE_MASK);
        self.clock.sleep(STEP_DELAY);
        log::info!("Waiting for the acquisition helpers to settle");
        self.clock.sleep(HELPER_SETTLE_DELAY);

        let result = self.capture(&request);
        match &result {
            Ok(summary) => log::info!("Acquisition stored in {}", summary.path.display()),
            Err(e) => log::error!("Acquisition {} aborted: {}", request.suffix, e),
        }

        self.clock.sleep(STEP_DELAY);
        self.rc_write(RC_DMA_ENABLE, 0);
        result
    }

    fn capture(&mut self, request: &RunRequest) -> Result<RunSummary, AcquisitionError> {
        let mut session =
            AcquisitionSession::new(self.daq.as_mut(), self.clock.clone(), DAQ_POLL_TIMEOUT, &self.config.storage_root);

        if request.kind != AcquisitionKind::Pedestal {
            let report = session.signal_integrity(INTEGRITY_DURATION)?;
            if !report.passed() {
                log::error!("Check the signal on the oscilloscope, something is probably wrong");
                return Err(AcquisitionError::SignalIntegrity(report.passing_channels()));
            }
            self.clock.sleep(POST_INTEGRITY_DELAY);
        }

        if let Err(e) = session.flush_fifo(FIFO_FLUSH_DURATION) {
            log::error!("Some problems occured emptying the FIFO: {}", e);
        }
        self.clock.sleep(PRE_RUN_DELAY);

        log::info!("Acquisition started, waiting for {:?}", request.duration);
        session.run(request)
    }

    /* Procedures */

    fn light_source(&mut self, on: bool) {
        for (address, value) in LIGHT_SOURCE_ON {
            self.rc_write(address, if on { value } else { 0 });
            self.clock.sleep(STEP_DELAY);
        }
    }

    /// Electronic pedestal with the HV off, then back to the standard operating point
    pub fn pedestal(&mut self) -> Result<RunSummary, AcquisitionError> {
        log::info!("Starting the acquisition of the electronic pedestal of the PMTs");
        let port = self.config.hv_port.clone();
        self.power_off(&port, ChannelSelection::all());
        self.clock.sleep(STEP_DELAY);
        self.rc_write(RC_PEDESTAL, 1);
        self.clock.sleep(STEP_DELAY);

        let result = self.acquire("pedestal", AcquisitionKind::Pedestal, None, Some(PEDESTAL_SECONDS));

        self.clock.sleep(STEP_DELAY);
        self.rc_write(RC_PEDESTAL, 0);
        self.clock.sleep(STEP_DELAY);
        self.set_init_configuration(&port, ChannelSelection::all(), &ChannelConfig::standard(PEDESTAL_VOLTAGE));
        self.clock.sleep(STEP_DELAY);
        self.power_on(&port, ChannelSelection::all());
        result
    }

    /// The optical procedures would record the same optical state at every step without the instruments
    fn optics_ready(&self, procedure: &str) -> bool {
        let attached = self.instruments.optics_attached();
        if !attached {
            log::error!("{} needs both filter wheels and the polarizer, which are not attached", procedure);
        }
        attached
    }

    fn scan_step(&mut self, suffix: &str, kind: AcquisitionKind, run_id: &str, timer: u64, runs: &mut Vec<RunSummary>) {
        match self.acquire(suffix, kind, Some(run_id), Some(timer)) {
            Ok(summary) => runs.push(summary),
            Err(e) => log::error!("Problem occurred during step {}: {}", suffix, e),
        }
    }

    pub fn polarizer_scan(&mut self, scan: &PolarizerScan) -> Vec<RunSummary> {
        if scan.step == 0 {
            log::error!("Polarizer step must be greater than 0");
            return Vec::new();
        }
        if !self.optics_ready("Polarizer calibration") {
            return Vec::new();
        }
        let port = self.config.hv_port.clone();
        self.init_wheels(scan.near_wheel, scan.far_wheel);
        self.set_voltage(&port, ChannelSelection::all(), scan.voltage);
        self.clock.sleep(STEP_DELAY);
        self.light_source(true);

        let mut runs = Vec::new();
        let end = scan.start_angle.saturating_add(scan.amplitude);
        for angle in (scan.start_angle..end).step_by(scan.step as usize) {
            self.init_polarizer(angle as f64);
            self.clock.sleep(STEP_DELAY);
            self.scan_step(&angle.to_string(), AcquisitionKind::Polarizer, &scan.run_id, scan.timer, &mut runs);
            self.clock.sleep(STEP_DELAY);
        }

        self.light_source(false);
        runs
    }

    pub fn spe(&mut self, spe: &SpeRun) -> Vec<RunSummary> {
        if !self.optics_ready("SPE measurement") {
            return Vec::new();
        }
        let port = self.config.hv_port.clone();
        self.init_wheels(spe.near_wheel, spe.far_wheel);
        self.init_polarizer(spe.polarizer_angle);
        self.light_source(true);
        self.set_voltage(&port, ChannelSelection::all(), spe.voltage);
        self.clock.sleep(STEP_DELAY);

        let mut runs = Vec::new();
        self.scan_step(&spe.voltage.to_string(), AcquisitionKind::Spe, &spe.run_id, spe.timer, &mut runs);

        self.light_source(false);
        runs
    }

    pub fn gain_curve(&mut self, curve: &GainCurve) -> Vec<RunSummary> {
        if curve.voltage_step == 0 {
            log::error!("Voltage step must be greater than 0");
            return Vec::new();
        }
        if !self.optics_ready("Gain measurement") {
            return Vec::new();
        }
        let port = self.config.hv_port.clone();
        self.init_wheels(curve.near_wheel, curve.far_wheel);
        self.init_polarizer(curve.polarizer_angle);
        self.light_source(true);

        let mut runs = Vec::new();
        for voltage in (curve.voltage_start..=curve.voltage_end).step_by(curve.voltage_step as usize) {
            self.set_voltage(&port, ChannelSelection::all(), voltage);
            log::info!("Set the voltage of the channels to {}", voltage);
            self.clock.sleep(STEP_DELAY);
            self.scan_step(&voltage.to_string(), AcquisitionKind::Gain, &curve.run_id, curve.timer, &mut runs);
        }

        self.light_source(false);
        runs
    }

    pub fn wheel_characterisation(&mut self, scan: &WheelScan) -> Vec<RunSummary> {
        if !self.optics_ready("Wheels characterisation") {
            return Vec::new();
        }
        let port = self.config.hv_port.clone();
        self.set_voltage(&port, ChannelSelection::all(), scan.voltage);
        self.clock.sleep(STEP_DELAY);
        self.init_polarizer(scan.polarizer_angle);
        self.clock.sleep(STEP_DELAY);
        self.light_source(true);

        let mut runs = Vec::new();
        for near in scan.near_start..WHEEL_POSITIONS_END {
            for far in scan.far_start..WHEEL_POSITIONS_END {
                self.init_wheels(near, far);
                self.clock.sleep(STEP_DELAY);
                let suffix = format!("wheels_{}_{}", near, far);
                self.scan_step(&suffix, AcquisitionKind::WheelsChar, &scan.run_id, scan.timer, &mut runs);
            }
        }

        self.light_source(false);
        runs
    }

    /// Leave the bench safe and send every client back to its handshake. Consumes the server so the
    /// socket is released. Returns true when every client acknowledged the exit.
    pub fn shutdown(mut self) -> bool {
        let mut acknowledged = true;
        if !self.registry.ready_clients().is_empty() {
            let port = self.config.hv_port.clone();
            self.power_off(&port, ChannelSelection::all());
            self.clock.sleep(STEP_DELAY);
            self.rc_write(RC_BOOT_0, 0);
            self.clock.sleep(STEP_DELAY);
            self.rc_write(RC_BOOT_1, 0);
            self.clock.sleep(STEP_DELAY);
            let replies = self.broadcast(Command::ClientCommand(ClientCommand::Exit));
            acknowledged = all_succeeded(&replies, |response| matches!(response, Response::ClientExit(true)));
        }
        self.registry.clear();
        self.instruments.close_all();
        log::info!("Server shut down");
        acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{decode, encode, Token};
    use crate::testing::{event_frame, ScriptedDaq, ScriptedRouter, SimulatedStage};
    use crate::transport::RoutedMessage;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn from_a(payload: &[u8]) -> Option<RoutedMessage> {
        Some(RoutedMessage { identity: ClientId::from("a"), payload: payload.to_vec() })
    }

    fn reply(router: &ScriptedRouter, response: Response) {
        router.push(from_a(&encode(&response).unwrap()));
    }

    /// Near wheel, far wheel, polarizer
    fn optics() -> (InstrumentManager, [SimulatedStage; 3]) {
        let stages = [SimulatedStage::new(12.0), SimulatedStage::new(12.0), SimulatedStage::new(360.0)];
        let mut instruments = InstrumentManager::new();
        instruments.attach_wheels(Box::new(stages[0].clone()), Box::new(stages[1].clone()));
        instruments.attach_polarizer(Box::new(stages[2].clone()));
        (instruments, stages)
    }

    fn bench(clock: &Arc<ManualClock>, root: &Path) -> (ControlServer, ScriptedRouter, ScriptedDaq) {
        bench_with(clock, root, optics().0)
    }

    fn bench_with(
        clock: &Arc<ManualClock>,
        root: &Path,
        instruments: InstrumentManager,
    ) -> (ControlServer, ScriptedRouter, ScriptedDaq) {
        let router = ScriptedRouter::new(clock.clone());
        let daq = ScriptedDaq::new(clock.clone());
        let config = ServerConfig { storage_root: root.to_path_buf(), reply_timeout_s: 1, ..Default::default() };
        let mut server = ControlServer::new(Box::new(router.clone()), Box::new(daq.clone()), instruments, clock.clone(), config);
        for token in [Token::Ping, Token::Connected, Token::Ready] {
            router.push(from_a(token.as_bytes()));
        }
        assert!(server.connect(1, 4));
        (server, router, daq)
    }

    /// Commands sent after the handshake
    fn commands(router: &ScriptedRouter) -> Vec<Command> {
        router.sent().iter().skip(2).map(|(_, payload)| decode(payload).unwrap()).collect()
    }

    fn rc(address: u16, value: u32) -> Command {
        Command::RcCommand(RcCommand::WriteAddress { address, value })
    }

    fn bright_frame() -> Vec<u8> {
        event_frame(&[(0, 2000), (1, 2000), (2, 2000), (3, 2000)])
    }

    #[test]
    fn commands_need_every_client_to_succeed() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, _) = bench(&clock, root.path());
        assert_eq!(server.clients(), vec![ClientId::from("a")]);
        assert_eq!(server.batch(), 4);

        reply(&router, Response::RcWrite(true));
        assert!(server.rc_write(19, 127));
        reply(&router, Response::RcWrite(false));
        assert!(!server.rc_write(19, 0));
        //no reply at all
        assert!(!server.power_on("/dev/ttyPS1", ChannelSelection::all()));

        reply(&router, Response::RcRead(Some(65)));
        assert_eq!(server.rc_read(10), vec![(ClientId::from("a"), Some(65))]);
    }

    #[test]
    fn nothing_is_sent_without_clients() {
        let clock = ManualClock::new();
        let router = ScriptedRouter::new(clock.clone());
        let daq = ScriptedDaq::new(clock.clone());
        let mut server =
            ControlServer::new(Box::new(router.clone()), Box::new(daq), InstrumentManager::new(), clock.clone(), ServerConfig::default());
        assert!(!server.rc_write(0, 0));
        assert!(server.set_voltage("/dev/ttyPS1", ChannelSelection::all(), 900).is_empty());
        assert!(router.sent().is_empty());
    }

    #[test]
    fn acquisition_timer_is_checked_first() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, daq) = bench(&clock, root.path());
        let result = server.acquire("x", AcquisitionKind::Spe, None, Some(5));
        assert!(matches!(result, Err(AcquisitionError::InvalidTimer(Some(5)))));
        let result = server.acquire("x", AcquisitionKind::Spe, None, None);
        assert!(matches!(result, Err(AcquisitionError::InvalidTimer(None))));
        assert!(commands(&router).is_empty());
        assert_eq!(daq.connections(), 0);
    }

    #[test]
    fn acquisition_runs_gate_flush_and_record() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, daq) = bench(&clock, root.path());
        reply(&router, Response::RcWrite(true));
        reply(&router, Response::RcWrite(true));
        daq.push(vec![bright_frame()]);
        daq.next_connection();
        daq.push(vec![vec![0u8; 64]]);
        daq.next_connection();
        daq.push(vec![event_frame(&[(1, 10), (2, 20)])]);

        let start = clock.elapsed();
        let summary = server.acquire("1200", AcquisitionKind::Gain, Some("g"), Some(30)).unwrap();
        assert_eq!(summary.events, 2);
        assert!(summary.path.starts_with(root.path().join("batch_4").join("gain_curve")));
        assert!(summary.path.to_string_lossy().contains("run_g"));
        assert_eq!(daq.connections(), 3);
        assert_eq!(daq.open_sources(), 0);
        assert_eq!(clock.elapsed() - start, Duration::from_millis(127_200));
        assert_eq!(commands(&router), vec![rc(19, 127), rc(19, 0)]);
    }

    #[test]
    fn failed_integrity_aborts_but_disables_the_dma() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, daq) = bench(&clock, root.path());
        daq.push(vec![event_frame(&[(0, 5000), (1, 10)])]);

        let result = server.acquire("spe", AcquisitionKind::Spe, None, Some(60));
        assert!(matches!(result, Err(AcquisitionError::SignalIntegrity(1))));
        assert_eq!(daq.connections(), 1);
        assert_eq!(commands(&router), vec![rc(19, 127), rc(19, 0)]);
    }

    #[test]
    fn pedestal_runs_with_the_hv_off() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, daq) = bench(&clock, root.path());
        //flush, then the pedestal run itself
        daq.next_connection();
        daq.push(vec![event_frame(&[(3, 40)])]);

        let summary = server.pedestal().unwrap();
        assert_eq!(summary.events, 1);
        assert!(summary.path.to_string_lossy().contains("pedestal_characterisation"));
        assert!(summary.path.to_string_lossy().contains("acq_1"));
        assert_eq!(daq.connections(), 2);

        let port = String::from(DEFAULT_HV_PORT);
        assert_eq!(
            commands(&router),
            vec![
                Command::HvCommand(HvCommand::SetPowerOff { port: port.clone(), channel: ChannelSelection::all() }),
                rc(12, 1),
                rc(19, 127),
                rc(19, 0),
                rc(12, 0),
                Command::HvCommand(HvCommand::init_configuration(&port, ChannelSelection::all(), &ChannelConfig::standard(1200))),
                Command::HvCommand(HvCommand::SetPowerOn { port, channel: ChannelSelection::all() }),
            ]
        );
    }

    #[test]
    fn wheel_scan_restores_the_light_source_after_failing_steps() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (instruments, [near, far, polarizer]) = optics();
        let (mut server, router, daq) = bench_with(&clock, root.path(), instruments);
        let scan = WheelScan { polarizer_angle: 30.0, near_start: 12, far_start: 11, voltage: 1200, timer: 30, run_id: "w".into() };

        //no data on the DMA path: every integrity check fails
        assert!(server.wheel_characterisation(&scan).is_empty());
        assert_eq!(daq.connections(), 2);
        assert_eq!(
            commands(&router),
            vec![
                Command::HvCommand(HvCommand::SetVoltage {
                    port: String::from(DEFAULT_HV_PORT),
                    channel: ChannelSelection::all(),
                    voltage_set: 1200
                }),
                rc(15, 2),
                rc(18, 7250),
                rc(16, 400),
                rc(19, 127),
                rc(19, 0),
                rc(19, 127),
                rc(19, 0),
                rc(15, 0),
                rc(18, 0),
                rc(16, 0),
            ]
        );
        assert_eq!(polarizer.moves(), vec![30.0]);
        assert_eq!(near.moves(), vec![12.0, 12.0]);
        assert_eq!(far.moves(), vec![11.0, 12.0]);
    }

    #[test]
    fn optical_procedures_need_the_instruments() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let mut instruments = InstrumentManager::new();
        let polarizer = SimulatedStage::new(360.0);
        instruments.attach_polarizer(Box::new(polarizer.clone()));
        let (mut server, router, daq) = bench_with(&clock, root.path(), instruments);

        let scan = PolarizerScan {
            start_angle: 0,
            step: 10,
            amplitude: 110,
            near_wheel: 10,
            far_wheel: 6,
            voltage: 1200,
            timer: 30,
            run_id: "pol".into(),
        };
        assert!(server.polarizer_scan(&scan).is_empty());
        let spe = SpeRun { polarizer_angle: 50.0, near_wheel: 6, far_wheel: 8, voltage: 1100, timer: 30, run_id: "spe".into() };
        assert!(server.spe(&spe).is_empty());
        let wheels = WheelScan { polarizer_angle: 30.0, near_start: 12, far_start: 11, voltage: 1200, timer: 30, run_id: "w".into() };
        assert!(server.wheel_characterisation(&wheels).is_empty());

        assert!(commands(&router).is_empty());
        assert_eq!(daq.connections(), 0);
        assert!(polarizer.moves().is_empty());

        //the pedestal does not use the optics
        daq.next_connection();
        daq.push(vec![event_frame(&[(3, 40)])]);
        assert!(server.pedestal().is_ok());
    }

    #[test]
    fn zero_steps_are_refused() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, _) = bench(&clock, root.path());
        let curve = GainCurve {
            polarizer_angle: 50.0,
            near_wheel: 6,
            far_wheel: 8,
            voltage_start: 800,
            voltage_end: 1400,
            voltage_step: 0,
            timer: 30,
            run_id: "gain".into(),
        };
        assert!(server.gain_curve(&curve).is_empty());
        let scan = PolarizerScan {
            start_angle: 0,
            step: 0,
            amplitude: 110,
            near_wheel: 10,
            far_wheel: 6,
            voltage: 1200,
            timer: 30,
            run_id: "pol".into(),
        };
        assert!(server.polarizer_scan(&scan).is_empty());
        assert!(commands(&router).is_empty());
    }

    #[test]
    fn gain_curve_steps_through_voltages() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (mut server, router, _) = bench(&clock, root.path());
        let curve = GainCurve {
            polarizer_angle: 50.0,
            near_wheel: 6,
            far_wheel: 8,
            voltage_start: 800,
            voltage_end: 900,
            voltage_step: 50,
            timer: 30,
            run_id: "gain".into(),
        };
        server.gain_curve(&curve);
        let voltages: Vec<u16> = commands(&router)
            .into_iter()
            .filter_map(|command| match command {
                Command::HvCommand(HvCommand::SetVoltage { voltage_set, .. }) => Some(voltage_set),
                _ => None,
            })
            .collect();
        assert_eq!(voltages, vec![800, 850, 900]);
    }

    #[test]
    fn shutdown_sends_clients_back() {
        let clock = ManualClock::new();
        let root = tempfile::tempdir().unwrap();
        let (server, router, _) = bench(&clock, root.path());
        reply(&router, Response::HvPowerOff(true));
        reply(&router, Response::RcWrite(true));
        reply(&router, Response::RcWrite(true));
        reply(&router, Response::ClientExit(true));

        assert!(server.shutdown());
        let sent = commands(&router);
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1], rc(0, 0));
        assert_eq!(sent[2], rc(1, 0));
        assert_eq!(sent[3], Command::ClientCommand(ClientCommand::Exit));
    }
}
