//! Simulated hardware and scripted transports driven by a ManualClock.
//! A scripted receive that finds nothing to deliver waits out its whole timeout on the clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::{Clock, ManualClock};
use crate::error::{HardwareError, InstrumentError, TransportError};
use crate::hv::board::register;
use crate::hv::ChannelStatus;
use crate::instruments::OpticalInstrument;
use crate::modbus::RegisterTransport;
use crate::protocol::ClientId;
use crate::run_control::RunControl;
use crate::transport::{DaqConnector, DealerTransport, FrameSource, RoutedMessage, RouterTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/*
    HV bus
 */
const DEFAULT_RAMP_TIME: Duration = Duration::from_secs(4);
const ROOM_TEMPERATURE: u16 = 25 << 8;

#[derive(Debug)]
struct SimulatedBoard {
    reported_address: u16,
    registers: HashMap<u16, u16>,
    powered: bool,
    alarm: u16,
    voltage: f64,
    ramp_end: Option<Instant>,
    gain: f64,
    bias: f64,
}

impl SimulatedBoard {
    fn new(unit: u8) -> Self {
        Self {
            reported_address: unit as u16,
            registers: HashMap::new(),
            powered: false,
            alarm: 0,
            voltage: 0.0,
            ramp_end: None,
            gain: 1.0,
            bias: 0.0,
        }
    }

    fn register(&self, address: u16) -> u16 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    fn settle(&mut self, now: Instant) {
        if self.alarm != 0 {
            return;
        }
        match self.ramp_end {
            Some(end) if now < end => (),
            _ => {
                self.ramp_end = None;
                self.voltage = if self.powered {
                    self.gain * self.register(register::VOLTAGE_SET) as f64 + self.bias
                } else {
                    0.0
                };
            }
        }
    }

    fn status(&self) -> ChannelStatus {
        match (self.alarm != 0, self.ramp_end.is_some(), self.powered) {
            (true, _, _) => ChannelStatus::Trip,
            (false, true, true) => ChannelStatus::RampUp,
            (false, true, false) => ChannelStatus::RampDown,
            (false, false, true) => ChannelStatus::Up,
            (false, false, false) => ChannelStatus::Down,
        }
    }

    fn status_code(&self) -> u16 {
        match self.status() {
            ChannelStatus::Up => 0,
            ChannelStatus::Down => 1,
            ChannelStatus::RampUp => 2,
            ChannelStatus::RampDown => 3,
            ChannelStatus::TripUp => 4,
            ChannelStatus::TripDown => 5,
            ChannelStatus::Trip => 6,
            ChannelStatus::Undefined => 7,
        }
    }

    fn read(&self, address: u16) -> u16 {
        let millivolts = (self.voltage * 1000.0).round().max(0.0) as u32;
        match address {
            register::ADDRESS => self.reported_address,
            register::STATUS => self.status_code(),
            register::ALARM => self.alarm,
            register::VOLTAGE_LSB => (millivolts & 0xFFFF) as u16,
            register::VOLTAGE_MSB => (millivolts >> 16) as u16,
            register::TEMPERATURE => ROOM_TEMPERATURE,
            other => self.register(other),
        }
    }
}

#[derive(Debug)]
struct BusState {
    boards: HashMap<u8, SimulatedBoard>,
    ramp_time: Duration,
    transactions: usize,
    register_writes: Vec<(u8, u16, u16)>,
}

/// # SimulatedHvBus
/// A bus of HV boards that ramp in simulated time. Clones share the same boards.
#[derive(Debug, Clone)]
pub struct SimulatedHvBus {
    clock: Arc<ManualClock>,
    state: Arc<Mutex<BusState>>,
}

impl SimulatedHvBus {
    pub fn new(clock: Arc<ManualClock>, units: &[u8]) -> Self {
        let boards = units.iter().map(|unit| (*unit, SimulatedBoard::new(*unit))).collect();
        let state = BusState { boards, ramp_time: DEFAULT_RAMP_TIME, transactions: 0, register_writes: Vec::new() };
        Self { clock, state: Arc::new(Mutex::new(state)) }
    }

    fn with_board<T>(&self, unit: u8, f: impl FnOnce(&mut SimulatedBoard, Instant, Duration) -> T) -> Option<T> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let ramp_time = state.ramp_time;
        state.boards.get_mut(&unit).map(|board| {
            board.settle(now);
            f(board, now, ramp_time)
        })
    }

    pub fn transactions(&self) -> usize {
        lock(&self.state).transactions
    }

    pub fn register_writes(&self) -> Vec<(u8, u16, u16)> {
        lock(&self.state).register_writes.clone()
    }

    pub fn set_ramp_time(&self, ramp_time: Duration) {
        lock(&self.state).ramp_time = ramp_time;
    }

    pub fn set_reported_address(&self, unit: u8, address: u16) {
        self.with_board(unit, |board, _, _| board.reported_address = address);
    }

    pub fn set_alarm(&self, unit: u8, alarm: u16) {
        self.with_board(unit, |board, _, _| board.alarm = alarm);
    }

    /// Settled readback becomes gain * setpoint + bias
    pub fn set_response(&self, unit: u8, gain: f64, bias: f64) {
        self.with_board(unit, |board, _, _| {
            board.gain = gain;
            board.bias = bias;
        });
    }

    pub fn status(&self, unit: u8) -> ChannelStatus {
        self.with_board(unit, |board, _, _| board.status()).unwrap_or(ChannelStatus::Undefined)
    }

    pub fn is_powered(&self, unit: u8) -> bool {
        self.with_board(unit, |board, _, _| board.powered).unwrap_or(false)
    }

    pub fn register(&self, unit: u8, address: u16) -> u16 {
        self.with_board(unit, |board, _, _| board.read(address)).unwrap_or(0)
    }

    fn count(&self) {
        lock(&self.state).transactions += 1;
    }
}

impl RegisterTransport for SimulatedHvBus {
    fn read_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>, HardwareError> {
        self.count();
        self.with_board(unit, |board, _, _| (address..address + count).map(|a| board.read(a)).collect())
            .ok_or(HardwareError::NoResponse(unit))
    }

    fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<(), HardwareError> {
        self.count();
        self.with_board(unit, |board, now, ramp_time| {
            board.registers.insert(address, value);
            if address == register::VOLTAGE_SET && board.powered {
                board.ramp_end = Some(now + ramp_time);
            }
        })
        .ok_or(HardwareError::NoResponse(unit))?;
        lock(&self.state).register_writes.push((unit, address, value));
        Ok(())
    }

    fn write_coil(&mut self, unit: u8, address: u16, on: bool) -> Result<(), HardwareError> {
        self.count();
        self.with_board(unit, |board, now, ramp_time| {
            if address == register::POWER_COIL && board.powered != on {
                board.powered = on;
                board.ramp_end = Some(now + ramp_time);
            }
        })
        .ok_or(HardwareError::NoResponse(unit))
    }
}

/*
    Control channel
 */
#[derive(Debug, Default)]
struct RouterScript {
    incoming: VecDeque<Option<RoutedMessage>>,
    sent: Vec<(ClientId, Vec<u8>)>,
    timeouts: usize,
}

/// # ScriptedRouter
/// Delivers pushed messages in order. A None entry, or an empty script, is a receive timeout.
/// Clones share the same script.
#[derive(Debug, Clone)]
pub struct ScriptedRouter {
    clock: Arc<ManualClock>,
    script: Arc<Mutex<RouterScript>>,
}

impl ScriptedRouter {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self { clock, script: Arc::new(Mutex::new(RouterScript::default())) }
    }

    pub fn push(&self, message: Option<RoutedMessage>) {
        lock(&self.script).incoming.push_back(message);
    }

    pub fn sent(&self) -> Vec<(ClientId, Vec<u8>)> {
        lock(&self.script).sent.clone()
    }

    pub fn timeouts(&self) -> usize {
        lock(&self.script).timeouts
    }
}

impl RouterTransport for ScriptedRouter {
    fn send_to(&mut self, client: &ClientId, payload: &[u8]) -> Result<(), TransportError> {
        lock(&self.script).sent.push((client.clone(), payload.to_vec()));
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<RoutedMessage>, TransportError> {
        let mut script = lock(&self.script);
        match script.incoming.pop_front().flatten() {
            Some(message) => Ok(Some(message)),
            None => {
                script.timeouts += 1;
                self.clock.advance(timeout);
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Default)]
struct DealerScript {
    incoming: VecDeque<Option<Vec<u8>>>,
    sent: Vec<Vec<u8>>,
}

/// # ScriptedDealer
/// Client side counterpart of ScriptedRouter
#[derive(Debug, Clone)]
pub struct ScriptedDealer {
    clock: Arc<ManualClock>,
    script: Arc<Mutex<DealerScript>>,
}

impl ScriptedDealer {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self { clock, script: Arc::new(Mutex::new(DealerScript::default())) }
    }

    pub fn push(&self, payload: Option<Vec<u8>>) {
        lock(&self.script).incoming.push_back(payload);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.script).sent.clone()
    }
}

impl DealerTransport for ScriptedDealer {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        lock(&self.script).sent.push(payload.to_vec());
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match lock(&self.script).incoming.pop_front().flatten() {
            Some(payload) => Ok(Some(payload)),
            None => {
                self.clock.advance(timeout);
                Ok(None)
            }
        }
    }
}

/*
    DMA data path
 */
#[derive(Debug)]
enum DaqEntry {
    Frames(Vec<Vec<u8>>),
    Failure,
}

#[derive(Debug, Default)]
struct DaqScript {
    connections: VecDeque<VecDeque<DaqEntry>>,
    made: usize,
}

/// # ScriptedDaq
/// Connector handing out sources that replay one script each. Pushed messages go to the next
/// source to be connected until next_connection starts the script of the following one.
#[derive(Debug, Clone)]
pub struct ScriptedDaq {
    clock: Arc<ManualClock>,
    script: Arc<Mutex<DaqScript>>,
    open: Arc<AtomicUsize>,
}

impl ScriptedDaq {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self { clock, script: Arc::new(Mutex::new(DaqScript::default())), open: Arc::new(AtomicUsize::new(0)) }
    }

    fn append(&self, entry: DaqEntry) {
        let mut script = lock(&self.script);
        if script.connections.is_empty() {
            script.connections.push_back(VecDeque::new());
        }
        if let Some(last) = script.connections.back_mut() {
            last.push_back(entry);
        }
    }

    /// One message made of these data frames
    pub fn push(&self, frames: Vec<Vec<u8>>) {
        self.append(DaqEntry::Frames(frames));
    }

    pub fn push_error(&self) {
        self.append(DaqEntry::Failure);
    }

    pub fn next_connection(&self) {
        let mut script = lock(&self.script);
        if script.connections.is_empty() {
            script.connections.push_back(VecDeque::new());
        }
        script.connections.push_back(VecDeque::new());
    }

    pub fn connections(&self) -> usize {
        lock(&self.script).made
    }

    /// Sources handed out and not yet dropped
    pub fn open_sources(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl DaqConnector for ScriptedDaq {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError> {
        let mut script = lock(&self.script);
        script.made += 1;
        let entries = script.connections.pop_front().unwrap_or_default();
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource { entries, clock: self.clock.clone(), open: self.open.clone() }))
    }
}

struct ScriptedSource {
    entries: VecDeque<DaqEntry>,
    clock: Arc<ManualClock>,
    open: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn recv_frames(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        match self.entries.pop_front() {
            Some(DaqEntry::Frames(frames)) => Ok(Some(frames)),
            Some(DaqEntry::Failure) => Err(TransportError::BadEnvelope(0)),
            None => {
                self.clock.advance(timeout);
                Ok(None)
            }
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Little-endian bytes of one 8-word group per (channel, energy) pair
pub fn event_frame(events: &[(u8, u16)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(events.len() * 16);
    for (channel, energy) in events {
        let words: [u16; 8] = [
            0xABCD,
            ((*channel as u16) & 0x1F) << 8,
            0,
            0,
            0,
            (energy >> 8) & 0x3F,
            (energy & 0xFF) << 8,
            0xEF01,
        ];
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
    }
    bytes
}

/*
    Run control
 */
#[derive(Debug, Default)]
struct RunControlState {
    registers: HashMap<u16, u32>,
    writes: Vec<(u16, u32)>,
    broken: bool,
}

/// # RecordingRunControl
/// Register bank in memory that remembers every write. Clones share the bank.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunControl {
    state: Arc<Mutex<RunControlState>>,
}

impl RecordingRunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(u16, u32)> {
        lock(&self.state).writes.clone()
    }

    pub fn preset(&self, address: u16, value: u32) {
        lock(&self.state).registers.insert(address, value);
    }

    /// Every following access fails as if the bank were not mapped
    pub fn break_bank(&self) {
        lock(&self.state).broken = true;
    }
}

impl RunControl for RecordingRunControl {
    fn write(&mut self, address: u16, value: u32) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        if state.broken {
            return Err(HardwareError::RegisterOutOfRange(address));
        }
        state.registers.insert(address, value);
        state.writes.push((address, value));
        Ok(())
    }

    fn read(&mut self, address: u16) -> Result<u32, HardwareError> {
        let state = lock(&self.state);
        if state.broken {
            return Err(HardwareError::RegisterOutOfRange(address));
        }
        Ok(state.registers.get(&address).copied().unwrap_or(0))
    }
}

/*
    Optics
 */
#[derive(Debug, Default)]
struct StageState {
    moves: Vec<f64>,
    closed: bool,
}

/// # SimulatedStage
/// Optical stage that accepts positions up to limit and records every move. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStage {
    state: Arc<Mutex<StageState>>,
    limit: f64,
}

impl SimulatedStage {
    pub fn new(limit: f64) -> Self {
        Self { limit, ..Default::default() }
    }

    pub fn moves(&self) -> Vec<f64> {
        lock(&self.state).moves.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl OpticalInstrument for SimulatedStage {
    fn port(&self) -> &str {
        "/dev/null"
    }

    fn info(&mut self) -> Result<String, InstrumentError> {
        Ok(String::from("stage"))
    }

    fn go_to(&mut self, position: f64) -> Result<(), InstrumentError> {
        if position > self.limit {
            return Err(InstrumentError::BadPosition(position));
        }
        lock(&self.state).moves.push(position);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}
