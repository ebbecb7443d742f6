use std::path::PathBuf;
use thiserror::Error;

use super::protocol::{ClientId, ResponseKind};

/*
    Transport errors
 */
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind socket on {0}: {1}")]
    Bind(String, zmq::Error),
    #[error("Failed to connect socket to {0}: {1}")]
    Connect(String, zmq::Error),
    #[error("Transport recieved a zmq error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("Transport recieved a message with {0} frames, expected an identity and a payload")]
    BadEnvelope(usize),
}

/*
    Protocol errors
 */
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Could not encode or decode a message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not parse channel selection {0:?}")]
    BadChannelSelection(String),
}

/*
    Handshake errors
 */
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Unexpected message while waiting for {expected}: {found:?}")]
    UnexpectedMessage { expected: &'static str, found: String },
    #[error("Handshake transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Local bring-up failed: {0}")]
    BringUp(String),
}

/*
    Hardware errors
 */
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Hardware recieved an io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Device {0} did not respond")]
    NoResponse(u8),
    #[error("Bad CRC in the response of device {0}")]
    BadCrc(u8),
    #[error("Device {unit} answered function {function:#04x} with exception code {code}")]
    Exception { unit: u8, function: u8, code: u8 },
    #[error("Malformed response from device {0}")]
    BadResponse(u8),
    #[error("Register {0} is outside of the mapped register bank")]
    RegisterOutOfRange(u16),
}

/*
    HV errors
 */
#[derive(Debug, Error)]
pub enum HvError {
    #[error("Channel {0} is outside of the valid range")]
    InvalidChannel(i64),
    #[error("Channel {channel} could not be opened: {source}")]
    OpenFailed { channel: u8, source: HardwareError },
    #[error("Channel {channel} answers with address {found}")]
    AddressMismatch { channel: u8, found: u16 },
    #[error("HV hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("Calibration regression is singular, not enough distinct samples")]
    SingularRegression,
}

/*
    Event stream errors
 */
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Event group has {0} words, expected 8")]
    WrongWordCount(usize),
}

/*
    Storage errors
 */
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage recieved an io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Storage recieved a csv error: {0}")]
    Csv(#[from] csv::Error),
}

/*
    Acquisition errors
 */
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Acquisition timer {0:?} is invalid, choose at least 10 seconds")]
    InvalidTimer(Option<u64>),
    #[error("Signal integrity check failed: {0} channels above threshold")]
    SignalIntegrity(usize),
    #[error("Acquisition transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Acquisition storage error: {0}")]
    Storage(#[from] StorageError),
}

/*
    Config errors
 */
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("File {} given to Config does not exist!", .0.display())]
    BadFilePath(PathBuf),
    #[error("Config received an io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config received a parsing error: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

/*
    Helper process errors
 */
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("Helper command is empty")]
    EmptyCommand,
    #[error("Helper process recieved an io error: {0}")]
    IOError(#[from] std::io::Error),
}

/*
    Dispatch errors
 */
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatch transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Dispatch protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("No reply from {0} before the timeout")]
    Timeout(ClientId),
    #[error("Reply came from {found} instead of {expected}")]
    WrongSender { expected: ClientId, found: ClientId },
    #[error("Reply tagged {found} instead of {expected}")]
    WrongResponse { expected: ResponseKind, found: ResponseKind },
}

/*
    Server errors
 */
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server transport error: {0}")]
    Transport(#[from] TransportError),
}

/*
    Client errors
 */
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Client handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Client protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/*
    Instrument errors
 */
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Instrument on {port} failed: {message}")]
    Device { port: String, message: String },
    #[error("Position {0} is outside of the instrument range")]
    BadPosition(f64),
}

/*
    Logging errors
 */
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Could not open the log file: {0}")]
    IOError(#[from] std::io::Error),
    #[error("A logger is already installed: {0}")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}
