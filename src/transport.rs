use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::ClientId;

/// A payload together with the identity of the peer that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub identity: ClientId,
    pub payload: Vec<u8>,
}

/// # RouterTransport
/// Server side of the control channel: many peers multiplexed over one socket by identity.
/// A receive timeout is not an error, it yields Ok(None).
pub trait RouterTransport {
    fn send_to(&mut self, client: &ClientId, payload: &[u8]) -> Result<(), TransportError>;
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<RoutedMessage>, TransportError>;
}

/// # DealerTransport
/// Client side of the control channel, talks to the single server it is connected to.
pub trait DealerTransport {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;
}

/// # FrameSource
/// The DMA data path: each receive yields the data frames of one message, without the sender identity.
pub trait FrameSource {
    fn recv_frames(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, TransportError>;
}

/// Opens a fresh DMA data path for each acquisition step
pub trait DaqConnector {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError>;
}

fn poll_readable(socket: &zmq::Socket, timeout: Duration) -> Result<bool, TransportError> {
    let ready = socket.poll(zmq::POLLIN, timeout.as_millis() as i64)?;
    Ok(ready > 0)
}

/// # ZmqRouter
/// ROUTER socket bound on all interfaces
pub struct ZmqRouter {
    socket: zmq::Socket,
}

impl ZmqRouter {
    pub fn bind(context: &zmq::Context, port: u16) -> Result<Self, TransportError> {
        let endpoint = format!("tcp://*:{}", port);
        let socket = context.socket(zmq::ROUTER)?;
        socket.set_linger(0)?;
        socket
            .bind(&endpoint)
            .map_err(|e| TransportError::Bind(endpoint.clone(), e))?;
        log::info!("Server started on {}", endpoint);
        Ok(Self { socket })
    }

    fn recv_envelope(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(self.socket.recv_multipart(0)?)
    }
}

impl RouterTransport for ZmqRouter {
    fn send_to(&mut self, client: &ClientId, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.send_multipart([client.as_bytes(), payload], 0)?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<RoutedMessage>, TransportError> {
        if !poll_readable(&self.socket, timeout)? {
            return Ok(None);
        }
        let mut frames = self.recv_envelope()?;
        if frames.len() != 2 {
            return Err(TransportError::BadEnvelope(frames.len()));
        }
        let payload = frames.pop().unwrap_or_default();
        let identity = ClientId::new(&frames.pop().unwrap_or_default());
        Ok(Some(RoutedMessage { identity, payload }))
    }
}

/// # ZmqDealer
/// DEALER socket with a fixed identity, connected to the control server
pub struct ZmqDealer {
    socket: zmq::Socket,
}

impl ZmqDealer {
    pub fn connect(context: &zmq::Context, address: &str, port: u16, identity: &ClientId) -> Result<Self, TransportError> {
        let endpoint = format!("tcp://{}:{}", address, port);
        let socket = context.socket(zmq::DEALER)?;
        socket.set_linger(0)?;
        socket.set_identity(identity.as_bytes())?;
        socket
            .connect(&endpoint)
            .map_err(|e| TransportError::Connect(endpoint.clone(), e))?;
        log::info!("Client {} connected to {}", identity, endpoint);
        Ok(Self { socket })
    }
}

impl DealerTransport for ZmqDealer {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.send(payload, 0)?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if !poll_readable(&self.socket, timeout)? {
            return Ok(None);
        }
        Ok(Some(self.socket.recv_bytes(0)?))
    }
}

/// # ZmqDaqSource
/// ROUTER socket the acquisition helpers push their DMA buffers to. The socket is released when the
/// source is dropped, so every acquisition step gets a clean one.
pub struct ZmqDaqSource {
    socket: zmq::Socket,
}

impl ZmqDaqSource {
    pub fn bind(context: &zmq::Context, port: u16) -> Result<Self, TransportError> {
        let endpoint = format!("tcp://*:{}", port);
        let socket = context.socket(zmq::ROUTER)?;
        socket.set_linger(0)?;
        socket
            .bind(&endpoint)
            .map_err(|e| TransportError::Bind(endpoint.clone(), e))?;
        log::debug!("DMA source listening on {}", endpoint);
        Ok(Self { socket })
    }
}

impl FrameSource for ZmqDaqSource {
    fn recv_frames(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if !poll_readable(&self.socket, timeout)? {
            return Ok(None);
        }
        let mut frames = self.socket.recv_multipart(0)?;
        if frames.is_empty() {
            return Err(TransportError::BadEnvelope(0));
        }
        frames.remove(0); //sender identity
        Ok(Some(frames))
    }
}

/// Binds a new DMA source on the configured port for each acquisition step
pub struct ZmqDaqConnector {
    context: zmq::Context,
    port: u16,
}

impl ZmqDaqConnector {
    pub fn new(context: zmq::Context, port: u16) -> Self {
        Self { context, port }
    }
}

impl DaqConnector for ZmqDaqConnector {
    fn connect(&mut self) -> Result<Box<dyn FrameSource>, TransportError> {
        Ok(Box::new(ZmqDaqSource::bind(&self.context, self.port)?))
    }
}
