use crate::clock::SharedClock;
use crate::config::ClientConfig;
use crate::constants::COMMAND_POLL_TIMEOUT;
use crate::error::ClientError;
use crate::handshake::ClientHandshake;
use crate::interpreter::{Interpreter, Outcome};
use crate::protocol::{encode, ClientId};
use crate::transport::{DealerTransport, ZmqDealer};

/// # ControlClient
/// Embedded side of the bench. Each session connects, shakes hands (bringing the local hardware up),
/// then serves commands until the server sends it back with an exit. Sessions repeat forever.
pub struct ControlClient {
    config: ClientConfig,
    interpreter: Interpreter,
    clock: SharedClock,
}

impl ControlClient {
    pub fn new(config: ClientConfig, interpreter: Interpreter, clock: SharedClock) -> Self {
        Self { config, interpreter, clock }
    }

    /// One session over transport. Ok when the server ended it with an exit command.
    pub fn run_once(&mut self, transport: &mut dyn DealerTransport) -> Result<(), ClientError> {
        ClientHandshake::new(transport, self.config.ping_interval(), self.config.trigger_timeout())
            .run(&mut self.interpreter)?;
        log::info!("Waiting for commands");

        loop {
            let payload = match transport.recv_timeout(COMMAND_POLL_TIMEOUT)? {
                Some(payload) => payload,
                None => continue,
            };
            match self.interpreter.handle(&payload) {
                Outcome::Reply(response) => transport.send(&encode(&response)?)?,
                Outcome::Exit(response) => {
                    transport.send(&encode(&response)?)?;
                    return Ok(());
                }
                Outcome::Ignored => (),
            }
        }
    }

    pub fn run(&mut self, context: &zmq::Context) {
        let identity = ClientId::from(self.config.identity.as_str());
        loop {
            let mut dealer = match ZmqDealer::connect(context, &self.config.server_address, self.config.port, &identity) {
                Ok(dealer) => dealer,
                Err(e) => {
                    log::error!("Could not connect to {}:{}: {}", self.config.server_address, self.config.port, e);
                    self.clock.sleep(self.config.ping_interval());
                    continue;
                }
            };
            match self.run_once(&mut dealer) {
                Ok(()) => log::info!("Session closed by the server, restarting"),
                Err(e) => log::error!("Session failed: {}. Restarting", e),
            }
        }
    }
}
