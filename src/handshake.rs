use std::time::Duration;

use crate::clock::Clock;
use crate::constants::*;
use crate::error::HandshakeError;
use crate::protocol::{ClientId, Token};
use crate::registry::{ClientRegistry, ClientState};
use crate::transport::{DealerTransport, RouterTransport, RoutedMessage};

/// Timeouts and retry ceiling of the server side handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeSettings {
    pub poll_timeout: Duration,
    pub ready_timeout_factor: u32,
    pub max_retries: u32,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            poll_timeout: HANDSHAKE_POLL_TIMEOUT,
            ready_timeout_factor: READY_TIMEOUT_FACTOR,
            max_retries: MAX_RETRIES,
        }
    }
}

impl HandshakeSettings {
    pub fn ready_timeout(&self) -> Duration {
        self.poll_timeout * self.ready_timeout_factor
    }
}

fn describe(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

/// # ServerHandshake
/// Brings connecting clients to Ready one slot at a time:
/// heartbeat -> register + alive, confirmation -> init trigger, completion -> Ready.
/// A slot gets a bounded number of attempts, an abandoned slot does not stop the next one.
pub struct ServerHandshake<'a> {
    transport: &'a mut dyn RouterTransport,
    registry: &'a mut ClientRegistry,
    clock: &'a dyn Clock,
    settings: &'a HandshakeSettings,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(
        transport: &'a mut dyn RouterTransport,
        registry: &'a mut ClientRegistry,
        clock: &'a dyn Clock,
        settings: &'a HandshakeSettings,
    ) -> Self {
        Self { transport, registry, clock, settings }
    }

    /// Wait for the heartbeat of any client
    fn await_ping(&mut self) -> Result<ClientId, HandshakeError> {
        match self.transport.recv_timeout(self.settings.poll_timeout)? {
            Some(RoutedMessage { identity, payload }) => {
                if Token::Ping.matches(&payload) {
                    Ok(identity)
                } else {
                    Err(HandshakeError::UnexpectedMessage { expected: Token::Ping.name(), found: describe(&payload) })
                }
            }
            None => Err(HandshakeError::Timeout(Token::Ping.name())),
        }
    }

    /// Wait for token from client. Late heartbeats and traffic of other clients do not count.
    fn await_token(&mut self, client: &ClientId, token: Token, timeout: Duration) -> Result<(), HandshakeError> {
        let start = self.clock.now();
        loop {
            let elapsed = self.clock.elapsed_since(start);
            if elapsed >= timeout {
                return Err(HandshakeError::Timeout(token.name()));
            }
            let message = match self.transport.recv_timeout(timeout - elapsed)? {
                Some(message) => message,
                None => return Err(HandshakeError::Timeout(token.name())),
            };
            if &message.identity != client {
                log::debug!("Ignoring {:?} from {} while shaking hands with {}", describe(&message.payload), message.identity, client);
                continue;
            }
            if token.matches(&message.payload) {
                return Ok(());
            }
            if Token::Ping.matches(&message.payload) {
                log::debug!("Ignoring late heartbeat from {}", client);
                continue;
            }
            return Err(HandshakeError::UnexpectedMessage { expected: token.name(), found: describe(&message.payload) });
        }
    }

    /// Heartbeat in, acknowledgement out. The client enters the registry here.
    pub fn greet(&mut self) -> Result<ClientId, HandshakeError> {
        let client = self.await_ping()?;
        log::info!("Heartbeat from {}", client);
        self.registry.register(&client);
        if let Err(e) = self.transport.send_to(&client, Token::Alive.as_bytes()) {
            self.registry.set_state(&client, ClientState::AwaitingPing);
            return Err(HandshakeError::from(e));
        }
        self.registry.set_state(&client, ClientState::AwaitingConfirm);
        Ok(client)
    }

    /// Wait for the connection confirmation, then send the initialization trigger
    pub fn confirm(&mut self, client: &ClientId) -> Result<(), HandshakeError> {
        self.await_token(client, Token::Connected, self.settings.poll_timeout)?;
        self.registry.set_state(client, ClientState::Connected);
        log::info!("Connection with {} established successfully", client);

        self.transport.send_to(client, Token::Init.as_bytes())?;
        self.registry.set_state(client, ClientState::AwaitingReady);
        Ok(())
    }

    /// Wait for the end of the client bring-up
    pub fn complete(&mut self, client: &ClientId) -> Result<(), HandshakeError> {
        let ready_timeout = self.settings.ready_timeout();
        self.await_token(client, Token::Ready, ready_timeout)?;
        self.registry.set_state(client, ClientState::Ready);
        log::info!("Client {} is ready", client);
        Ok(())
    }

    /// One full attempt. A client that falls out midway goes back to AwaitingPing, as it restarts its
    /// own handshake on failure.
    pub fn attempt(&mut self) -> Result<ClientId, HandshakeError> {
        let client = self.greet()?;
        match self.confirm(&client).and_then(|_| self.complete(&client)) {
            Ok(()) => Ok(client),
            Err(e) => {
                self.registry.set_state(&client, ClientState::AwaitingPing);
                Err(e)
            }
        }
    }

    /// Run one slot: up to max_retries attempts. Clients still waiting when the slot is abandoned are Failed.
    pub fn run_slot(&mut self) -> Option<ClientId> {
        for attempt in 1..=self.settings.max_retries {
            log::info!("Handshake attempt {}/{}", attempt, self.settings.max_retries);
            match self.attempt() {
                Ok(client) => return Some(client),
                Err(e) => log::warn!("Handshake attempt {} failed: {}", attempt, e),
            }
        }
        log::error!("Handshake slot abandoned after {} attempts", self.settings.max_retries);
        for client in self.registry.clients_in(ClientState::AwaitingPing) {
            self.registry.set_state(&client, ClientState::Failed);
        }
        None
    }

    /// Fill num_clients slots. Returns true when that many clients are Ready.
    pub fn accept(&mut self, num_clients: usize) -> bool {
        log::info!("Waiting for {} clients...", num_clients);
        let mut slots = 0;
        while self.registry.ready_count() < num_clients && slots < num_clients {
            self.run_slot();
            slots += 1;
        }
        let ready = self.registry.ready_count();
        if ready >= num_clients {
            log::info!("All {} clients connected successfully", num_clients);
            true
        } else {
            log::error!("Connected clients: {} (expected {})", ready, num_clients);
            false
        }
    }
}

/// Local hardware bring-up a client performs on the initialization trigger
pub trait LocalBringUp {
    fn bring_up(&mut self) -> Result<(), HandshakeError>;
}

/// # ClientHandshake
/// Client half: heartbeat until the server answers, confirm, wait for the trigger, bring the hardware up
/// and report completion. Any failure makes the caller restart from a fresh connection.
pub struct ClientHandshake<'a> {
    transport: &'a mut dyn DealerTransport,
    ping_interval: Duration,
    trigger_timeout: Duration,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(transport: &'a mut dyn DealerTransport, ping_interval: Duration, trigger_timeout: Duration) -> Self {
        Self { transport, ping_interval, trigger_timeout }
    }

    /// Heartbeat on a fixed interval until the server acknowledges. Only transport errors end the loop.
    fn await_alive(&mut self) -> Result<(), HandshakeError> {
        loop {
            self.transport.send(Token::Ping.as_bytes())?;
            log::info!("Ping signal sent");
            match self.transport.recv_timeout(self.ping_interval)? {
                Some(payload) if Token::Alive.matches(&payload) => return Ok(()),
                Some(payload) => log::warn!("Ignoring {:?} while waiting for the server", describe(&payload)),
                None => log::info!("No response from server. Retrying..."),
            }
        }
    }

    pub fn run(&mut self, local: &mut dyn LocalBringUp) -> Result<(), HandshakeError> {
        self.await_alive()?;
        log::info!("Server responded. Connection established");
        self.transport.send(Token::Connected.as_bytes())?;

        match self.transport.recv_timeout(self.trigger_timeout)? {
            Some(payload) if Token::Init.matches(&payload) => (),
            Some(payload) => {
                return Err(HandshakeError::UnexpectedMessage { expected: Token::Init.name(), found: describe(&payload) })
            }
            None => return Err(HandshakeError::Timeout(Token::Init.name())),
        }

        log::info!("Initialization trigger received, bringing up local hardware");
        local.bring_up()?;
        self.transport.send(Token::Ready.as_bytes())?;
        log::info!("Bring-up complete");
        Ok(())
    }
}
