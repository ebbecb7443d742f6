use std::time::Duration;

use crate::error::DispatchError;
use crate::protocol::{decode, encode, ClientId, Command, Response, ResponseKind};
use crate::transport::RouterTransport;

/// The correlated outcome of one command for one client
#[derive(Debug)]
pub struct Reply {
    pub client: ClientId,
    pub outcome: Result<Response, DispatchError>,
}

impl Reply {
    pub fn response(&self) -> Option<&Response> {
        self.outcome.as_ref().ok()
    }
}

/// # Dispatcher
/// Sequential fan-out: one command to one client, block for that client's reply, then the next client.
/// A reply counts only when it comes from the addressed client and carries the expected tag.
pub struct Dispatcher<'a> {
    transport: &'a mut dyn RouterTransport,
    reply_timeout: Duration,
}

impl<'a> Dispatcher<'a> {
    pub fn new(transport: &'a mut dyn RouterTransport, reply_timeout: Duration) -> Self {
        Self { transport, reply_timeout }
    }

    fn round_trip(&mut self, client: &ClientId, payload: &[u8], expected: ResponseKind) -> Result<Response, DispatchError> {
        self.transport.send_to(client, payload)?;
        let message = self
            .transport
            .recv_timeout(self.reply_timeout)?
            .ok_or_else(|| DispatchError::Timeout(client.clone()))?;
        if &message.identity != client {
            return Err(DispatchError::WrongSender { expected: client.clone(), found: message.identity });
        }
        let response: Response = decode(&message.payload)?;
        if response.kind() != expected {
            return Err(DispatchError::WrongResponse { expected, found: response.kind() });
        }
        Ok(response)
    }

    /// Send command to each client in order. A failing client is logged and does not stop the batch.
    pub fn dispatch(&mut self, clients: &[ClientId], command: &Command) -> Result<Vec<Reply>, DispatchError> {
        let payload = encode(command)?;
        let expected = command.expected_response();
        log::debug!("Dispatching {:?} to {} clients", command, clients.len());

        let mut replies = Vec::with_capacity(clients.len());
        for client in clients {
            let outcome = self.round_trip(client, &payload, expected);
            if let Err(e) = &outcome {
                log::error!("Command {} to client {} failed: {}", expected, client, e);
            }
            replies.push(Reply { client: client.clone(), outcome });
        }
        Ok(replies)
    }
}
