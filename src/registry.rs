use std::fmt::Display;

use crate::protocol::ClientId;

/// Lifecycle of a client connection as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    AwaitingPing,
    Alive,
    AwaitingConfirm,
    Connected,
    AwaitingReady,
    Ready,
    Failed,
}

impl Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientEntry {
    id: ClientId,
    state: ClientState,
}

/// # ClientRegistry
/// Every client heard from since the last shutdown, in order of first heartbeat. Fan-out walks
/// the Ready clients in this order.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Vec<ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat from id, which makes it Alive. A client reconnecting keeps its original position.
    pub fn register(&mut self, id: &ClientId) {
        match self.clients.iter_mut().find(|entry| &entry.id == id) {
            Some(entry) => entry.state = ClientState::Alive,
            None => {
                self.clients.push(ClientEntry { id: id.clone(), state: ClientState::Alive });
                log::info!("Registered client {}", id);
            }
        }
    }

    pub fn set_state(&mut self, id: &ClientId, state: ClientState) {
        if let Some(entry) = self.clients.iter_mut().find(|entry| &entry.id == id) {
            log::debug!("Client {}: {} -> {}", id, entry.state, state);
            entry.state = state;
        }
    }

    pub fn state(&self, id: &ClientId) -> ClientState {
        self.clients
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| entry.state)
            .unwrap_or(ClientState::Disconnected)
    }

    pub fn ready_clients(&self) -> Vec<ClientId> {
        self.clients_in(ClientState::Ready)
    }

    pub fn ready_count(&self) -> usize {
        self.clients.iter().filter(|entry| entry.state == ClientState::Ready).count()
    }

    pub fn clients_in(&self, state: ClientState) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_clients_keep_registration_order() {
        let mut registry = ClientRegistry::new();
        let (a, b, c) = (ClientId::from("a"), ClientId::from("b"), ClientId::from("c"));
        registry.register(&b);
        registry.register(&a);
        registry.register(&c);
        registry.set_state(&a, ClientState::Ready);
        registry.set_state(&b, ClientState::Ready);
        registry.set_state(&c, ClientState::Failed);

        assert_eq!(registry.ready_clients(), vec![b.clone(), a.clone()]);
        assert_eq!(registry.ready_count(), 2);

        //a heartbeat from a Ready client means it restarted
        registry.register(&b);
        assert_eq!(registry.state(&b), ClientState::Alive);
        assert_eq!(registry.ready_clients(), vec![a.clone()]);
        assert_eq!(registry.clients_in(ClientState::Failed), vec![c.clone()]);
        assert_eq!(registry.len(), 3);

        registry.clear();
        assert_eq!(registry.state(&a), ClientState::Disconnected);
        assert!(registry.is_empty());
    }
}
