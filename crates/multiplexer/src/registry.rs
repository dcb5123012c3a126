use shared::{domain::ClientId, protocol::ClientEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Handle for one attached client. It only knows how to deliver events; all
/// protocol state lives in the multiplexer.
#[derive(Debug, Clone)]
pub struct ClientEndpoint {
    id: ClientId,
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEndpoint {
    pub fn new(id: ClientId, sender: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { id, sender }
    }

    pub fn channel(id: ClientId) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(id, sender), receiver)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    fn deliver(&self, event: ClientEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Attached clients in attach order, doubling as the broadcaster.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Vec<ClientEndpoint>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the endpoint, replacing a previous endpoint with the same id.
    pub fn attach(&mut self, endpoint: ClientEndpoint) {
        self.clients.retain(|client| client.id != endpoint.id);
        self.clients.push(endpoint);
    }

    pub fn detach(&mut self, id: ClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|client| client.id != id);
        self.clients.len() != before
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.iter().any(|client| client.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn send_to(&mut self, id: ClientId, event: ClientEvent) -> bool {
        let Some(client) = self.clients.iter().find(|client| client.id == id) else {
            debug!(client_id = %id, "mux: dropping event for unknown client");
            return false;
        };
        if client.deliver(event) {
            return true;
        }
        self.prune_dead();
        false
    }

    /// Delivers `event` to every client except `exclude`. Clients whose
    /// receiver is gone are pruned. Returns the number of deliveries.
    pub fn broadcast(&mut self, event: &ClientEvent, exclude: Option<ClientId>) -> usize {
        let mut delivered = 0;
        let mut saw_dead = false;
        for client in &self.clients {
            if Some(client.id) == exclude {
                continue;
            }
            if client.deliver(event.clone()) {
                delivered += 1;
            } else {
                saw_dead = true;
            }
        }
        if saw_dead {
            self.prune_dead();
        }
        delivered
    }

    /// Removes endpoints whose receivers were dropped without a detach.
    pub fn prune_dead(&mut self) -> Vec<ClientId> {
        let mut pruned = Vec::new();
        self.clients.retain(|client| {
            let alive = client.is_alive();
            if !alive {
                pruned.push(client.id);
            }
            alive
        });
        for id in &pruned {
            info!(client_id = %id, "mux: pruned client with closed receiver");
        }
        pruned
    }
}
