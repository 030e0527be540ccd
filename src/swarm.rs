use std::{collections::HashMap, net::SocketAddr};
use crate::{
    wire::{PeerCommand, PeerHandle},
    PeerId,
};

/// Per-torrent index of active peer sessions with the bad-peer book.
#[derive(Debug, Default)]
pub struct Swarm {

    peers: HashMap<SocketAddr, PeerHandle>,

    // Handshaken sessions by peer id, for duplicate detection.
    by_id: HashMap<PeerId, SocketAddr>,

    // Peers that violated the protocol; reconnects are refused.
    bad: HashMap<SocketAddr, Option<PeerId>>,

}

impl Swarm {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.peers.contains_key(address)
    }

    pub fn is_bad(&self, address: &SocketAddr) -> bool {
        self.bad.contains_key(address)
    }

    pub fn insert(&mut self, address: SocketAddr, handle: PeerHandle) {
        self.peers.insert(address, handle);
    }

    pub fn get_mut(&mut self, address: &SocketAddr) -> Option<&mut PeerHandle> {
        self.peers.get_mut(address)
    }

    /// Records the peer id a session learned in its handshake. Returns
    /// false when another live session already owns the id; such a
    /// second connection is to be closed.
    pub fn register_id(&mut self, address: SocketAddr, id: PeerId) -> bool {
        match self.by_id.get(&id) {
            Some(existing) if *existing != address && self.peers.contains_key(existing) => false,
            _ => {
                self.by_id.insert(id, address);
                if let Some(handle) = self.peers.get_mut(&address) {
                    handle.id = Some(id);
                }
                true
            }
        }
    }

    pub fn remove(&mut self, address: &SocketAddr) -> Option<PeerHandle> {
        let handle = self.peers.remove(address)?;
        if let Some(id) = handle.id {
            if self.by_id.get(&id) == Some(address) {
                self.by_id.remove(&id);
            }
        }
        Some(handle)
    }

    // Fire-and-forget hint for the reconnect policy.
    pub fn enter_bad(&mut self, address: SocketAddr, id: Option<PeerId>) {
        tracing::info!("marking peer {} as bad", address);
        self.bad.insert(address, id);
    }

    pub fn send_to(&self, address: &SocketAddr, cmd: PeerCommand) -> bool {
        match self.peers.get(address) {
            Some(handle) => handle.peer_tx.send(cmd).is_ok(),
            None => false,
        }
    }

    // Each session decides for itself whether the peer needs the have.
    pub fn broadcast_have(&self, idx: usize) {
        for handle in self.peers.values() {
            handle.peer_tx.send(PeerCommand::PieceStored(idx)).ok();
        }
    }

    pub fn shutdown_all(&self) {
        for handle in self.peers.values() {
            handle.peer_tx.send(PeerCommand::Shutdown).ok();
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (SocketAddr, PeerHandle)> + '_ {
        self.by_id.clear();
        self.peers.drain()
    }

    pub fn states(&self) -> impl Iterator<Item = &crate::wire::state::SessionState> {
        self.peers.values().map(|handle| &handle.state)
    }
}
