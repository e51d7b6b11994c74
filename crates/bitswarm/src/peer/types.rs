use std::{fmt::Display, net::SocketAddr};

use rand::Rng;
use speedy::{Readable, Writable};
use tokio::sync::mpsc;

use crate::tcp_wire::{BlockInfo, Message};

/// Identifies a client in the swarm, sent on the handshake.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// 20 random ascii digits.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut id = [0u8; 20];
        for byte in &mut id {
            *byte = b'0' + rng.gen_range(0..10);
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Protocol state of a session, each flag is independent of the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub handshake_sent: bool,
    pub handshake_received: bool,
    pub bitfield_sent: bool,

    /// If we're choking, we don't serve the peer.
    pub choke_sent: bool,

    /// If the peer is choking us, it doesn't serve us.
    pub choke_received: bool,

    /// We want pieces the peer has.
    pub interested_sent: bool,

    /// The peer wants pieces we have.
    pub interested_received: bool,

    pub disconnected: bool,
}

impl Default for SessionState {
    /// Both sides of the connection start off as choked and not interested
    /// in the other.
    fn default() -> Self {
        Self {
            handshake_sent: false,
            handshake_received: false,
            bitfield_sent: false,
            choke_sent: true,
            choke_received: true,
            interested_sent: false,
            interested_received: false,
            disconnected: false,
        }
    }
}

impl SessionState {
    pub fn is_handshaken(&self) -> bool {
        self.handshake_sent && self.handshake_received
    }
}

/// What a [`super::Session`] makes of an inbound message, for the scheduler
/// to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A flag or the known pieces of the peer changed.
    StateChanged,
    BlockRequested(BlockInfo),
    BlockReceived { piece: usize, block: usize, data: Vec<u8> },
    BlockCancelled(BlockInfo),
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Sent by connection tasks to the scheduler. `id` tells apart two
/// connections that ever used the same address.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        addr: SocketAddr,
        id: u64,
        direction: Direction,
        tx: mpsc::UnboundedSender<Message>,
    },
    Message {
        addr: SocketAddr,
        id: u64,
        msg: Message,
    },
    Disconnected {
        addr: SocketAddr,
        id: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_is_digits() {
        let id = PeerId::generate();
        assert!(id.0.iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn peers_start_choked() {
        let state = SessionState::default();
        assert!(state.choke_sent);
        assert!(state.choke_received);
        assert!(!state.interested_sent);
        assert!(!state.is_handshaken());
    }
}
