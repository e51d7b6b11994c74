//! A remote peer in the network that downloads and uploads data.
//!
//! A [`Session`] is the protocol state machine of one connection. It never
//! touches the socket nor the piece store: inbound messages are turned into
//! [`SessionEvent`]s for the scheduler, and outbound messages are handed to
//! the connection task through a channel, so sending never blocks.
pub mod connection;
mod types;

pub use types::*;

use std::{net::SocketAddr, time::Duration};

use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::InfoHash,
    store::Layout,
    tcp_wire::{Block, BlockInfo, Handshake, Message},
};

/// Minimum time between two keep-alives.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Session {
    pub addr: SocketAddr,
    /// Unique per connection.
    pub id: u64,
    pub direction: Direction,
    pub remote_id: Option<PeerId>,
    pub state: SessionState,
    /// Pieces the remote is known to have.
    pub pieces: Bitfield,
    pub last_active: Instant,
    last_keep_alive: Option<Instant>,
    /// Blocks we requested from this peer and are still waiting for, one
    /// bitfield of blocks per piece.
    requested: Vec<Bitfield>,
    outstanding: usize,
    pub uploaded: u64,
    pub downloaded: u64,
    info_hash: InfoHash,
    local_id: PeerId,
    layout: Layout,
    tx: mpsc::UnboundedSender<Message>,
}

impl Session {
    pub fn new(
        addr: SocketAddr,
        id: u64,
        direction: Direction,
        info_hash: InfoHash,
        local_id: PeerId,
        layout: Layout,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let requested = (0..layout.piece_count)
            .map(|piece| Bitfield::from_piece(layout.block_count(piece)))
            .collect();

        Self {
            addr,
            id,
            direction,
            remote_id: None,
            state: SessionState::default(),
            pieces: Bitfield::from_piece(layout.piece_count),
            last_active: Instant::now(),
            last_keep_alive: None,
            requested,
            outstanding: 0,
            uploaded: 0,
            downloaded: 0,
            info_hash,
            local_id,
            layout,
            tx,
        }
    }

    /// Apply an inbound message. An error means the session must be
    /// disconnected.
    pub fn handle(
        &mut self,
        msg: Message,
        local: &Bitfield,
    ) -> Result<Option<SessionEvent>, Error> {
        let addr = self.addr;
        self.last_active = Instant::now();

        if !self.state.handshake_received && !matches!(msg, Message::Handshake(_))
        {
            return Err(Error::NoHandshake);
        }

        let event = match msg {
            Message::Handshake(handshake) => {
                debug!("{addr} < handshake {:?}", handshake.peer_id);
                if self.state.handshake_received
                    || !handshake.validate(&self.info_hash)
                {
                    return Err(Error::HandshakeInvalid);
                }
                self.state.handshake_received = true;
                self.remote_id = Some(handshake.peer_id);
                self.send_handshake();
                self.send_bitfield(local);
                Some(SessionEvent::StateChanged)
            }
            Message::KeepAlive => {
                debug!("{addr} < keepalive");
                None
            }
            Message::Choke => {
                debug!("{addr} < choke");
                self.state.choke_received = true;
                // a choking peer drops the requests it didn't answer
                self.clear_all_requests();
                Some(SessionEvent::StateChanged)
            }
            Message::Unchoke => {
                debug!("{addr} < unchoke");
                self.state.choke_received = false;
                Some(SessionEvent::StateChanged)
            }
            Message::Interested => {
                debug!("{addr} < interested");
                self.state.interested_received = true;
                Some(SessionEvent::StateChanged)
            }
            Message::NotInterested => {
                debug!("{addr} < not_interested");
                self.state.interested_received = false;
                Some(SessionEvent::StateChanged)
            }
            Message::Have(piece) => {
                debug!("{addr} < have {piece}");
                if piece as usize >= self.pieces.len() {
                    return Err(Error::PieceOutOfRange(piece));
                }
                self.pieces.set(piece as usize, true);
                Some(SessionEvent::StateChanged)
            }
            Message::Bitfield(bitfield) => {
                debug!(
                    "{addr} < bitfield len: {} ones: {}",
                    bitfield.len(),
                    bitfield.count_ones()
                );
                self.pieces.merge(&bitfield);
                Some(SessionEvent::StateChanged)
            }
            Message::Request(info) => {
                debug!("{addr} < request {info:?}");
                if info.index as usize >= self.layout.piece_count {
                    return Err(Error::PieceOutOfRange(info.index));
                }
                if !info.is_valid() {
                    return Err(Error::RequestInvalid);
                }
                Some(SessionEvent::BlockRequested(info))
            }
            Message::Piece(Block { index, begin, block }) => {
                debug!("{addr} < piece {index} {begin} len: {}", block.len());
                if index as usize >= self.layout.piece_count {
                    return Err(Error::PieceOutOfRange(index));
                }
                if begin % self.layout.block_len != 0 {
                    warn!("{addr} sent a block at unaligned offset {begin}");
                    return Ok(None);
                }
                self.downloaded += block.len() as u64;
                Some(SessionEvent::BlockReceived {
                    piece: index as usize,
                    block: (begin / self.layout.block_len) as usize,
                    data: block,
                })
            }
            Message::Cancel(info) => {
                debug!("{addr} < cancel {info:?}");
                Some(SessionEvent::BlockCancelled(info))
            }
            Message::Port(port) => {
                debug!("{addr} < port {port}");
                None
            }
        };

        Ok(event)
    }

    /// Queue a message for the connection task. If the task is gone the
    /// session is marked disconnected.
    fn send(&mut self, msg: Message) -> bool {
        if self.state.disconnected {
            return false;
        }
        if self.tx.send(msg).is_err() {
            warn!("{} connection is gone, disconnecting", self.addr);
            self.state.disconnected = true;
            return false;
        }
        true
    }

    pub fn send_handshake(&mut self) {
        if self.state.handshake_sent {
            return;
        }
        debug!("{} > handshake", self.addr);
        self.state.handshake_sent = true;
        let handshake =
            Handshake::new(self.info_hash.clone(), self.local_id.clone());
        self.send(Message::Handshake(handshake));
    }

    pub fn send_bitfield(&mut self, local: &Bitfield) {
        if self.state.bitfield_sent {
            return;
        }
        debug!("{} > bitfield ones: {}", self.addr, local.count_ones());
        self.state.bitfield_sent = true;
        self.send(Message::Bitfield(local.clone()));
    }

    /// Only transmitted if the last one is older than
    /// [`KEEP_ALIVE_INTERVAL`].
    pub fn send_keep_alive(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_keep_alive {
            if now.duration_since(last) <= KEEP_ALIVE_INTERVAL {
                return;
            }
        }
        debug!("{} > keepalive", self.addr);
        self.last_keep_alive = Some(now);
        self.send(Message::KeepAlive);
    }

    pub fn send_choke(&mut self) {
        if self.state.choke_sent {
            return;
        }
        debug!("{} > choke", self.addr);
        self.state.choke_sent = true;
        self.send(Message::Choke);
    }

    pub fn send_unchoke(&mut self) {
        if !self.state.choke_sent {
            return;
        }
        info!("{} > unchoke", self.addr);
        self.state.choke_sent = false;
        self.send(Message::Unchoke);
    }

    pub fn send_interested(&mut self) {
        if self.state.interested_sent {
            return;
        }
        debug!("{} > interested", self.addr);
        self.state.interested_sent = true;
        self.send(Message::Interested);
    }

    pub fn send_not_interested(&mut self) {
        if !self.state.interested_sent {
            return;
        }
        debug!("{} > not_interested", self.addr);
        self.state.interested_sent = false;
        self.send(Message::NotInterested);
    }

    pub fn send_have(&mut self, piece: usize) {
        debug!("{} > have {piece}", self.addr);
        self.send(Message::Have(piece as u32));
    }

    /// Request a block and remember it as outstanding.
    pub fn send_request(&mut self, info: BlockInfo) {
        debug!("{} > request {info:?}", self.addr);
        let block = (info.begin / self.layout.block_len) as usize;
        if self.send(Message::Request(info)) {
            self.mark_requested(info.index as usize, block);
        }
    }

    pub fn send_piece(&mut self, block: Block) {
        debug!(
            "{} > piece {} {} len: {}",
            self.addr,
            block.index,
            block.begin,
            block.block.len()
        );
        let len = block.block.len() as u64;
        if self.send(Message::Piece(block)) {
            self.uploaded += len;
        }
    }

    /// Cancel an outstanding request, forgetting it.
    pub fn send_cancel(&mut self, info: BlockInfo) {
        debug!("{} > cancel {info:?}", self.addr);
        let block = (info.begin / self.layout.block_len) as usize;
        self.clear_requested(info.index as usize, block);
        self.send(Message::Cancel(info));
    }

    /// Returns true only the first time, so the owner is notified once.
    pub fn disconnect(&mut self) -> bool {
        if self.state.disconnected {
            return false;
        }
        self.state.disconnected = true;
        true
    }

    pub fn is_requested(&self, piece: usize, block: usize) -> bool {
        self.requested
            .get(piece)
            .and_then(|blocks| blocks.get(block).map(|b| *b))
            .unwrap_or(false)
    }

    /// Amount of requests this peer has not answered yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn mark_requested(&mut self, piece: usize, block: usize) {
        let Some(blocks) = self.requested.get_mut(piece) else { return };
        if block < blocks.len() && !blocks[block] {
            blocks.set(block, true);
            self.outstanding += 1;
        }
    }

    /// Returns true if the block was outstanding.
    pub fn clear_requested(&mut self, piece: usize, block: usize) -> bool {
        let Some(blocks) = self.requested.get_mut(piece) else {
            return false;
        };
        if block < blocks.len() && blocks[block] {
            blocks.set(block, false);
            self.outstanding -= 1;
            return true;
        }
        false
    }

    fn clear_all_requests(&mut self) {
        for blocks in &mut self.requested {
            blocks.fill(false);
        }
        self.outstanding = 0;
    }

    /// The remote has every piece.
    pub fn is_seed(&self) -> bool {
        self.pieces.all()
    }

    /// Pieces the remote has that `local` doesn't.
    pub fn wanted(&self, local: &Bitfield) -> usize {
        self.pieces.missing_from(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::BLOCK_LEN;

    fn layout() -> Layout {
        Layout {
            piece_length: 2 * BLOCK_LEN,
            block_len: BLOCK_LEN,
            total_size: 3 * 2 * BLOCK_LEN as u64,
            piece_count: 3,
        }
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "127.0.0.1:6881".parse().unwrap(),
            0,
            Direction::Inbound,
            InfoHash([1; 20]),
            PeerId([2; 20]),
            layout(),
            tx,
        );
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn handshaken() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (mut session, mut rx) = session();
        let local = Bitfield::from_piece(3);
        let theirs = Handshake::new(InfoHash([1; 20]), PeerId([3; 20]));
        session.handle(Message::Handshake(theirs), &local).unwrap();
        drain(&mut rx);
        (session, rx)
    }

    #[tokio::test]
    async fn handshake_answers_with_handshake_and_bitfield() {
        let (mut session, mut rx) = session();
        let mut local = Bitfield::from_piece(3);
        local.set(1, true);

        let theirs = Handshake::new(InfoHash([1; 20]), PeerId([3; 20]));
        let event =
            session.handle(Message::Handshake(theirs), &local).unwrap();

        assert_eq!(event, Some(SessionEvent::StateChanged));
        assert!(session.state.is_handshaken());
        assert_eq!(session.remote_id, Some(PeerId([3; 20])));

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::Handshake(_)));
        assert_eq!(msgs[1], Message::Bitfield(local.clone()));

        // already sent, nothing goes out again
        session.send_handshake();
        session.send_bitfield(&local);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn handshake_for_other_torrent_is_an_error() {
        let (mut session, mut rx) = session();
        let theirs = Handshake::new(InfoHash([9; 20]), PeerId([3; 20]));
        let local = Bitfield::from_piece(3);
        assert!(session.handle(Message::Handshake(theirs), &local).is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn messages_before_handshake_are_an_error() {
        let (mut session, _rx) = session();
        let local = Bitfield::from_piece(3);
        assert!(session.handle(Message::Unchoke, &local).is_err());
    }

    #[tokio::test]
    async fn senders_are_idempotent() {
        let (mut session, mut rx) = handshaken();

        // peers start choked, choking again is a no-op
        session.send_choke();
        assert!(drain(&mut rx).is_empty());

        session.send_unchoke();
        session.send_unchoke();
        assert_eq!(drain(&mut rx), vec![Message::Unchoke]);
        assert!(!session.state.choke_sent);

        session.send_choke();
        session.send_choke();
        assert_eq!(drain(&mut rx), vec![Message::Choke]);

        session.send_not_interested();
        assert!(drain(&mut rx).is_empty());

        session.send_interested();
        session.send_interested();
        assert_eq!(drain(&mut rx), vec![Message::Interested]);

        session.send_not_interested();
        session.send_not_interested();
        assert_eq!(drain(&mut rx), vec![Message::NotInterested]);
        assert!(!session.state.interested_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_is_spaced() {
        let (mut session, mut rx) = handshaken();

        session.send_keep_alive();
        session.send_keep_alive();
        assert_eq!(drain(&mut rx), vec![Message::KeepAlive]);

        tokio::time::advance(Duration::from_secs(20)).await;
        session.send_keep_alive();
        assert!(drain(&mut rx).is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        session.send_keep_alive();
        assert_eq!(drain(&mut rx), vec![Message::KeepAlive]);
    }

    #[tokio::test]
    async fn have_and_bitfield_only_add_pieces() {
        let (mut session, _rx) = handshaken();
        let local = Bitfield::from_piece(3);

        session.handle(Message::Have(2), &local).unwrap();
        let bitfield = Bitfield::from_wire(vec![0b1000_0000], 3);
        session.handle(Message::Bitfield(bitfield), &local).unwrap();

        assert_eq!(session.pieces.iter_ones().collect::<Vec<_>>(), vec![0, 2]);
        assert!(session.handle(Message::Have(3), &local).is_err());
    }

    #[tokio::test]
    async fn block_events() {
        let (mut session, _rx) = handshaken();
        let local = Bitfield::from_piece(3);

        let info = BlockInfo::new(1, BLOCK_LEN, BLOCK_LEN);
        assert_eq!(
            session.handle(Message::Request(info), &local).unwrap(),
            Some(SessionEvent::BlockRequested(info))
        );
        assert_eq!(
            session.handle(Message::Cancel(info), &local).unwrap(),
            Some(SessionEvent::BlockCancelled(info))
        );

        let block = Block { index: 1, begin: BLOCK_LEN, block: vec![7; 10] };
        assert_eq!(
            session.handle(Message::Piece(block), &local).unwrap(),
            Some(SessionEvent::BlockReceived {
                piece: 1,
                block: 1,
                data: vec![7; 10]
            })
        );
        assert_eq!(session.downloaded, 10);

        // only offsets we could have requested map to a block
        let unaligned = Block { index: 1, begin: 100, block: vec![7; 10] };
        assert_eq!(session.handle(Message::Piece(unaligned), &local).unwrap(), None);
        assert_eq!(session.downloaded, 10);

        let huge = BlockInfo::new(0, 0, 1024 * 1024);
        assert!(session.handle(Message::Request(huge), &local).is_err());
    }

    #[tokio::test]
    async fn requests_are_tracked() {
        let (mut session, mut rx) = handshaken();
        let local = Bitfield::from_piece(3);

        session.send_request(BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN));
        assert!(session.is_requested(0, 1));
        assert_eq!(session.outstanding(), 1);

        session.send_cancel(BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN));
        assert!(!session.is_requested(0, 1));
        assert_eq!(session.outstanding(), 0);

        session.send_request(BlockInfo::new(2, 0, BLOCK_LEN));
        session.handle(Message::Choke, &local).unwrap();
        assert_eq!(session.outstanding(), 0);
        assert!(!session.is_requested(2, 0));

        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn closed_connection_disconnects() {
        let (mut session, rx) = handshaken();
        drop(rx);

        session.send_unchoke();
        assert!(session.state.disconnected);
        // the send failure already counted as the disconnect
        assert!(!session.disconnect());
    }

    #[tokio::test]
    async fn disconnect_notifies_once() {
        let (mut session, _rx) = handshaken();
        assert!(session.disconnect());
        assert!(!session.disconnect());
    }
}
