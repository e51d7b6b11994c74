//! The scheduler owns every piece of mutable swarm state: the sessions, the
//! piece store, the upload and delivery queues and the throttles.
//!
//! Connection tasks only forward [`PeerEvent`]s into its inbox. Events are
//! handled in memory and raise flags, after each batch of events (or timer
//! tick) every flagged pass runs once. A pass runs to completion before the
//! inbox is polled again, so it can't overlap itself, and any number of
//! triggers that arrive while it runs collapse into a single next run.
mod ranking;

use std::{collections::VecDeque, mem, net::SocketAddr};

use hashbrown::{HashMap, HashSet};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::Bitfield,
    config::Config,
    error::Error,
    metainfo::InfoHash,
    peer::{connection, Direction, PeerEvent, PeerId, Session, SessionEvent},
    storage::Storage,
    store::{PieceStore, VerifyOutcome},
    tcp_wire::{Block, BlockInfo, PeerCodec},
    throttle::Throttle,
    utils::{to_human_rate, to_human_readable},
};

/// Messages that the scheduler receives.
#[derive(Debug)]
pub enum SchedulerMsg {
    Peer(PeerEvent),
    /// Connect to these endpoints, the ones we already know are ignored.
    AddPeers(Vec<SocketAddr>),
    Stats(oneshot::Sender<Stats>),
    /// Disconnect every session and stop the loop.
    Quit,
}

/// Counters reported to the tracker and to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub uploaded: u64,
    /// Exact size of the verified pieces.
    pub downloaded: u64,
    pub left: u64,
    pub verified: usize,
    pub pieces: usize,
    pub peers: usize,
}

/// A block a peer asked us for.
#[derive(Debug)]
struct UploadRequest {
    addr: SocketAddr,
    info: BlockInfo,
    cancelled: bool,
}

/// A block a peer sent us, waiting to be persisted.
#[derive(Debug)]
struct Delivery {
    addr: SocketAddr,
    piece: usize,
    block: usize,
    data: Vec<u8>,
}

/// Passes that were triggered since they last ran.
#[derive(Debug, Default)]
struct Pending {
    peers: bool,
    uploads: bool,
    downloads: bool,
}

pub struct Scheduler<S> {
    info_hash: InfoHash,
    local_id: PeerId,
    store: PieceStore<S>,
    sessions: HashMap<SocketAddr, Session>,
    /// Outbound connections that are not established yet.
    connecting: HashSet<SocketAddr>,
    /// Peers we download from.
    active: HashSet<SocketAddr>,
    uploads: VecDeque<UploadRequest>,
    deliveries: VecDeque<Delivery>,
    upload_throttle: Throttle,
    download_throttle: Throttle,
    uploaded: u64,
    pending: Pending,
    config: Config,
    started_at: Instant,
    rng: StdRng,
    tx: mpsc::Sender<SchedulerMsg>,
    rx: mpsc::Receiver<SchedulerMsg>,
}

impl<S: Storage> Scheduler<S> {
    pub fn new(
        config: &Config,
        info_hash: InfoHash,
        local_id: PeerId,
        store: PieceStore<S>,
    ) -> (Self, mpsc::Sender<SchedulerMsg>) {
        let (tx, rx) = mpsc::channel::<SchedulerMsg>(1024);

        let scheduler = Self {
            info_hash,
            local_id,
            store,
            sessions: HashMap::new(),
            connecting: HashSet::new(),
            active: HashSet::new(),
            uploads: VecDeque::new(),
            deliveries: VecDeque::new(),
            upload_throttle: Throttle::new(
                config.max_upload_rate,
                Config::RATE_WINDOW,
            ),
            download_throttle: Throttle::new(
                config.max_download_rate,
                Config::RATE_WINDOW,
            ),
            uploaded: 0,
            pending: Pending::default(),
            config: config.clone(),
            started_at: Instant::now(),
            rng: StdRng::from_entropy(),
            tx: tx.clone(),
            rx,
        };

        (scheduler, tx)
    }

    /// Run the event loop until [`SchedulerMsg::Quit`].
    pub async fn run(mut self) -> Result<(), Error> {
        let period = self.config.pass_interval();

        let mut peers_tick = interval(period);
        let mut uploads_tick = interval(period);
        let mut downloads_tick = interval(period);
        for tick in [&mut peers_tick, &mut uploads_tick, &mut downloads_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        'outer: loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if !self.handle(msg) {
                        break;
                    }
                    // fold whatever else is already queued into this batch
                    while let Ok(msg) = self.rx.try_recv() {
                        if !self.handle(msg) {
                            break 'outer;
                        }
                    }
                }
                _ = peers_tick.tick() => self.pending.peers = true,
                _ = uploads_tick.tick() => self.pending.uploads = true,
                _ = downloads_tick.tick() => self.pending.downloads = true,
            }

            self.run_pending().await;
        }

        self.shutdown();
        Ok(())
    }

    /// Returns false when the loop must stop.
    fn handle(&mut self, msg: SchedulerMsg) -> bool {
        match msg {
            SchedulerMsg::Peer(event) => self.handle_peer_event(event),
            SchedulerMsg::AddPeers(addrs) => self.add_peers(addrs),
            SchedulerMsg::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
            SchedulerMsg::Quit => return false,
        }
        true
    }

    /// Run each pass that was triggered, once.
    async fn run_pending(&mut self) {
        if mem::take(&mut self.pending.downloads) {
            self.download_pass().await;
        }
        if mem::take(&mut self.pending.uploads) {
            self.upload_pass().await;
        }
        if mem::take(&mut self.pending.peers) {
            self.peer_pass();
        }
        self.reap();
    }

    pub fn stats(&self) -> Stats {
        Stats {
            uploaded: self.uploaded,
            downloaded: self.store.downloaded(),
            left: self.store.left(),
            verified: self.store.verified_count(),
            pieces: self.store.layout().piece_count,
            peers: self.sessions.len(),
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, id, direction, tx } => {
                self.connecting.remove(&addr);

                if self.sessions.contains_key(&addr) {
                    // dropping `tx` ends the connection task
                    debug!("{addr} is already connected, dropping the new one");
                    return;
                }

                let mut session = Session::new(
                    addr,
                    id,
                    direction,
                    self.info_hash.clone(),
                    self.local_id.clone(),
                    *self.store.layout(),
                    tx,
                );
                if direction == Direction::Outbound {
                    session.send_handshake();
                }

                info!("{addr} connected {direction:?}");
                self.sessions.insert(addr, session);
                self.pending.peers = true;
            }
            PeerEvent::Message { addr, id, msg } => {
                let Some(session) =
                    self.sessions.get_mut(&addr).filter(|s| s.id == id)
                else {
                    return;
                };

                match session.handle(msg, self.store.bitfield()) {
                    Ok(Some(event)) => self.handle_session_event(addr, event),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("{addr} {e}, disconnecting");
                        self.disconnect(addr);
                    }
                }
            }
            PeerEvent::Disconnected { addr, id } => {
                self.connecting.remove(&addr);
                // a late event of an older connection to the same address
                // must not take down the current one
                if self.sessions.get(&addr).is_some_and(|s| s.id == id) {
                    self.disconnect(addr);
                }
            }
        }
    }

    fn handle_session_event(&mut self, addr: SocketAddr, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged => {
                if self.sessions.get(&addr).is_some_and(|s| s.state.choke_received)
                {
                    self.active.remove(&addr);
                }
                self.pending.peers = true;
            }
            SessionEvent::BlockRequested(info) => {
                self.uploads.push_back(UploadRequest {
                    addr,
                    info,
                    cancelled: false,
                });
                self.pending.uploads = true;
            }
            SessionEvent::BlockCancelled(info) => {
                for request in self
                    .uploads
                    .iter_mut()
                    .filter(|r| r.addr == addr && r.info == info)
                {
                    request.cancelled = true;
                }
                self.pending.uploads = true;
            }
            SessionEvent::BlockReceived { piece, block, data } => {
                self.on_block_received(addr, piece, block, data);
            }
        }
    }

    /// Forget the request, cancel it on every other peer that was asked for
    /// the same block and queue the data for the download pass.
    fn on_block_received(
        &mut self,
        addr: SocketAddr,
        piece: usize,
        block: usize,
        data: Vec<u8>,
    ) {
        let layout = *self.store.layout();

        if let Some(session) = self.sessions.get_mut(&addr) {
            session.clear_requested(piece, block);
        }

        if block >= layout.block_count(piece)
            || data.len() != layout.block_size(piece, block) as usize
        {
            warn!("{addr} sent a block that doesn't fit piece {piece}");
            return;
        }

        let info = BlockInfo::new(
            piece as u32,
            block as u32 * layout.block_len,
            layout.block_size(piece, block),
        );
        for (other, session) in self.sessions.iter_mut() {
            if *other != addr && session.is_requested(piece, block) {
                session.send_cancel(info);
            }
        }

        self.deliveries.push_back(Delivery { addr, piece, block, data });
        self.pending.downloads = true;
    }

    fn add_peers(&mut self, addrs: Vec<SocketAddr>) {
        let layout = *self.store.layout();

        for addr in addrs {
            if self.sessions.contains_key(&addr) || self.connecting.contains(&addr)
            {
                continue;
            }
            debug!("{addr} connecting");
            self.connecting.insert(addr);

            let codec = PeerCodec::new(layout.piece_count, layout.block_len);
            let inbox = self.tx.clone();
            tokio::spawn(connection::connect(
                addr,
                connection::next_id(),
                codec,
                inbox,
            ));
        }
    }

    /// Remove a session, it is fine to call this more than once.
    fn disconnect(&mut self, addr: SocketAddr) {
        let Some(mut session) = self.sessions.remove(&addr) else {
            return;
        };
        session.disconnect();
        self.active.remove(&addr);
        self.uploads.retain(|r| r.addr != addr);

        info!(
            "{addr} disconnected, uploaded {} downloaded {}",
            to_human_readable(session.uploaded),
            to_human_readable(session.downloaded),
        );

        // its outstanding requests can go to other peers now
        self.pending.downloads = true;
    }

    /// Remove sessions whose connection went away during a pass.
    fn reap(&mut self) {
        let dead: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state.disconnected)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in dead {
            self.disconnect(addr);
        }
    }

    fn shutdown(&mut self) {
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.disconnect(addr);
        }
        self.uploads.clear();
        self.deliveries.clear();
        info!("scheduler stopped");
    }

    /// Keep the sessions alive, drop the useless ones and decide who we
    /// serve and who we download from.
    fn peer_pass(&mut self) {
        let complete = self.store.is_complete();
        let started = self.store.is_started();
        let timeout = self.config.peer_timeout();
        let now = Instant::now();

        let local = self.store.bitfield();
        let mut order: Vec<(SocketAddr, usize)> = self
            .sessions
            .iter()
            .map(|(addr, s)| (*addr, s.wanted(local)))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1));

        for (addr, _) in order {
            let unchoked =
                self.sessions.values().filter(|s| !s.state.choke_sent).count();
            let downloading = self.active.len();

            let Some(session) = self.sessions.get_mut(&addr) else { continue };

            if now.duration_since(session.last_active) > timeout {
                info!("{addr} timed out");
                session.disconnect();
                continue;
            }

            if !session.state.is_handshaken() {
                continue;
            }

            if complete {
                session.send_not_interested();
            } else {
                session.send_interested();
            }

            if complete && session.is_seed() {
                debug!("{addr} is a seeder and so are we, disconnecting");
                session.disconnect();
                continue;
            }

            session.send_keep_alive();

            if started
                && unchoked < self.config.max_leechers
                && session.state.interested_received
                && session.state.choke_sent
            {
                session.send_unchoke();
            }

            if !complete
                && downloading < self.config.max_seeders
                && !session.state.choke_received
            {
                self.active.insert(addr);
            }
        }
    }

    /// Serve queued requests while the upload budget allows it.
    async fn upload_pass(&mut self) {
        while !self.upload_throttle.is_throttled() {
            let Some(request) = self.uploads.pop_front() else { break };
            if request.cancelled {
                continue;
            }

            let UploadRequest { addr, info, .. } = request;
            let piece = info.index as usize;

            if !self.store.is_verified(piece) {
                debug!("{addr} asked for piece {piece} which we don't have");
                continue;
            }

            let data = match self.store.read_block(piece, info.begin, info.len).await
            {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!("{addr} asked for {info:?} which can't be read");
                    continue;
                }
                Err(e) => {
                    warn!("could not read {info:?}: {e}");
                    continue;
                }
            };

            let Some(session) = self.sessions.get_mut(&addr) else { continue };
            let len = data.len() as u64;
            session.send_piece(Block {
                index: info.index,
                begin: info.begin,
                block: data,
            });
            self.upload_throttle.add(len);
            self.uploaded += len;
        }
    }

    /// Persist the received blocks, then request more from the peers we
    /// download from, rarest pieces first.
    async fn download_pass(&mut self) {
        while let Some(Delivery { addr, piece, block, data }) =
            self.deliveries.pop_front()
        {
            if self.store.is_verified(piece) {
                continue;
            }
            match self.store.write_block(piece, block, &data).await {
                Ok(VerifyOutcome::Verified) => self.on_piece_verified(piece),
                Ok(VerifyOutcome::Reset) => {
                    warn!("{addr} piece {piece} failed verification");
                }
                Ok(_) => {}
                Err(e) => warn!("could not write block {block} of {piece}: {e}"),
            }
        }

        if self.store.is_complete() {
            return;
        }

        let layout = *self.store.layout();

        let ranked = {
            let peers: Vec<&Bitfield> =
                self.sessions.values().map(|s| &s.pieces).collect();
            let store = &self.store;
            let candidates = (0..layout.piece_count)
                .filter(|piece| !store.is_verified(*piece))
                .map(|piece| (piece, store.progress(piece)));
            ranking::rank_pieces(candidates, &peers, &mut self.rng)
        };

        let mut seeders: Vec<SocketAddr> = self.active.iter().copied().collect();

        for piece in ranked {
            if self.download_throttle.is_throttled() {
                break;
            }
            if self.store.is_verified(piece) {
                continue;
            }

            seeders.shuffle(&mut self.rng);

            for addr in &seeders {
                let Some(session) = self.sessions.get(addr) else { continue };
                // one outstanding request per peer
                if !session.pieces[piece] || session.outstanding() > 0 {
                    continue;
                }

                let block = (0..layout.block_count(piece)).find(|block| {
                    !self.store.is_acquired(piece, *block)
                        && !self
                            .sessions
                            .values()
                            .any(|s| s.is_requested(piece, *block))
                });
                let Some(block) = block else { break };

                if self.download_throttle.is_throttled() {
                    break;
                }

                let size = layout.block_size(piece, block);
                let info =
                    BlockInfo::new(piece as u32, block as u32 * layout.block_len, size);

                if let Some(session) = self.sessions.get_mut(addr) {
                    session.send_request(info);
                    self.download_throttle.add(size as u64);
                }
            }
        }
    }

    fn on_piece_verified(&mut self, piece: usize) {
        for session in self.sessions.values_mut() {
            if session.state.is_handshaken() {
                session.send_have(piece);
            }
        }

        let stats = self.stats();
        let elapsed = self.started_at.elapsed().as_secs_f64();
        info!(
            "piece {piece} verified, {}/{} pieces, {} left, down {} up {}",
            stats.verified,
            stats.pieces,
            to_human_readable(stats.left),
            to_human_rate(stats.downloaded, elapsed),
            to_human_rate(stats.uploaded, elapsed),
        );

        if self.store.is_complete() {
            info!("download complete");
        }

        self.pending.peers = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sha1_smol::Sha1;
    use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};

    use super::*;
    use crate::{
        bitfield::BitfieldExt,
        metainfo::Info,
        storage::MemoryStorage,
        tcp_wire::{Handshake, Message},
    };

    const CONTENT: [u8; 4] = [1, 2, 3, 4];

    /// Two pieces of two bytes, blocks of one byte.
    fn info() -> Info {
        let mut pieces = Vec::new();
        for chunk in CONTENT.chunks(2) {
            pieces.extend_from_slice(&Sha1::from(chunk).digest().bytes());
        }
        Info {
            piece_length: 2,
            pieces,
            name: "f".into(),
            length: Some(CONTENT.len() as u64),
            files: None,
            private: false,
        }
    }

    async fn scheduler(
        seeded: bool,
        config: Config,
    ) -> Scheduler<MemoryStorage> {
        let info = info();
        let storage = if seeded {
            MemoryStorage::with_content(info.file_layout(), &CONTENT)
        } else {
            MemoryStorage::new(info.file_layout())
        };
        let mut store = PieceStore::new(&info, 1, storage);
        store.verify_all().await.unwrap();

        let config = Config { block_len: 1, ..config };
        let (scheduler, _tx) = Scheduler::new(
            &config,
            info.info_hash().unwrap(),
            PeerId([0; 20]),
            store,
        );
        scheduler
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn message(s: &mut Scheduler<MemoryStorage>, port: u16, msg: Message) {
        let event = PeerEvent::Message { addr: addr(port), id: port as u64, msg };
        s.handle(SchedulerMsg::Peer(event));
    }

    /// Connect a peer and complete the handshake, the messages the
    /// scheduler sent during the handshake are discarded.
    fn connect(
        s: &mut Scheduler<MemoryStorage>,
        port: u16,
    ) -> UnboundedReceiver<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.handle(SchedulerMsg::Peer(PeerEvent::Connected {
            addr: addr(port),
            id: port as u64,
            direction: Direction::Inbound,
            tx,
        }));
        let handshake = Handshake::new(s.info_hash.clone(), PeerId([port as u8; 20]));
        message(s, port, Message::Handshake(handshake));
        drain(&mut rx);
        rx
    }

    fn have(pieces: &[usize]) -> Message {
        let mut bitfield = Bitfield::from_piece(2);
        for piece in pieces {
            bitfield.set(*piece, true);
        }
        Message::Bitfield(bitfield)
    }

    fn requests(msgs: &[Message]) -> Vec<BlockInfo> {
        msgs.iter()
            .filter_map(|msg| match msg {
                Message::Request(info) => Some(*info),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn each_peer_is_asked_for_the_piece_it_has() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);
        let mut b = connect(&mut s, 2);

        message(&mut s, 1, have(&[0]));
        message(&mut s, 2, have(&[1]));
        message(&mut s, 1, Message::Unchoke);
        message(&mut s, 2, Message::Unchoke);

        s.peer_pass();
        assert_eq!(s.active.len(), 2);
        assert!(drain(&mut a).contains(&Message::Interested));
        assert!(drain(&mut b).contains(&Message::Interested));

        s.download_pass().await;
        assert_eq!(requests(&drain(&mut a)), vec![BlockInfo::new(0, 0, 1)]);
        assert_eq!(requests(&drain(&mut b)), vec![BlockInfo::new(1, 0, 1)]);

        // nothing else goes out while the requests are outstanding
        s.download_pass().await;
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());

        let block = Block { index: 0, begin: 0, block: vec![1] };
        message(&mut s, 1, Message::Piece(block));
        s.download_pass().await;

        assert!(s.store.is_acquired(0, 0));
        // the acquired block is never asked for again
        assert_eq!(requests(&drain(&mut a)), vec![BlockInfo::new(0, 1, 1)]);

        let block = Block { index: 0, begin: 1, block: vec![2] };
        message(&mut s, 1, Message::Piece(block));
        s.download_pass().await;

        assert!(s.store.is_verified(0));
        assert!(drain(&mut a).contains(&Message::Have(0)));
        assert!(drain(&mut b).contains(&Message::Have(0)));
    }

    #[tokio::test]
    async fn a_block_goes_to_a_single_peer() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);
        let mut b = connect(&mut s, 2);

        message(&mut s, 1, have(&[0]));
        message(&mut s, 2, have(&[0]));
        message(&mut s, 1, Message::Unchoke);
        message(&mut s, 2, Message::Unchoke);
        s.peer_pass();
        s.download_pass().await;

        let mut asked = requests(&drain(&mut a));
        asked.extend(requests(&drain(&mut b)));
        asked.sort_by_key(|info| info.begin);

        assert_eq!(asked, vec![BlockInfo::new(0, 0, 1), BlockInfo::new(0, 1, 1)]);
    }

    #[tokio::test]
    async fn received_block_is_cancelled_on_other_peers() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);
        let mut b = connect(&mut s, 2);

        let info = BlockInfo::new(1, 0, 1);
        s.sessions.get_mut(&addr(1)).unwrap().send_request(info);
        s.sessions.get_mut(&addr(2)).unwrap().send_request(info);
        drain(&mut a);
        drain(&mut b);

        let block = Block { index: 1, begin: 0, block: vec![3] };
        message(&mut s, 1, Message::Piece(block));

        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![Message::Cancel(info)]);
        assert!(!s.sessions[&addr(1)].is_requested(1, 0));
        assert!(!s.sessions[&addr(2)].is_requested(1, 0));
        assert_eq!(s.deliveries.len(), 1);
    }

    #[tokio::test]
    async fn serves_interested_peers() {
        let mut s = scheduler(true, Config::default()).await;
        let mut a = connect(&mut s, 1);

        message(&mut s, 1, Message::Interested);
        s.peer_pass();
        assert!(drain(&mut a).contains(&Message::Unchoke));

        message(&mut s, 1, Message::Request(BlockInfo::new(1, 1, 1)));
        message(&mut s, 1, Message::Request(BlockInfo::new(0, 0, 1)));
        message(&mut s, 1, Message::Cancel(BlockInfo::new(0, 0, 1)));
        // past the end of the piece
        message(&mut s, 1, Message::Request(BlockInfo::new(1, 1, 5)));
        s.upload_pass().await;

        let block = Block { index: 1, begin: 1, block: vec![4] };
        assert_eq!(drain(&mut a), vec![Message::Piece(block)]);
        assert!(s.uploads.is_empty());
        assert_eq!(s.stats().uploaded, 1);
    }

    #[tokio::test]
    async fn unverified_pieces_are_not_served() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);

        message(&mut s, 1, Message::Request(BlockInfo::new(0, 0, 1)));
        s.upload_pass().await;

        assert!(drain(&mut a).is_empty());
        assert!(s.uploads.is_empty());
    }

    #[tokio::test]
    async fn upload_stops_when_throttled() {
        let config = Config { max_upload_rate: 1, ..Config::default() };
        let mut s = scheduler(true, config).await;
        let mut a = connect(&mut s, 1);

        message(&mut s, 1, Message::Request(BlockInfo::new(0, 0, 1)));
        message(&mut s, 1, Message::Request(BlockInfo::new(0, 1, 1)));
        s.upload_pass().await;

        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(s.uploads.len(), 1);
    }

    #[tokio::test]
    async fn peers_are_not_unchoked_before_we_have_anything() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);

        message(&mut s, 1, Message::Interested);
        s.peer_pass();

        assert!(!drain(&mut a).contains(&Message::Unchoke));
    }

    #[tokio::test]
    async fn unchoke_is_capped() {
        let config = Config { max_leechers: 1, ..Config::default() };
        let mut s = scheduler(true, config).await;
        let mut a = connect(&mut s, 1);
        let mut b = connect(&mut s, 2);

        message(&mut s, 1, Message::Interested);
        message(&mut s, 2, Message::Interested);
        s.peer_pass();

        let unchoked = [drain(&mut a), drain(&mut b)]
            .iter()
            .filter(|msgs| msgs.contains(&Message::Unchoke))
            .count();
        assert_eq!(unchoked, 1);
    }

    #[tokio::test]
    async fn two_seeders_part_ways() {
        let mut s = scheduler(true, Config::default()).await;
        let _a = connect(&mut s, 1);

        message(&mut s, 1, have(&[0, 1]));
        s.peer_pass();
        s.reap();

        assert!(s.sessions.is_empty());
    }

    #[tokio::test]
    async fn choking_peer_leaves_the_active_set() {
        let mut s = scheduler(false, Config::default()).await;
        let _a = connect(&mut s, 1);

        message(&mut s, 1, Message::Unchoke);
        s.peer_pass();
        assert!(s.active.contains(&addr(1)));

        message(&mut s, 1, Message::Choke);
        assert!(s.active.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_peers_time_out() {
        let mut s = scheduler(false, Config::default()).await;
        let mut a = connect(&mut s, 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        s.peer_pass();
        s.reap();
        assert_eq!(s.sessions.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        s.peer_pass();
        s.reap();
        assert!(s.sessions.is_empty());

        // the session, and with it the sender, is gone
        drain(&mut a);
        assert_eq!(a.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test]
    async fn duplicate_and_stale_connections() {
        let mut s = scheduler(false, Config::default()).await;
        let _a = connect(&mut s, 1);

        let (tx, mut dup) = mpsc::unbounded_channel();
        s.handle(SchedulerMsg::Peer(PeerEvent::Connected {
            addr: addr(1),
            id: 99,
            direction: Direction::Outbound,
            tx,
        }));
        // the second connection is dropped without a handshake
        assert_eq!(dup.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(s.sessions[&addr(1)].id, 1);

        // its disconnect doesn't take down the first one
        s.handle(SchedulerMsg::Peer(PeerEvent::Disconnected { addr: addr(1), id: 99 }));
        assert_eq!(s.sessions.len(), 1);

        s.handle(SchedulerMsg::Peer(PeerEvent::Disconnected { addr: addr(1), id: 1 }));
        s.handle(SchedulerMsg::Peer(PeerEvent::Disconnected { addr: addr(1), id: 1 }));
        assert!(s.sessions.is_empty());
    }

    #[tokio::test]
    async fn protocol_error_disconnects() {
        let mut s = scheduler(false, Config::default()).await;
        let _a = connect(&mut s, 1);

        message(&mut s, 1, Message::Request(BlockInfo::new(0, 0, 1)));
        message(&mut s, 1, Message::Have(7));

        assert!(s.sessions.is_empty());
        // its queued requests went with it
        assert!(s.uploads.is_empty());
    }

    #[tokio::test]
    async fn outbound_connections_send_the_handshake_first() {
        let mut s = scheduler(false, Config::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.handle(SchedulerMsg::Peer(PeerEvent::Connected {
            addr: addr(1),
            id: 1,
            direction: Direction::Outbound,
            tx,
        }));

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], Message::Handshake(_)));
    }

    #[tokio::test]
    async fn stats_and_quit_through_the_inbox() {
        let s = scheduler(false, Config::default()).await;
        let tx = s.tx.clone();
        let handle = tokio::spawn(s.run());

        let (otx, orx) = oneshot::channel();
        tx.send(SchedulerMsg::Stats(otx)).await.unwrap();
        let stats = orx.await.unwrap();
        assert_eq!(
            stats,
            Stats { left: 4, pieces: 2, ..Stats::default() }
        );

        tx.send(SchedulerMsg::Quit).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
