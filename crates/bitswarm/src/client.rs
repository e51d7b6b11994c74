//! The client is the most high-level API of the library, it shares one
//! torrent with the swarm.
//!
//! Starting a client spawns three long-running tasks: the listener
//! accepting inbound connections, the tracker loop and the scheduler. They
//! are controlled through a [`ClientCtx`].
use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Error,
    metainfo::{InfoHash, MetaInfo},
    peer::{connection, Direction, PeerId},
    scheduler::{Scheduler, SchedulerMsg, Stats},
    storage::Storage,
    store::PieceStore,
    tcp_wire::PeerCodec,
    tracker::{event::Event, is_self, Tracker},
};

pub struct Client<S> {
    pub config: Config,
    pub metainfo: MetaInfo,
    pub local_id: PeerId,
    storage: S,
}

/// Handle to a running [`Client`], cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientCtx {
    /// Address of the listener.
    pub local_addr: SocketAddr,
    pub info_hash: InfoHash,
    tx: mpsc::Sender<SchedulerMsg>,
    quit: Arc<watch::Sender<bool>>,
}

impl ClientCtx {
    /// Connect to peers, useful when there is no tracker.
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<(), Error> {
        self.tx.send(SchedulerMsg::AddPeers(peers)).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats, Error> {
        request_stats(&self.tx).await
    }

    /// Close the listener, announce `stopped` and disconnect every peer.
    pub fn stop(&self) {
        let _ = self.quit.send(true);
    }
}

impl<S: Storage> Client<S> {
    pub fn new(config: Config, metainfo: MetaInfo, storage: S) -> Self {
        Self { config, metainfo, local_id: PeerId::generate(), storage }
    }

    /// Verify what is already in the storage, bind the listener and spawn
    /// the tasks. The handle resolves after [`ClientCtx::stop`], once every
    /// task has finished.
    pub async fn start(
        self,
    ) -> Result<(ClientCtx, JoinHandle<Result<(), Error>>), Error> {
        let Client { config, metainfo, local_id, storage } = self;
        config.validate()?;
        let info = &metainfo.info;

        let mut store = PieceStore::new(info, config.block_len, storage);
        let verified = store.verify_all().await?;
        info!(
            "{}: {verified}/{} pieces already verified",
            info.name,
            info.piece_count()
        );

        let listener =
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.listen_port)))
                .await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}, peer id {local_id}");

        let info_hash = metainfo.info_hash.clone();
        let (scheduler, tx) =
            Scheduler::new(&config, info_hash.clone(), local_id.clone(), store);
        let (quit_tx, quit_rx) = watch::channel(false);

        let tracker = if metainfo.announce.is_empty() {
            info!("no tracker, waiting for peers to be added");
            None
        } else {
            match Tracker::new(
                &metainfo.announce,
                info_hash.clone(),
                local_id,
                local_addr.port(),
            ) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    warn!("{e}, running without a tracker");
                    None
                }
            }
        };

        let codec = PeerCodec::new(info.piece_count(), config.block_len);
        let accept = spawn(accept_loop(listener, codec, tx.clone(), quit_rx.clone()));
        let tracker = spawn(tracker_loop(
            tracker,
            config.clone(),
            local_addr.port(),
            tx.clone(),
            quit_rx,
        ));

        let handle = spawn(async move {
            let res = scheduler.run().await;
            let _ = accept.await;
            let _ = tracker.await;
            info!("client stopped");
            res
        });

        let ctx = ClientCtx { local_addr, info_hash, tx, quit: Arc::new(quit_tx) };

        Ok((ctx, handle))
    }
}

async fn request_stats(tx: &mpsc::Sender<SchedulerMsg>) -> Result<Stats, Error> {
    let (otx, orx) = oneshot::channel();
    tx.send(SchedulerMsg::Stats(otx)).await?;
    Ok(orx.await?)
}

/// Accept inbound connections until the client stops.
async fn accept_loop(
    listener: TcpListener,
    codec: PeerCodec,
    inbox: mpsc::Sender<SchedulerMsg>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        select! {
            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("{addr} accepted");
                        spawn(connection::run(
                            socket,
                            addr,
                            connection::next_id(),
                            Direction::Inbound,
                            codec.clone(),
                            inbox.clone(),
                        ));
                    }
                    Err(e) => warn!("could not accept a connection: {e}"),
                }
            }
            _ = quit.changed() => break,
        }
    }
    debug!("listener closed");
}

/// Announce periodically and hand the peers to the scheduler. When the
/// client stops it announces `stopped` and then stops the scheduler.
async fn tracker_loop(
    mut tracker: Option<Tracker>,
    config: Config,
    port: u16,
    inbox: mpsc::Sender<SchedulerMsg>,
    mut quit: watch::Receiver<bool>,
) {
    let mut tick = interval(config.tracker_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = tick.tick() => {
                if let Some(tracker) = tracker.as_mut() {
                    if announce_started(tracker, port, &inbox).await.is_err() {
                        break;
                    }
                }
            }
            _ = quit.changed() => break,
        }
    }

    if let Some(tracker) = tracker.as_mut() {
        match request_stats(&inbox).await {
            Ok(stats) => {
                if let Err(e) = tracker.announce(Event::Stopped, &stats).await {
                    warn!("could not announce stopped to {}: {e}", tracker.url());
                }
            }
            Err(e) => warn!("{e}, not announcing stopped"),
        }
    }

    let _ = inbox.send(SchedulerMsg::Quit).await;
}

/// An error means the scheduler is gone.
async fn announce_started(
    tracker: &mut Tracker,
    port: u16,
    inbox: &mpsc::Sender<SchedulerMsg>,
) -> Result<(), Error> {
    if !tracker.should_announce(Event::Started) {
        return Ok(());
    }

    let stats = request_stats(inbox).await?;

    match tracker.announce(Event::Started, &stats).await {
        Ok(peers) => {
            let peers: Vec<SocketAddr> =
                peers.into_iter().filter(|peer| !is_self(peer, port)).collect();
            inbox.send(SchedulerMsg::AddPeers(peers)).await?;
        }
        Err(e) => warn!("could not announce to {}: {e}", tracker.url()),
    }

    Ok(())
}
