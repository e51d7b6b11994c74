//! A tracker is a server that manages peers and stats of multiple torrents.
//!
//! Only HTTP(S) trackers are spoken to. The announce tells the tracker how
//! much we transferred and gets back a list of peers and the interval to
//! wait before the next announce.
pub mod announce;
pub mod event;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bendy::decoding::FromBencode;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info};

use self::{
    announce::{Peers, Request, Response},
    event::Event,
};
use crate::{error::Error, metainfo::InfoHash, peer::PeerId, scheduler::Stats};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval used until a tracker tells us its own.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct Tracker {
    client: Client,
    url: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    interval: Duration,
    last_announce: Option<Instant>,
}

impl Tracker {
    pub fn new(
        url: &str,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
    ) -> Result<Self, Error> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerUrl(url.to_owned()));
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
            info_hash,
            peer_id,
            port,
            interval: DEFAULT_INTERVAL,
            last_announce: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A `started` announce waits for the interval of the tracker, the
    /// other events are always sent.
    pub fn should_announce(&self, event: Event) -> bool {
        match (event, self.last_announce) {
            (Event::Started, Some(last)) => last.elapsed() >= self.interval,
            _ => true,
        }
    }

    /// Announce our stats and return the peers of the swarm.
    pub async fn announce(
        &mut self,
        event: Event,
        stats: &Stats,
    ) -> Result<Vec<SocketAddr>, Error> {
        let req = Request {
            info_hash: self.info_hash.clone(),
            peer_id: self.peer_id.clone(),
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
        };
        debug!("announcing {event} to {}", self.url);

        // a failed announce waits for the interval as well
        self.last_announce = Some(Instant::now());

        let bytes = self
            .client
            .get(req.to_url(&self.url))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let res = Response::from_bencode(&bytes)?;

        if let Some(reason) = res.failure_reason {
            return Err(Error::TrackerFailure(reason));
        }

        if let Some(interval) = res.interval {
            self.interval = Duration::from_secs(interval);
        }

        let peers = match res.peers {
            Peers::Compact(buf) => parse_compact_peer_list(&buf)?,
            Peers::List(peers) => peers,
            Peers::Empty => Vec::new(),
        };

        info!(
            "tracker returned {} peers, next announce in {}s",
            peers.len(),
            self.interval.as_secs()
        );

        Ok(peers)
    }
}

/// Support for BEP23, 4 bytes of IPv4 and 2 of port per peer.
pub fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let peers = chunks
        .map(|peer| {
            let ip = Ipv4Addr::new(peer[0], peer[1], peer[2], peer[3]);
            let port = u16::from_be_bytes([peer[4], peer[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect();

    Ok(peers)
}

/// If `addr` is our own listener. Trackers usually return ourselves among
/// the peers.
pub fn is_self(addr: &SocketAddr, port: u16) -> bool {
    addr.port() == port && (addr.ip().is_loopback() || addr.ip().is_unspecified())
}
