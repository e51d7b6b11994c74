//! Query and response of an HTTP announce.
use std::net::{IpAddr, SocketAddr};

use bendy::decoding::{self, FromBencode, Object, ResultExt};

use super::event::Event;
use crate::{metainfo::InfoHash, peer::PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

impl Request {
    /// Append the query to the announce url of the tracker.
    pub fn to_url(&self, announce: &str) -> String {
        let separator = if announce.contains('?') { '&' } else { '?' };
        format!(
            "{announce}{separator}info_hash={}&peer_id={}&port={}&uploaded={}\
             &downloaded={}&left={}&event={}&compact=1",
            urlencoding::encode_binary(&self.info_hash.0),
            urlencoding::encode_binary(&self.peer_id.0),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
            self.event,
        )
    }
}

/// Peers as the tracker sent them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Peers {
    /// 6 bytes per peer, IPv4 and big endian port.
    Compact(Vec<u8>),
    /// A list of dictionaries with an `ip` and a `port`.
    List(Vec<SocketAddr>),
    #[default]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Seconds to wait before announcing again.
    pub interval: Option<u64>,
    pub failure_reason: Option<String>,
    pub peers: Peers,
}

impl FromBencode for Response {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut res = Response::default();

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"failure reason", value) => {
                    res.failure_reason = String::decode_bencode_object(value)
                        .context("failure reason")
                        .map(Some)?;
                }
                (b"interval", value) => {
                    res.interval = u64::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?;
                }
                (b"peers", Object::Bytes(bytes)) => {
                    res.peers = Peers::Compact(bytes.to_vec());
                }
                (b"peers", Object::List(mut list)) => {
                    let mut peers = Vec::new();
                    while let Some(peer) = list.next_object()? {
                        if let Some(addr) =
                            decode_peer(peer).context("peers")?
                        {
                            peers.push(addr);
                        }
                    }
                    res.peers = Peers::List(peers);
                }
                _ => {}
            }
        }

        Ok(res)
    }
}

/// Peers announced with a host name instead of an IP are skipped.
fn decode_peer(object: Object) -> Result<Option<SocketAddr>, decoding::Error> {
    let mut ip = None;
    let mut port = None;

    let mut dict_dec = object.try_into_dictionary()?;
    while let Some(pair) = dict_dec.next_pair()? {
        match pair {
            (b"ip", value) => {
                ip = String::decode_bencode_object(value).context("ip").map(Some)?;
            }
            (b"port", value) => {
                port =
                    u64::decode_bencode_object(value).context("port").map(Some)?;
            }
            _ => {}
        }
    }

    let ip = ip.and_then(|ip| ip.parse::<IpAddr>().ok());
    let port = port.and_then(|port| u16::try_from(port).ok());

    Ok(ip.zip(port).map(SocketAddr::from))
}
