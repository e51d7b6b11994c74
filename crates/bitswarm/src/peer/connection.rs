//! One task per TCP connection. It frames bytes with the [`PeerCodec`],
//! forwards what it decodes to the scheduler and writes what the session
//! queued for it.
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, select, sync::mpsc, time::timeout};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::{Direction, PeerEvent};
use crate::{scheduler::SchedulerMsg, tcp_wire::PeerCodec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connect to `addr` and run the connection until it ends.
pub async fn connect(
    addr: SocketAddr,
    id: u64,
    codec: PeerCodec,
    inbox: mpsc::Sender<SchedulerMsg>,
) {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(socket)) => {
            debug!("{addr} connected");
            run(socket, addr, id, Direction::Outbound, codec, inbox).await;
        }
        Ok(Err(e)) => {
            debug!("{addr} could not connect: {e}");
            let _ = inbox
                .send(SchedulerMsg::Peer(PeerEvent::Disconnected { addr, id }))
                .await;
        }
        Err(_) => {
            debug!("{addr} connection timed out");
            let _ = inbox
                .send(SchedulerMsg::Peer(PeerEvent::Disconnected { addr, id }))
                .await;
        }
    }
}

/// Drive an established connection. Returns when the socket fails, the
/// remote sends something malformed, or the scheduler drops the session.
/// The scheduler always receives exactly one `Disconnected` at the end.
pub async fn run(
    socket: TcpStream,
    addr: SocketAddr,
    id: u64,
    direction: Direction,
    codec: PeerCodec,
    inbox: mpsc::Sender<SchedulerMsg>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connected = PeerEvent::Connected { addr, id, direction, tx };
    if inbox.send(SchedulerMsg::Peer(connected)).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = Framed::new(socket, codec).split();

    loop {
        select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        let event = PeerEvent::Message { addr, id, msg };
                        if inbox.send(SchedulerMsg::Peer(event)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{addr} {e}, dropping connection");
                        break;
                    }
                    None => {
                        debug!("{addr} closed the socket");
                        break;
                    }
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!("{addr} session dropped");
                    break;
                };
                if let Err(e) = sink.send(msg).await {
                    warn!("{addr} {e}, dropping connection");
                    break;
                }
            }
        }
    }

    let _ = inbox
        .send(SchedulerMsg::Peer(PeerEvent::Disconnected { addr, id }))
        .await;
}
