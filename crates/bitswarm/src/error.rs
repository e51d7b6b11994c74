use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::scheduler::SchedulerMsg;

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::Bencode(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::Bencode(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    Bencode(String),

    #[error("The metainfo is missing the required field `{0}`")]
    MissingField(&'static str),

    #[error(
        "The piece hashes of the metainfo do not match the size of the content"
    )]
    PieceHashes,

    #[error("The metainfo does not describe any file")]
    NoFiles,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer didn't send a handshake as the first message")]
    NoHandshake,

    #[error("Unknown message id `{0}`")]
    UnknownMessage(u8),

    #[error("Message with id `{id}` has an invalid length of {len} bytes")]
    MessageLength { id: u8, len: usize },

    #[error("Message of {0} bytes is larger than the allowed maximum")]
    MessageTooLarge(usize),

    #[error("The peer referenced the piece `{0}` which does not exist")]
    PieceOutOfRange(u32),

    #[error("The peer requested an invalid block")]
    RequestInvalid,

    #[error("Tried to write {len} bytes at offset {offset}, past the content")]
    OffsetOutOfRange { offset: u64, len: usize },

    #[error("The tracker url `{0}` is not supported, only http(s) is")]
    TrackerUrl(String),

    #[error("HTTP error while talking to the tracker")]
    Http(#[from] reqwest::Error),

    #[error("The tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Error while trying to load configuration: `{0}")]
    FromConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(&'static str),

    #[error("Could not serialize the default configuration")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("The given PATH is invalid")]
    PathInvalid,

    #[error("Could not send message to the Scheduler")]
    SendErrorScheduler(#[from] mpsc::error::SendError<SchedulerMsg>),

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
