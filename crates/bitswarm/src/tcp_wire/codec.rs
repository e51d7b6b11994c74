//! Codec for the messages exchanged between peers.
//!
//! A connection always starts with the 68 byte [`Handshake`], which has no
//! length prefix. After it, every message is `<len u32><id u8><payload>`
//! where `len` counts everything after the prefix, and a `len` of zero is
//! a keep-alive. The same [`PeerCodec`] frames both, switching after the
//! handshake is decoded so the buffers are never discarded.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo, Handshake, BLOCK_LEN};
use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
};

/// Messages of the vanilla protocol, with no extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
}

/// The IDs of the [`Message`]s that have one.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            id => return Err(Error::UnknownMessage(id)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PeerCodec {
    /// Needed to know the exact size of a bitfield message.
    piece_count: usize,
    /// Largest block we ever request, bounds the size of a piece message.
    block_len: u32,
    /// Until the remote handshake is decoded, frames are 68 bytes long.
    handshaken: bool,
}

impl PeerCodec {
    pub fn new(piece_count: usize, block_len: u32) -> Self {
        Self { piece_count, block_len, handshaken: false }
    }

    fn bitfield_len(&self) -> usize {
        self.piece_count.div_ceil(8)
    }

    /// Largest `len` prefix accepted before buffering the frame.
    fn max_frame_len(&self) -> usize {
        let piece = 1 + 4 + 4 + self.block_len.max(BLOCK_LEN) as usize;
        piece.max(1 + self.bitfield_len())
    }

    fn decode_handshake(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // fail as soon as the first byte is wrong, before waiting for the
        // rest of the handshake
        if buf[0] as usize != super::PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }
        if buf.len() < Handshake::LEN {
            return Ok(None);
        }

        let frame = buf.split_to(Handshake::LEN);
        let handshake = Handshake::deserialize(&frame)?;
        if handshake.pstr != super::PSTR {
            return Err(Error::HandshakeInvalid);
        }

        self.handshaken = true;
        Ok(Some(Message::Handshake(handshake)))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::Handshake(handshake) => {
                buf.extend_from_slice(&handshake.serialize()?);
            }
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.to_wire();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                block.encode(buf);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                info.encode(buf);
            }
            // <len=0003><id=9><listen-port>
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if !self.handshaken {
            return self.decode_handshake(buf);
        }

        // the message length header must be present at the minimum,
        // otherwise we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at length prefix without consuming
        let size =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if size > self.max_frame_len() {
            return Err(Error::MessageTooLarge(size));
        }

        // the frame may arrive in many packets, wait for all of them
        // without advancing the cursor
        if buf.len() < 4 + size {
            buf.reserve(4 + size - buf.len());
            return Ok(None);
        }

        let id = buf[4];
        let msg_id = match MessageId::try_from(id) {
            Ok(msg_id) => msg_id,
            Err(e) => {
                warn!("unknown message_id {id}");
                return Err(e);
            }
        };

        let expected = match msg_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => size == 1,
            MessageId::Have => size == 1 + 4,
            MessageId::Bitfield => size == 1 + self.bitfield_len(),
            MessageId::Request | MessageId::Cancel => size == 1 + 4 + 4 + 4,
            MessageId::Piece => size >= 1 + 4 + 4,
            MessageId::Port => size == 1 + 2,
        };

        if !expected {
            return Err(Error::MessageLength { id, len: size });
        }

        // cursor after the size and the id, into the payload
        buf.advance(4 + 1);

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(buf.get_u32()),
            MessageId::Bitfield => {
                let bytes = buf.split_to(size - 1).to_vec();
                Message::Bitfield(Bitfield::from_wire(bytes, self.piece_count))
            }
            MessageId::Request => Message::Request(BlockInfo {
                index: buf.get_u32(),
                begin: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Piece => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let block = buf.split_to(size - 9).to_vec();
                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => Message::Cancel(BlockInfo {
                index: buf.get_u32(),
                begin: buf.get_u32(),
                len: buf.get_u32(),
            }),
            MessageId::Port => Message::Port(buf.get_u16()),
        };

        Ok(Some(msg))
    }
}
