//! The "TCP Wire" protocol spoken between peers of a swarm.
mod codec;
mod handshake;

pub use codec::*;
pub use handshake::*;

use bytes::{BufMut, BytesMut};

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// Tha last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Largest block a remote may request from us.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece, pieces are subsets of the entire
/// Torrent data.
///
/// Blocks travel on the "Piece" message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data.
    pub block: Vec<u8>,
}

impl Block {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
    }
}

/// The representation of a [`Block`], sent on "Request" and "Cancel"
/// messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    /// Requests of zero bytes or larger than [`MAX_REQUEST_LEN`] are
    /// refused.
    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len <= MAX_REQUEST_LEN
    }
}
