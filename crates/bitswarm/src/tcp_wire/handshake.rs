use speedy::{BigEndian, Readable, Writable};
use tracing::warn;

use super::PSTR;
use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. The
/// reserved field is 8 zero bytes, no extension is advertised. The peer id
/// is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Eq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Size of a serialized handshake, it has no length prefix.
    pub const LEN: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; 68], Error> {
        let mut buf = [0u8; Self::LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        if temp.len() != Self::LEN {
            return Err(Error::HandshakeInvalid);
        }
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::LEN {
            return Err(Error::HandshakeInvalid);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Check a received handshake against the info hash we are serving.
    pub fn validate(&self, info_hash: &InfoHash) -> bool {
        if self.pstr_len as usize != PSTR.len() {
            warn!("! handshake with wrong pstr_len, dropping connection");
            return false;
        }
        if self.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        if self.info_hash != *info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let ours = Handshake::new(info_hash.clone(), peer_id.clone());

        assert_eq!(ours.pstr_len, 19);
        assert_eq!(ours.pstr, PSTR);

        let bytes = ours.serialize().unwrap();
        assert_eq!(
            bytes,
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 0, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );

        let theirs = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        assert_eq!(theirs.peer_id, peer_id);
        assert!(theirs.validate(&info_hash));
    }

    #[test]
    fn validate_rejects_other_torrents() {
        let theirs = Handshake::new(InfoHash([1u8; 20]), PeerId([2u8; 20]));
        assert!(!theirs.validate(&InfoHash([9u8; 20])));

        let mut bad_pstr = theirs.clone();
        bad_pstr.pstr[0] = b'b';
        assert!(!bad_pstr.validate(&InfoHash([1u8; 20])));
    }

    #[test]
    fn deserialize_wrong_size() {
        assert!(Handshake::deserialize(&[19u8; 67]).is_err());
    }
}
