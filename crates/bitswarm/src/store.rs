//! Per-piece verification and per-block acquisition state.
use sha1_smol::Sha1;
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::Info,
    storage::Storage,
};

/// Size arithmetic of the pieces and blocks of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub piece_length: u32,
    pub block_len: u32,
    pub total_size: u64,
    pub piece_count: usize,
}

impl Layout {
    pub fn new(info: &Info, block_len: u32) -> Self {
        Self {
            piece_length: info.piece_length,
            block_len,
            total_size: info.total_size(),
            piece_count: info.piece_count(),
        }
    }

    /// The last piece holds the remainder of the content.
    pub fn piece_size(&self, piece: usize) -> u32 {
        if piece + 1 == self.piece_count {
            let remainder = self.total_size % self.piece_length as u64;
            if remainder != 0 {
                return remainder as u32;
            }
        }
        self.piece_length
    }

    pub fn block_count(&self, piece: usize) -> usize {
        self.piece_size(piece).div_ceil(self.block_len) as usize
    }

    /// The last block of a piece holds the remainder of the piece.
    pub fn block_size(&self, piece: usize, block: usize) -> u32 {
        if block + 1 == self.block_count(piece) {
            let remainder = self.piece_size(piece) % self.block_len;
            if remainder != 0 {
                return remainder;
            }
        }
        self.block_len
    }

    pub fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.piece_length as u64
    }
}

/// What a call to [`PieceStore::verify`] found out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The hash matched, every block is now acquired.
    Verified,
    /// The hash didn't match, only some blocks were there.
    Mismatch,
    /// The hash didn't match with every block acquired, they were all
    /// reset so the piece is downloaded again.
    Reset,
    /// The bytes of the piece could not be read.
    Unavailable,
}

pub struct PieceStore<S> {
    storage: S,
    layout: Layout,
    hashes: Vec<[u8; 20]>,
    verified: Bitfield,
    /// One bitfield of blocks per piece.
    acquired: Vec<Bitfield>,
}

impl<S: Storage> PieceStore<S> {
    pub fn new(info: &Info, block_len: u32, storage: S) -> Self {
        let layout = Layout::new(info, block_len);
        let hashes = (0..layout.piece_count)
            .filter_map(|piece| info.piece_hash(piece))
            .collect();
        let acquired = (0..layout.piece_count)
            .map(|piece| Bitfield::from_piece(layout.block_count(piece)))
            .collect();

        Self {
            storage,
            layout,
            hashes,
            verified: Bitfield::from_piece(layout.piece_count),
            acquired,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Pieces we have verified.
    pub fn bitfield(&self) -> &Bitfield {
        &self.verified
    }

    pub fn is_verified(&self, piece: usize) -> bool {
        self.verified.get(piece).map(|b| *b).unwrap_or(false)
    }

    pub fn is_acquired(&self, piece: usize, block: usize) -> bool {
        self.acquired
            .get(piece)
            .and_then(|blocks| blocks.get(block).map(|b| *b))
            .unwrap_or(false)
    }

    pub fn verified_count(&self) -> usize {
        self.verified.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.layout.piece_count
    }

    pub fn is_started(&self) -> bool {
        self.verified_count() > 0
    }

    /// Fraction of the blocks of `piece` that were acquired.
    pub fn progress(&self, piece: usize) -> f64 {
        let Some(blocks) = self.acquired.get(piece) else {
            return 0.0;
        };
        if blocks.is_empty() {
            return 0.0;
        }
        blocks.count_ones() as f64 / blocks.len() as f64
    }

    /// Exact size of the verified pieces.
    pub fn downloaded(&self) -> u64 {
        self.verified
            .iter_ones()
            .map(|piece| self.layout.piece_size(piece) as u64)
            .sum()
    }

    pub fn left(&self) -> u64 {
        self.layout.total_size - self.downloaded()
    }

    /// Hash the persisted bytes of `piece` and compare with its expected
    /// hash.
    pub async fn verify(&mut self, piece: usize) -> Result<VerifyOutcome, Error> {
        let Some(expected) = self.hashes.get(piece).copied() else {
            return Err(Error::PieceOutOfRange(piece as u32));
        };

        let Some(bytes) = self.read_piece(piece).await? else {
            self.verified.set(piece, false);
            return Ok(VerifyOutcome::Unavailable);
        };

        let hash = Sha1::from(&bytes).digest().bytes();

        if hash == expected {
            self.verified.set(piece, true);
            self.acquired[piece].fill(true);
            debug!("piece {piece} is valid");
            return Ok(VerifyOutcome::Verified);
        }

        self.verified.set(piece, false);

        if self.acquired[piece].all() {
            warn!("piece {piece} is corrupted, downloading it again");
            self.acquired[piece].fill(false);
            return Ok(VerifyOutcome::Reset);
        }

        Ok(VerifyOutcome::Mismatch)
    }

    /// Verify every piece against what is already in the storage.
    pub async fn verify_all(&mut self) -> Result<usize, Error> {
        for piece in 0..self.layout.piece_count {
            self.verify(piece).await?;
        }
        Ok(self.verified_count())
    }

    /// Persist a block, mark it acquired and verify its piece.
    pub async fn write_block(
        &mut self,
        piece: usize,
        block: usize,
        data: &[u8],
    ) -> Result<VerifyOutcome, Error> {
        if piece >= self.layout.piece_count
            || block >= self.layout.block_count(piece)
        {
            return Err(Error::PieceOutOfRange(piece as u32));
        }

        let offset = self.layout.piece_offset(piece)
            + block as u64 * self.layout.block_len as u64;

        self.storage.write(offset, data).await?;
        self.acquired[piece].set(block, true);

        self.verify(piece).await
    }

    /// `None` when the bytes are not available, or the range is outside of
    /// the piece.
    pub async fn read_block(
        &self,
        piece: usize,
        begin: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>, Error> {
        if piece >= self.layout.piece_count
            || begin as u64 + len as u64 > self.layout.piece_size(piece) as u64
        {
            return Ok(None);
        }
        let offset = self.layout.piece_offset(piece) + begin as u64;
        self.storage.read(offset, len as usize).await
    }

    pub async fn read_piece(&self, piece: usize) -> Result<Option<Vec<u8>>, Error> {
        self.read_block(piece, 0, self.layout.piece_size(piece)).await
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};

    /// Two pieces of two bytes, blocks of one byte.
    fn info(content: &[u8]) -> Info {
        let mut pieces = Vec::new();
        for chunk in content.chunks(2) {
            pieces.extend_from_slice(&Sha1::from(chunk).digest().bytes());
        }
        Info {
            piece_length: 2,
            pieces,
            name: "f".into(),
            length: Some(content.len() as u64),
            files: None,
            private: false,
        }
    }

    #[test]
    fn block_arithmetic() {
        let layout = Layout {
            piece_length: 40_000,
            block_len: 16384,
            total_size: 100_000,
            piece_count: 3,
        };

        assert_eq!(layout.piece_size(0), 40_000);
        assert_eq!(layout.piece_size(2), 20_000);
        assert_eq!(layout.block_count(0), 3);
        assert_eq!(layout.block_count(2), 2);
        assert_eq!(layout.block_size(0, 2), 40_000 - 2 * 16384);
        assert_eq!(layout.block_size(2, 1), 20_000 - 16384);

        for piece in 0..layout.piece_count {
            let size = layout.piece_size(piece);
            let count = layout.block_count(piece);
            assert_eq!(count, size.div_ceil(layout.block_len) as usize);
            let sum: u32 =
                (0..count).map(|block| layout.block_size(piece, block)).sum();
            assert_eq!(sum, size);
        }

        // content that is a multiple of the piece length
        let even = Layout { total_size: 80_000, piece_count: 2, ..layout };
        assert_eq!(even.piece_size(1), 40_000);
    }

    #[tokio::test]
    async fn verify_whole_piece_on_disk() {
        let content = [1u8, 2, 3, 4];
        let info = info(&content);
        let storage = MemoryStorage::with_content(info.file_layout(), &content);
        let mut store = PieceStore::new(&info, 1, storage);

        assert_eq!(store.verify(0).await.unwrap(), VerifyOutcome::Verified);
        assert!(store.is_verified(0));
        assert!(store.is_acquired(0, 0));
        assert!(store.is_acquired(0, 1));
        assert!(!store.is_acquired(1, 0));
        assert!(store.is_started());
        assert!(!store.is_complete());

        assert_eq!(store.verify_all().await.unwrap(), 2);
        assert!(store.is_complete());
        assert_eq!(store.downloaded(), 4);
        assert_eq!(store.left(), 0);
    }

    #[tokio::test]
    async fn verify_unavailable_keeps_state() {
        let info = info(&[1, 2, 3, 4]);
        let mut store =
            PieceStore::new(&info, 1, MemoryStorage::new(info.file_layout()));

        assert_eq!(store.verify(0).await.unwrap(), VerifyOutcome::Unavailable);
        assert!(!store.is_verified(0));
        assert_eq!(store.progress(0), 0.0);
    }

    #[tokio::test]
    async fn deleted_content_is_no_longer_verified() {
        let mut rng = rand::thread_rng();
        let dir: String =
            (0..20).map(|_| rng.sample(Alphanumeric) as char).collect();
        let root = std::env::temp_dir().join(dir);

        let info = info(&[1, 2, 3, 4]);
        let mut store =
            PieceStore::new(&info, 1, FileStorage::new(&root, info.file_layout()));

        store.write_block(0, 0, &[1]).await.unwrap();
        let outcome = store.write_block(0, 1, &[2]).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Verified);
        assert_eq!(store.downloaded(), 2);

        tokio::fs::remove_dir_all(&root).await.unwrap();

        assert_eq!(store.verify(0).await.unwrap(), VerifyOutcome::Unavailable);
        assert!(!store.is_verified(0));
        assert!(store.is_acquired(0, 0));
        assert!(store.is_acquired(0, 1));
        assert_eq!(store.downloaded(), 0);
        assert_eq!(store.left(), 4);
    }

    #[tokio::test]
    async fn write_blocks_until_verified() {
        let info = info(&[1, 2, 3]);
        let mut store =
            PieceStore::new(&info, 1, MemoryStorage::new(info.file_layout()));

        // the last piece has a single block of one byte
        assert_eq!(store.layout().block_count(1), 1);

        // partial data fails verification without resetting anything
        let outcome = store.write_block(0, 0, &[1]).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
        assert!(store.is_acquired(0, 0));
        assert_eq!(store.progress(0), 0.5);

        let outcome = store.write_block(0, 1, &[2]).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Verified);

        let outcome = store.write_block(1, 0, &[3]).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Verified);
        assert!(store.is_complete());
        assert_eq!(store.downloaded(), 3);

        assert_eq!(store.read_block(0, 1, 1).await.unwrap(), Some(vec![2]));
        assert_eq!(store.read_block(1, 0, 2).await.unwrap(), None);
        assert_eq!(store.read_piece(0).await.unwrap(), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn corrupted_piece_is_reset() {
        let info = info(&[1, 2, 3, 4]);
        let mut store =
            PieceStore::new(&info, 1, MemoryStorage::new(info.file_layout()));

        store.write_block(1, 0, &[3]).await.unwrap();
        let outcome = store.write_block(1, 1, &[9]).await.unwrap();

        assert_eq!(outcome, VerifyOutcome::Reset);
        assert!(!store.is_verified(1));
        assert!(!store.is_acquired(1, 0));
        assert!(!store.is_acquired(1, 1));
    }

    #[tokio::test]
    async fn write_out_of_range() {
        let info = info(&[1, 2, 3, 4]);
        let mut store =
            PieceStore::new(&info, 1, MemoryStorage::new(info.file_layout()));
        assert!(store.write_block(2, 0, &[1]).await.is_err());
        assert!(store.write_block(0, 2, &[1]).await.is_err());
    }
}
