//! Rarest-first ordering of the pieces we still need.
use rand::Rng;

use crate::bitfield::Bitfield;

/// Fraction of `peers` that don't have `piece`, zero without peers.
pub fn rarity(piece: usize, peers: &[&Bitfield]) -> f64 {
    if peers.is_empty() {
        return 0.0;
    }
    let missing = peers
        .iter()
        .filter(|pieces| !pieces.get(piece).map(|b| *b).unwrap_or(false))
        .count();
    missing as f64 / peers.len() as f64
}

/// Partially downloaded pieces first, then rare ones. A piece with every
/// block already acquired gets no progress bonus, it is only waiting on
/// verification.
pub fn score(progress: f64, rarity: f64, jitter: f64) -> f64 {
    let progress = if progress >= 1.0 { 0.0 } else { progress };
    progress + rarity + jitter
}

/// Small random tie breaker, in `[0, 0.1)`.
pub fn jitter<R: Rng>(rng: &mut R) -> f64 {
    rng.gen_range(0..100) as f64 / 1000.0
}

/// Order `candidates`, given as `(piece, progress)`, best first.
pub fn rank_pieces<R: Rng>(
    candidates: impl Iterator<Item = (usize, f64)>,
    peers: &[&Bitfield],
    rng: &mut R,
) -> Vec<usize> {
    let mut scored: Vec<(usize, f64)> = candidates
        .map(|(piece, progress)| {
            (piece, score(progress, rarity(piece, peers), jitter(rng)))
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(piece, _)| piece).collect()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::bitfield::BitfieldExt;

    fn pieces(ones: &[usize], len: usize) -> Bitfield {
        let mut bitfield = Bitfield::from_piece(len);
        for i in ones {
            bitfield.set(*i, true);
        }
        bitfield
    }

    #[test]
    fn rarity_is_share_of_peers_missing_it() {
        let a = pieces(&[0, 1], 3);
        let b = pieces(&[0], 3);
        let peers = [&a, &b];

        assert_eq!(rarity(0, &peers), 0.0);
        assert_eq!(rarity(1, &peers), 0.5);
        assert_eq!(rarity(2, &peers), 1.0);
        assert_eq!(rarity(2, &[]), 0.0);
    }

    #[test]
    fn complete_progress_gets_no_bonus() {
        assert_eq!(score(1.0, 0.5, 0.0), 0.5);
        assert_eq!(score(0.5, 0.5, 0.0), 1.0);
    }

    #[test]
    fn jitter_stays_small() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let j = jitter(&mut rng);
            assert!((0.0..0.1).contains(&j));
        }
    }

    #[test]
    fn rare_and_started_pieces_come_first() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = pieces(&[0, 1, 2], 4);
        let b = pieces(&[0, 1], 4);
        let c = pieces(&[0], 4);
        let peers = [&a, &b, &c];

        // piece 3 nobody has, piece 2 one peer, piece 1 two peers, piece 0
        // everyone but it is half downloaded
        let candidates = [(0, 0.5), (1, 0.0), (2, 0.0), (3, 0.0)];
        let ranked = rank_pieces(candidates.into_iter(), &peers, &mut rng);

        assert_eq!(ranked, vec![3, 2, 0, 1]);
    }
}
