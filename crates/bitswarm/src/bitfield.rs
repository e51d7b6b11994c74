//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// A bitfield of `len` unset bits.
    fn from_piece(len: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; len]
    }

    /// Build a bitfield of `len` bits from wire bytes. Bits past `len` are
    /// padding and are dropped.
    fn from_wire(bytes: Vec<u8>, len: usize) -> Bitfield {
        let mut b = Bitfield::from_vec(bytes);
        b.resize(len, false);
        b
    }

    /// Bytes to put on the wire, padding bits zeroed.
    fn to_wire(&self) -> Vec<u8>;

    /// Set every bit that is set on `other`, never clearing any.
    fn merge(&mut self, other: &Bitfield);

    /// Amount of bits set on `self` and not set on `other`.
    fn missing_from(&self, other: &Bitfield) -> usize;
}

impl BitfieldExt for Bitfield {
    fn to_wire(&self) -> Vec<u8> {
        let mut b = self.clone();
        b.set_uninitialized(false);
        b.into_vec()
    }

    fn merge(&mut self, other: &Bitfield) {
        for i in other.iter_ones() {
            if i < self.len() {
                self.set(i, true);
            }
        }
    }

    fn missing_from(&self, other: &Bitfield) -> usize {
        self.iter_ones()
            .filter(|i| !other.get(*i).map(|b| *b).unwrap_or(false))
            .count()
    }
}
