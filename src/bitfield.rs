use bytes::Bytes;

/// A bitfield recording which pieces a peer has.
///
/// One bit per piece, numbered from the high bit of the first byte, as the
/// pieces appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(num_pieces: usize) -> Self {
        let mut bf = Self {
            bytes: vec![0xff; num_pieces.div_ceil(8)],
            num_pieces,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield from the raw bytes of a wire message.
    ///
    /// Short payloads are zero-extended; spare bits past `num_pieces` are
    /// cleared.
    pub fn from_bytes(raw: Bytes, num_pieces: usize) -> Self {
        let mut bytes = raw.to_vec();
        bytes.resize(num_pieces.div_ceil(8), 0);
        let mut bf = Self { bytes, num_pieces };
        bf.clear_spare_bits();
        bf
    }

    /// Returns true if the piece at `index` is set.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bytes[index / 8] >> (7 - index % 8) & 1 == 1
    }

    /// Sets the piece at `index`.
    pub fn set(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        self.bytes[index / 8] |= 1 << (7 - index % 8);
    }

    /// Clears the piece at `index`.
    pub fn clear(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        self.bytes[index / 8] &= !(1 << (7 - index % 8));
    }

    /// Returns the number of set pieces.
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the total number of pieces.
    pub fn len(&self) -> usize {
        self.num_pieces
    }

    /// Returns true if no piece is set.
    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bytes.len() * 8 - self.num_pieces;
        if spare > 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}
