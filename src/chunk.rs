use crate::layout::Layout;

/// Chunks default to 16 KiB, the request size virtually every client uses.
pub const DEFAULT_CHUNK_SIZE: usize = 0x4000;

// Identifies a chunk on the wire and in the scheduler.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct ChunkInfo {

    // Index of the piece the chunk belongs to.
    pub piece: usize,

    // Offset in bytes of the chunk within its piece.
    pub offset: usize,

    // Length of the chunk in bytes.
    pub len: usize,

}

impl ChunkInfo {
    // A request is serviceable only if it stays inside its piece.
    pub fn is_valid(&self, layout: &Layout) -> bool {
        self.piece < layout.num_pieces
            && self.len > 0
            && self.offset + self.len <= layout.piece_len(self.piece)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {

    pub piece: usize,

    pub offset: usize,

    pub data: Vec<u8>,

}

impl ChunkData {
    #[inline]
    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            piece: self.piece,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

// Length of the chunk starting at `chunk_idx * chunk_size`; only the
// tail of a piece cuts a chunk short.
pub fn chunk_len(piece_len: usize, chunk_idx: usize, chunk_size: usize) -> usize {
    let start = chunk_idx * chunk_size;
    debug_assert!(start < piece_len);
    (piece_len - start).min(chunk_size)
}

pub fn num_chunks(piece_len: usize, chunk_size: usize) -> usize {
    piece_len.div_ceil(chunk_size)
}
