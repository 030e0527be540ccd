use std::net::SocketAddr;
use crate::chunk::{chunk_len, num_chunks, ChunkInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ChunkState {

    // Not handed to any peer.
    NotRequested,

    // In flight. Outside endgame the list holds exactly one peer.
    Assigned(Vec<SocketAddr>),

    // Delivered by a peer, not yet durable.
    Fetched,

    // Written to disk.
    Stored,

}

// Chunk ledger for one piece mid-download.
#[derive(Debug)]
pub(super) struct Partial {

    pub piece: usize,

    // Length of the piece.
    pub len: usize,

    chunk_size: usize,

    chunks: Vec<ChunkState>,

    stored: usize,

    // Completion is reported to the committer exactly once.
    complete_emitted: bool,

}

impl Partial {

    pub fn new(piece: usize, len: usize, chunk_size: usize) -> Self {
        Self {
            piece,
            len,
            chunk_size,
            chunks: vec![ChunkState::NotRequested; num_chunks(len, chunk_size)],
            stored: 0,
            complete_emitted: false,
        }
    }

    fn chunk_at(&self, idx: usize) -> ChunkInfo {
        ChunkInfo {
            piece: self.piece,
            offset: idx * self.chunk_size,
            len: chunk_len(self.len, idx, self.chunk_size),
        }
    }

    // Index of a chunk the registry itself handed out, or None for
    // anything misaligned (strays never mutate the ledger).
    fn index_of(&self, chunk: &ChunkInfo) -> Option<usize> {
        if chunk.offset % self.chunk_size != 0 {
            return None;
        }
        let idx = chunk.offset / self.chunk_size;
        if idx >= self.chunks.len() || chunk.len != chunk_len(self.len, idx, self.chunk_size) {
            return None;
        }
        Some(idx)
    }

    // Hands out up to `num` not-yet-requested chunks to `peer`.
    pub fn assign_free(&mut self, peer: SocketAddr, num: usize, out: &mut Vec<ChunkInfo>) -> usize {
        let mut picked = 0;
        for idx in 0..self.chunks.len() {
            if picked == num {
                break;
            }
            if self.chunks[idx] == ChunkState::NotRequested {
                self.chunks[idx] = ChunkState::Assigned(vec![peer]);
                out.push(self.chunk_at(idx));
                picked += 1;
            }
        }
        picked
    }

    // Endgame: duplicates chunks already in flight with other peers.
    pub fn assign_duplicates(&mut self, peer: SocketAddr, num: usize, out: &mut Vec<ChunkInfo>) -> usize {
        let mut picked = 0;
        for idx in 0..self.chunks.len() {
            if picked == num {
                break;
            }
            if let ChunkState::Assigned(peers) = &mut self.chunks[idx] {
                if !peers.contains(&peer) {
                    peers.push(peer);
                    out.push(self.chunk_at(idx));
                    picked += 1;
                }
            }
        }
        picked
    }

    /// Assigned → Fetched. Returns the peers that held the assignment,
    /// or None when the chunk was not in flight (stray or repeat).
    pub fn mark_fetched(&mut self, chunk: &ChunkInfo) -> Option<Vec<SocketAddr>> {
        let idx = self.index_of(chunk)?;
        match std::mem::replace(&mut self.chunks[idx], ChunkState::Fetched) {
            ChunkState::Assigned(peers) => Some(peers),
            prev => {
                // Leave the previous state in place.
                self.chunks[idx] = prev;
                None
            }
        }
    }

    /// Fetched → Stored. Returns true the first time every chunk of the
    /// piece is stored.
    pub fn mark_stored(&mut self, chunk: &ChunkInfo) -> bool {
        let Some(idx) = self.index_of(chunk) else { return false };
        if self.chunks[idx] != ChunkState::Fetched {
            return false;
        }
        self.chunks[idx] = ChunkState::Stored;
        self.stored += 1;
        if self.stored == self.chunks.len() && !self.complete_emitted {
            self.complete_emitted = true;
            return true;
        }
        false
    }

    // Removes one peer's claim; the chunk is freed once nobody holds it.
    pub fn drop_assignment(&mut self, chunk: &ChunkInfo, peer: SocketAddr) {
        let Some(idx) = self.index_of(chunk) else { return };
        if let ChunkState::Assigned(peers) = &mut self.chunks[idx] {
            peers.retain(|p| *p != peer);
            if peers.is_empty() {
                self.chunks[idx] = ChunkState::NotRequested;
            }
        }
    }

    pub fn drop_peer(&mut self, peer: SocketAddr) {
        for state in self.chunks.iter_mut() {
            if let ChunkState::Assigned(peers) = state {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *state = ChunkState::NotRequested;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn assigned_to(&self, peer: SocketAddr) -> Vec<ChunkInfo> {
        (0..self.chunks.len())
            .filter(|idx| matches!(&self.chunks[*idx], ChunkState::Assigned(peers) if peers.contains(&peer)))
            .map(|idx| self.chunk_at(idx))
            .collect()
    }

    // Chunks already delivered, counted when a piece is thrown away.
    pub fn fetched_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c, ChunkState::Fetched | ChunkState::Stored))
            .count()
    }

    #[cfg(test)]
    pub fn state_of(&self, chunk: &ChunkInfo) -> Option<&ChunkState> {
        self.index_of(chunk).map(|idx| &self.chunks[idx])
    }
}
