use std::{collections::HashMap, net::SocketAddr};
use tokio::sync::RwLock;
use crate::{
    chunk::{num_chunks, ChunkInfo},
    pieceset::PieceSet,
};

mod partial;
mod pieces;

use partial::Partial;
use pieces::PieceTable;

// Endgame begins once the unfetched chunk backlog shrinks to this many
// chunks per remaining piece.
const ENDGAME_CHUNKS_PER_PIECE: usize = 4;

/// Outcome of a peer asking for work.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRequests {

    Granted(Vec<ChunkInfo>),

    // The peer holds nothing we lack.
    NotInterested,

    // Everything the peer could serve is already in flight.
    NoneAvailable,

}

/// Per-torrent chunk scheduler. Tracks every chunk of every unfinished
/// piece, hands out assignments, and drives endgame duplication.
#[derive(Debug)]
pub struct ChunkRegistry {
    inner: RwLock<Registry>,
}

#[derive(Debug)]
struct Registry {

    piece_len: usize,

    last_piece_len: usize,

    num_pieces: usize,

    chunk_size: usize,

    table: PieceTable,

    // Chunk ledgers for pieces in state Chunked.
    partials: HashMap<usize, Partial>,

    // Chunks not yet delivered by anyone, over all unfinished pieces.
    chunks_left: usize,

    pieces_left: usize,

    endgame: bool,

}

impl Registry {

    fn piece_len(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn refresh_endgame(&mut self) {
        let endgame = self.chunks_left > 0
            && self.chunks_left <= ENDGAME_CHUNKS_PER_PIECE * self.pieces_left;
        if endgame != self.endgame {
            tracing::info!(endgame, chunks_left = self.chunks_left, "endgame transition");
            self.endgame = endgame;
        }
    }
}

impl ChunkRegistry {

    pub fn new(num_pieces: usize, piece_len: usize, last_piece_len: usize, chunk_size: usize) -> Self {
        let chunks_left = (num_pieces - 1) * num_chunks(piece_len, chunk_size)
            + num_chunks(last_piece_len, chunk_size);
        Self {
            inner: RwLock::new(Registry {
                piece_len,
                last_piece_len,
                num_pieces,
                chunk_size,
                table: PieceTable::new(num_pieces),
                partials: HashMap::new(),
                chunks_left,
                pieces_left: num_pieces,
                endgame: false,
            }),
        }
    }

    /// Hands `peer` up to `num` chunks it can serve. Pieces already
    /// mid-download are drained first, then new pieces are opened in
    /// rarest-first order; in endgame, chunks in flight with other peers
    /// are handed out a second time.
    pub async fn request_chunks(&self, peer: SocketAddr, pieces: &PieceSet, num: usize) -> ChunkRequests {

        let mut inner = self.inner.write().await;
        if !inner.table.check_interest(pieces) {
            return ChunkRequests::NotInterested;
        }

        let mut out = Vec::new();
        let mut remaining = num;

        for partial in inner.partials.values_mut() {
            if remaining == 0 {
                break;
            }
            if !pieces.contains(partial.piece) {
                continue;
            }
            remaining -= partial.assign_free(peer, remaining, &mut out);
        }

        while remaining > 0 {
            let Some(idx) = inner.table.pick_rarest(pieces) else { break };
            tracing::trace!("opened piece {}", idx);
            let len = inner.piece_len(idx);
            let chunk_size = inner.chunk_size;
            let mut partial = Partial::new(idx, len, chunk_size);
            remaining -= partial.assign_free(peer, remaining, &mut out);
            inner.partials.insert(idx, partial);
        }

        if remaining > 0 && inner.endgame {
            for partial in inner.partials.values_mut() {
                if remaining == 0 {
                    break;
                }
                if !pieces.contains(partial.piece) {
                    continue;
                }
                remaining -= partial.assign_duplicates(peer, remaining, &mut out);
            }
        }

        if out.is_empty() {
            ChunkRequests::NoneAvailable
        } else {
            ChunkRequests::Granted(out)
        }
    }

    /// Records delivery of a chunk by `by`. Returns the other peers that
    /// still held the assignment (endgame cancel targets), or None when
    /// the delivery was a stray or a repeat.
    pub async fn mark_fetched(&self, chunk: &ChunkInfo, by: SocketAddr) -> Option<Vec<SocketAddr>> {
        let mut inner = self.inner.write().await;
        let holders = inner.partials.get_mut(&chunk.piece)?.mark_fetched(chunk)?;
        inner.chunks_left -= 1;
        inner.refresh_endgame();
        Some(holders.into_iter().filter(|p| *p != by).collect())
    }

    /// Records a durable write. Returns the piece index when the last
    /// chunk of a piece becomes stored; reported once per completion.
    pub async fn mark_stored(&self, chunk: &ChunkInfo) -> Option<usize> {
        let mut inner = self.inner.write().await;
        let partial = inner.partials.get_mut(&chunk.piece)?;
        partial.mark_stored(chunk).then_some(chunk.piece)
    }

    pub async fn mark_dropped(&self, chunk: &ChunkInfo, peer: SocketAddr) {
        let mut inner = self.inner.write().await;
        if let Some(partial) = inner.partials.get_mut(&chunk.piece) {
            partial.drop_assignment(chunk, peer);
        }
    }

    // Bulk drop on disconnect or choke without the fast extension.
    pub async fn mark_all_dropped(&self, peer: SocketAddr) {
        let mut inner = self.inner.write().await;
        for partial in inner.partials.values_mut() {
            partial.drop_peer(peer);
        }
    }

    /// A verified piece: the bit is set, the ledger retired.
    pub async fn commit_piece(&self, idx: usize) {
        let mut inner = self.inner.write().await;
        inner.partials.remove(&idx);
        inner.table.commit(idx);
        inner.pieces_left -= 1;
        inner.refresh_endgame();
    }

    /// Hash mismatch or failed I/O: the piece is thrown back to
    /// NotFetched and its delivered chunks rejoin the backlog.
    pub async fn invalidate_piece(&self, idx: usize) {
        let mut inner = self.inner.write().await;
        if let Some(partial) = inner.partials.remove(&idx) {
            inner.chunks_left += partial.fetched_count();
        }
        inner.table.invalidate(idx);
        inner.refresh_endgame();
    }

    pub async fn observe_bitfield(&self, pieces: &PieceSet) -> bool {
        self.inner.write().await.table.observe_bitfield(pieces)
    }

    pub async fn observe_have(&self, idx: usize) -> bool {
        self.inner.write().await.table.observe_have(idx)
    }

    pub async fn check_interest(&self, pieces: &PieceSet) -> bool {
        self.inner.read().await.table.check_interest(pieces)
    }

    // Snapshot of the local bitfield.
    pub async fn have(&self) -> PieceSet {
        self.inner.read().await.table.have().clone()
    }

    pub async fn has_piece(&self, idx: usize) -> bool {
        self.inner.read().await.table.have().contains(idx)
    }

    pub async fn is_seeding(&self) -> bool {
        self.inner.read().await.table.is_seeding()
    }

    pub async fn pieces_left(&self) -> usize {
        self.inner.read().await.pieces_left
    }

    pub async fn in_endgame(&self) -> bool {
        self.inner.read().await.endgame
    }

    #[cfg(test)]
    pub(crate) async fn assigned_to(&self, peer: SocketAddr) -> Vec<ChunkInfo> {
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .partials
            .values()
            .flat_map(|p| p.assigned_to(peer))
            .collect();
        out.sort_by_key(|c| (c.piece, c.offset));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 16_384;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn granted(requests: ChunkRequests) -> Vec<ChunkInfo> {
        match requests {
            ChunkRequests::Granted(chunks) => chunks,
            other => panic!("expected granted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_interested_when_peer_has_nothing() {
        let registry = ChunkRegistry::new(4, CHUNK * 2, CHUNK, CHUNK);
        let empty = PieceSet::empty(4);
        assert_eq!(registry.request_chunks(addr(1), &empty, 5).await, ChunkRequests::NotInterested);
    }

    #[tokio::test]
    async fn test_single_assignment_outside_endgame() {
        // 4 pieces of 8 chunks: far from endgame.
        let registry = ChunkRegistry::new(4, CHUNK * 8, CHUNK * 8, CHUNK);
        let all = PieceSet::full(4);
        registry.observe_bitfield(&all).await;
        registry.observe_bitfield(&all).await;

        let first = granted(registry.request_chunks(addr(1), &all, 10).await);
        assert_eq!(first.len(), 10);
        let second = granted(registry.request_chunks(addr(2), &all, 10).await);
        assert_eq!(second.len(), 10);
        // No chunk handed out twice.
        for chunk in &first {
            assert!(!second.contains(chunk));
        }
        assert!(!registry.in_endgame().await);
    }

    #[tokio::test]
    async fn test_prefers_started_pieces() {
        let registry = ChunkRegistry::new(2, CHUNK * 8, CHUNK * 8, CHUNK);
        let all = PieceSet::full(2);
        registry.observe_bitfield(&all).await;

        let first = granted(registry.request_chunks(addr(1), &all, 2).await);
        let piece = first[0].piece;
        // A second peer drains the started piece before opening the other.
        let second = granted(registry.request_chunks(addr(2), &all, 6).await);
        assert!(second.iter().all(|c| c.piece == piece));
    }

    #[tokio::test]
    async fn test_drop_frees_for_other_peers() {
        // 8 chunks in one piece keeps the backlog above the endgame bar.
        let registry = ChunkRegistry::new(1, CHUNK * 8, CHUNK * 8, CHUNK);
        let all = PieceSet::full(1);
        registry.observe_bitfield(&all).await;

        let chunks = granted(registry.request_chunks(addr(1), &all, 8).await);
        assert_eq!(registry.request_chunks(addr(2), &all, 8).await, ChunkRequests::NoneAvailable);

        registry.mark_all_dropped(addr(1)).await;
        assert!(registry.assigned_to(addr(1)).await.is_empty());
        let retry = granted(registry.request_chunks(addr(2), &all, 8).await);
        assert_eq!(retry.len(), chunks.len());
    }

    #[tokio::test]
    async fn test_exactly_once_completion() {
        let registry = ChunkRegistry::new(2, CHUNK * 2, CHUNK, CHUNK);
        let all = PieceSet::full(2);
        registry.observe_bitfield(&all).await;

        let chunks = granted(registry.request_chunks(addr(1), &all, 10).await);
        let mut completions = 0;
        for chunk in &chunks {
            assert!(registry.mark_fetched(chunk, addr(1)).await.is_some());
            if registry.mark_stored(chunk).await.is_some() {
                completions += 1;
            }
            // Repeats never produce another completion.
            assert!(registry.mark_stored(chunk).await.is_none());
        }
        assert_eq!(completions, 2);
    }

    #[tokio::test]
    async fn test_stray_fetch_dropped() {
        let registry = ChunkRegistry::new(1, CHUNK * 4, CHUNK * 4, CHUNK);
        let all = PieceSet::full(1);
        registry.observe_bitfield(&all).await;
        let chunk = ChunkInfo { piece: 0, offset: 0, len: CHUNK };

        // Piece not even chunked yet.
        assert!(registry.mark_fetched(&chunk, addr(1)).await.is_none());

        let chunks = granted(registry.request_chunks(addr(1), &all, 1).await);
        assert!(registry.mark_fetched(&chunks[0], addr(1)).await.is_some());
        // Second arrival of the same chunk.
        assert!(registry.mark_fetched(&chunks[0], addr(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_endgame_duplicates_and_cancel_targets() {
        // One piece of two chunks: backlog is small enough for endgame.
        let registry = ChunkRegistry::new(1, CHUNK * 2, CHUNK * 2, CHUNK);
        let all = PieceSet::full(1);
        registry.observe_bitfield(&all).await;
        assert!(registry.in_endgame().await);

        let fresh = granted(registry.request_chunks(addr(1), &all, 10).await);
        assert_eq!(fresh.len(), 2);

        // Second peer duplicates the in-flight chunks.
        let dup = granted(registry.request_chunks(addr(2), &all, 10).await);
        assert_eq!(dup.len(), 2);
        // Nothing further for either peer.
        assert_eq!(registry.request_chunks(addr(2), &all, 10).await, ChunkRequests::NoneAvailable);

        // First delivery wins; the loser is returned for a cancel.
        let others = registry.mark_fetched(&fresh[0], addr(2)).await.unwrap();
        assert_eq!(others, vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_invalidate_reopens_piece() {
        let registry = ChunkRegistry::new(1, CHUNK * 2, CHUNK * 2, CHUNK);
        let all = PieceSet::full(1);
        registry.observe_bitfield(&all).await;

        let chunks = granted(registry.request_chunks(addr(1), &all, 2).await);
        for chunk in &chunks {
            registry.mark_fetched(chunk, addr(1)).await;
            registry.mark_stored(chunk).await;
        }

        registry.invalidate_piece(0).await;
        assert!(!registry.have().await.contains(0));
        // The piece is requestable again from scratch.
        let again = granted(registry.request_chunks(addr(1), &all, 2).await);
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_updates_bitfield() {
        let registry = ChunkRegistry::new(2, CHUNK, CHUNK, CHUNK);
        let all = PieceSet::full(2);
        registry.observe_bitfield(&all).await;

        let chunks = granted(registry.request_chunks(addr(1), &all, 1).await);
        registry.mark_fetched(&chunks[0], addr(1)).await;
        assert_eq!(registry.mark_stored(&chunks[0]).await, Some(chunks[0].piece));

        registry.commit_piece(chunks[0].piece).await;
        assert!(registry.have().await.contains(chunks[0].piece));
        assert_eq!(registry.pieces_left().await, 1);
        assert!(!registry.is_seeding().await);
    }
}
