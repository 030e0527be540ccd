use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use sha1::{Digest, Sha1};
use crate::{
    layout::{Layout, TorrentInfo},
    sched::{ChunkRegistry, ChunkRequests},
    torrent::CommandToTorrent,
    wire::PeerCommand,
};
use super::{spawn, CommandToDisk};

const PIECE_A: [u8; 4] = [0xaa, 0xbb, 0xcc, 0x01];
const PIECE_B: [u8; 4] = [0x02, 0x03, 0x04, 0x05];

fn sha(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn peer() -> SocketAddr {
    "127.0.0.1:51413".parse().unwrap()
}

// a.dat of 3 bytes and b.dat of 5 bytes, 4-byte pieces: piece 0 crosses
// the file boundary.
fn pair_info(piece_hashes: Vec<[u8; 20]>) -> TorrentInfo {
    TorrentInfo {
        info_hash: [7; 20],
        name: "pair".into(),
        piece_len: 4,
        piece_hashes,
        files: vec![(PathBuf::from("a.dat"), 3), (PathBuf::from("b.dat"), 5)],
    }
}

fn registry_for(layout: &Layout) -> Arc<ChunkRegistry> {
    Arc::new(ChunkRegistry::new(
        layout.num_pieces,
        layout.piece_len,
        layout.last_piece_len,
        4,
    ))
}

#[tokio::test]
async fn test_chunks_to_verified_commit() -> anyhow::Result<()> {

    let dir = tempfile::tempdir()?;
    let info = pair_info(vec![sha(&PIECE_A), sha(&PIECE_B)]);
    let layout = Arc::new(Layout::new(&info, dir.path()));
    let registry = registry_for(&layout);
    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, disk_tx) = spawn(Arc::clone(&layout), info.piece_hashes, Arc::clone(&registry), torrent_tx, 2)?;

    let all = crate::PieceSet::full(2);
    registry.observe_bitfield(&all).await;
    let chunks = match registry.request_chunks(peer(), &all, 4).await {
        ChunkRequests::Granted(chunks) => chunks,
        other => panic!("expected chunks, got {:?}", other),
    };
    assert_eq!(chunks.len(), 2);

    for chunk in &chunks {
        assert!(registry.mark_fetched(chunk, peer()).await.is_some());
        let data = if chunk.piece == 0 { PIECE_A } else { PIECE_B };
        disk_tx.send(CommandToDisk::WriteChunk { chunk: *chunk, data: data.to_vec() })?;
    }

    for _ in 0..2 {
        match torrent_rx.recv().await {
            Some(CommandToTorrent::PieceCommitted { valid, .. }) => assert!(valid),
            _ => panic!("expected piece commit"),
        }
    }
    assert!(registry.is_seeding().await);

    // Payload landed in the right files.
    let root = dir.path().join("pair");
    assert_eq!(std::fs::read(root.join("a.dat"))?, vec![0xaa, 0xbb, 0xcc]);
    assert_eq!(std::fs::read(root.join("b.dat"))?, vec![0x01, 0x02, 0x03, 0x04, 0x05]);

    disk_tx.send(CommandToDisk::Shutdown)?;
    Ok(())
}

#[tokio::test]
async fn test_hash_mismatch_reopens_piece() -> anyhow::Result<()> {

    let dir = tempfile::tempdir()?;
    // Piece 0's expected hash will never match the data we feed in.
    let info = pair_info(vec![sha(b"not the data"), sha(&PIECE_B)]);
    let layout = Arc::new(Layout::new(&info, dir.path()));
    let registry = registry_for(&layout);
    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, disk_tx) = spawn(Arc::clone(&layout), info.piece_hashes, Arc::clone(&registry), torrent_tx, 2)?;

    let mut only_first = crate::PieceSet::empty(2);
    only_first.insert(0);
    registry.observe_bitfield(&only_first).await;
    let chunks = match registry.request_chunks(peer(), &only_first, 4).await {
        ChunkRequests::Granted(chunks) => chunks,
        other => panic!("expected chunks, got {:?}", other),
    };
    assert_eq!(chunks.len(), 1);

    registry.mark_fetched(&chunks[0], peer()).await;
    disk_tx.send(CommandToDisk::WriteChunk { chunk: chunks[0], data: PIECE_A.to_vec() })?;

    match torrent_rx.recv().await {
        Some(CommandToTorrent::PieceCommitted { idx, valid }) => {
            assert_eq!(idx, 0);
            assert!(!valid);
        }
        _ => panic!("expected piece commit"),
    }

    // No bit set, and the piece is requestable from scratch.
    assert!(!registry.has_piece(0).await);
    let retry = registry.request_chunks(peer(), &only_first, 4).await;
    assert!(matches!(retry, ChunkRequests::Granted(ref chunks) if chunks.len() == 1), "{:?}", retry);

    disk_tx.send(CommandToDisk::Shutdown)?;
    Ok(())
}

#[tokio::test]
async fn test_serving_reads_back_committed_piece() -> anyhow::Result<()> {

    let dir = tempfile::tempdir()?;
    let info = pair_info(vec![sha(&PIECE_A), sha(&PIECE_B)]);
    let layout = Arc::new(Layout::new(&info, dir.path()));
    let registry = registry_for(&layout);
    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, disk_tx) = spawn(Arc::clone(&layout), info.piece_hashes, Arc::clone(&registry), torrent_tx, 2)?;

    let all = crate::PieceSet::full(2);
    registry.observe_bitfield(&all).await;
    let chunks = match registry.request_chunks(peer(), &all, 4).await {
        ChunkRequests::Granted(chunks) => chunks,
        other => panic!("expected chunks, got {:?}", other),
    };
    for chunk in &chunks {
        registry.mark_fetched(chunk, peer()).await;
        let data = if chunk.piece == 0 { PIECE_A } else { PIECE_B };
        disk_tx.send(CommandToDisk::WriteChunk { chunk: *chunk, data: data.to_vec() })?;
    }
    for _ in 0..2 {
        torrent_rx.recv().await;
    }

    // Now serve a sub-range of piece 0 back out of the read path.
    let (peer_tx, mut peer_rx) = tokio::sync::mpsc::unbounded_channel();
    disk_tx.send(CommandToDisk::ReadChunk {
        chunk: crate::ChunkInfo { piece: 0, offset: 1, len: 3 },
        tx: peer_tx,
    })?;

    match peer_rx.recv().await {
        Some(PeerCommand::ChunkRead(chunk)) => {
            assert_eq!(chunk.piece, 0);
            assert_eq!(chunk.offset, 1);
            assert_eq!(chunk.data, vec![0xbb, 0xcc, 0x01]);
        }
        _ => panic!("expected chunk read"),
    }

    disk_tx.send(CommandToDisk::Shutdown)?;
    Ok(())
}
