use std::{num::NonZeroUsize, sync::Arc};
use tokio::{sync::mpsc, task};
use crate::{
    chunk::{ChunkData, ChunkInfo},
    layout::Layout,
    sched::ChunkRegistry,
    torrent::{CommandToTorrent, TorrentTx},
    wire::{PeerCommand, PeerTx},
};

pub mod directory;
mod piece;
mod worker;
#[cfg(test)]
mod tests;

use directory::FileDirectory;

// Whole pieces cached for serving uploads.
const READ_CACHE_PIECES: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("file handle is closed")]
    FileClosed,

    #[error("channel error: {0}")]
    ChannelError(String),

}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

pub enum CommandToDisk {

    // Chunk delivered by a peer, to be scattered over its file spans.
    WriteChunk {
        chunk: ChunkInfo,
        data: Vec<u8>,
    },

    // Chunk a peer asked for; read and sent back through the session.
    ReadChunk {
        chunk: ChunkInfo,
        tx: PeerTx,
    },

    Shutdown,

}

/// Disk task: owns the file directory, stores chunks, and runs the
/// verify-and-commit pipeline one piece at a time.
pub struct Disk {

    layout: Arc<Layout>,

    piece_hashes: Vec<[u8; 20]>,

    registry: Arc<ChunkRegistry>,

    directory: FileDirectory,

    read_cache: lru::LruCache<usize, Arc<Vec<u8>>>,

    disk_rx: DiskRx,

    torrent_tx: TorrentTx,

}

pub fn spawn(
    layout: Arc<Layout>,
    piece_hashes: Vec<[u8; 20]>,
    registry: Arc<ChunkRegistry>,
    torrent_tx: TorrentTx,
    max_open_files: usize,
) -> Result<(task::JoinHandle<Result<()>>, DiskTx)> {

    tracing::info!("spawning disk task");
    let directory = FileDirectory::new(&layout.root, &layout.files, max_open_files)?;
    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    let mut disk = Disk {
        layout,
        piece_hashes,
        registry,
        directory,
        read_cache: lru::LruCache::new(NonZeroUsize::new(READ_CACHE_PIECES).unwrap()),
        disk_rx,
        torrent_tx,
    };
    let handle = task::spawn(async move { disk.run().await });
    Ok((handle, disk_tx))
}

impl Disk {

    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(&mut self) -> Result<()> {

        self.allocate_all().await?;

        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                CommandToDisk::WriteChunk { chunk, data } => self.write_chunk(chunk, data).await?,

                CommandToDisk::ReadChunk { chunk, tx } => self.read_chunk(chunk, tx).await,

                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                }

            }
        }

        self.directory.shutdown();
        Ok(())
    }

    // Pre-allocates every payload file to its final size.
    async fn allocate_all(&mut self) -> Result<()> {
        for file in 0..self.layout.files.len() {
            let len = self.layout.files[file].len;
            self.directory.allocate(file, len).await?;
        }
        tracing::info!("allocated {} files, {} bytes", self.layout.files.len(), self.layout.total_len);
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: ChunkInfo, data: Vec<u8>) -> Result<()> {

        tracing::trace!("write chunk: {:?}", chunk);
        let spans = self.layout.chunk_spans(&chunk);
        if let Err(e) = piece::write_spans(&mut self.directory, &spans, &data).await {
            // Transient: throw the piece back so it gets re-requested.
            tracing::warn!("chunk write failed, dropping piece {}: {}", chunk.piece, e);
            self.registry.invalidate_piece(chunk.piece).await;
            return Ok(());
        }

        if let Some(idx) = self.registry.mark_stored(&chunk).await {
            self.commit_piece(idx).await?;
        }
        Ok(())
    }

    // Read the piece back, hash it, and either publish or discard it.
    async fn commit_piece(&mut self, idx: usize) -> Result<()> {

        let spans = self.layout.piece_spans(idx);
        let len = self.layout.piece_len(idx);
        let data = match piece::read_spans(&mut self.directory, &spans, len).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("piece {} read-back failed: {}", idx, e);
                self.registry.invalidate_piece(idx).await;
                return Ok(());
            }
        };

        if piece::verify(&data, &self.piece_hashes[idx]) {
            tracing::trace!("piece {} hash verified", idx);
            self.registry.commit_piece(idx).await;
            self.read_cache.put(idx, Arc::new(data));
            self.torrent_tx
                .send(CommandToTorrent::PieceCommitted { idx, valid: true })?;
        } else {
            tracing::warn!("piece {} failed hash verification", idx);
            self.registry.invalidate_piece(idx).await;
            self.torrent_tx
                .send(CommandToTorrent::PieceCommitted { idx, valid: false })?;
        }
        Ok(())
    }

    async fn read_chunk(&mut self, chunk: ChunkInfo, tx: PeerTx) {

        let data = if let Some(cached) = self.read_cache.get(&chunk.piece) {
            tracing::trace!("cache hit for piece {}", chunk.piece);
            Arc::clone(cached)
        } else {
            let spans = self.layout.piece_spans(chunk.piece);
            let len = self.layout.piece_len(chunk.piece);
            match piece::read_spans(&mut self.directory, &spans, len).await {
                Ok(data) => {
                    let data = Arc::new(data);
                    self.read_cache.put(chunk.piece, Arc::clone(&data));
                    data
                }
                Err(e) => {
                    tracing::warn!("read of piece {} for serving failed: {}", chunk.piece, e);
                    return;
                }
            }
        };

        if chunk.offset + chunk.len > data.len() {
            tracing::warn!("chunk out of piece range: {:?}", chunk);
            return;
        }
        tx.send(PeerCommand::ChunkRead(ChunkData {
            piece: chunk.piece,
            offset: chunk.offset,
            data: data[chunk.offset..chunk.offset + chunk.len].to_vec(),
        }))
        .ok();
    }
}
