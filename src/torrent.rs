use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use crate::{
    chunk::ChunkInfo,
    config::Config,
    disk::{self, CommandToDisk, DiskTx},
    layout::{Layout, TorrentInfo},
    sched::ChunkRegistry,
    stats::TransferTotals,
    swarm::Swarm,
    wire::{state::SessionState, PeerCommand, PeerHandle},
    InfoHash, PeerId,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disk error: {0}")]
    Disk(#[from] disk::DiskError),

    #[error("torrent already running")]
    AlreadyRunning,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands that can be sent to a torrent from sessions, the disk task
// and the embedding client.
pub enum CommandToTorrent {

    // Addresses from peer discovery.
    AddPeers(Vec<SocketAddr>),

    // Sent by a session when its handshake completes.
    PeerConnected { address: SocketAddr, id: PeerId },

    // Periodic session state snapshot.
    PeerState { address: SocketAddr, state: SessionState },

    // Session ended; `bad` marks a protocol violation.
    PeerDisconnected {
        address: SocketAddr,
        id: Option<PeerId>,
        state: SessionState,
        bad: bool,
    },

    // Sent by the disk task after hashing a completed piece.
    PieceCommitted { idx: usize, valid: bool },

    // Endgame: `peers` still carry an assignment for a chunk someone
    // else just delivered.
    CancelDuplicates { chunk: ChunkInfo, peers: Vec<SocketAddr> },

    // Decisions of the external choke policy.
    SetChoke { address: SocketAddr, choke: bool },

    Shutdown,

}

// Read-only state shared with every peer session.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: InfoHash,

    pub layout: Arc<Layout>,

    pub registry: Arc<ChunkRegistry>,

    pub torrent_tx: TorrentTx,

    pub disk_tx: DiskTx,

    pub config: Config,

}

/// Client-side handle to a running torrent.
#[derive(Debug, Clone)]
pub struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    // Transfer totals for the tracker collaborator's announces.
    pub totals: watch::Receiver<TransferTotals>,

    pub listen_address: SocketAddr,

}

impl TorrentHandle {

    pub fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<()> {
        Ok(self.torrent_tx.send(CommandToTorrent::AddPeers(peers))?)
    }

    pub fn set_choke(&self, address: SocketAddr, choke: bool) -> Result<()> {
        Ok(self.torrent_tx.send(CommandToTorrent::SetChoke { address, choke })?)
    }

    pub fn shutdown(&self) -> Result<()> {
        Ok(self.torrent_tx.send(CommandToTorrent::Shutdown)?)
    }
}

/// Coordinator for one torrent: owns the swarm, the chunk registry and
/// the disk task, and routes events between them.
pub struct Torrent {

    ctx: Arc<TorrentContext>,

    swarm: Swarm,

    torrent_rx: TorrentRx,

    // Bound in new() so the handle can expose the address; converted to
    // a tokio listener once run() starts.
    listener: Option<std::net::TcpListener>,

    listen_address: SocketAddr,

    disk_handle: Option<JoinHandle<disk::Result<()>>>,

    totals_tx: watch::Sender<TransferTotals>,

    // Upload throughput of sessions that already disconnected.
    departed_up: u64,

    // Bytes of verified, committed pieces.
    downloaded: u64,

    // Bytes missing from verified pieces.
    left: u64,

    hash_failures: u64,

}

impl Torrent {

    pub fn new(info: TorrentInfo, config: Config) -> Result<(Self, TorrentHandle)> {

        let layout = Arc::new(Layout::new(&info, &config.download_dir));
        let registry = Arc::new(ChunkRegistry::new(
            layout.num_pieces,
            layout.piece_len,
            layout.last_piece_len,
            config.chunk_size,
        ));

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = disk::spawn(
            Arc::clone(&layout),
            info.piece_hashes,
            Arc::clone(&registry),
            torrent_tx.clone(),
            config.max_open_files,
        )?;

        let listener = std::net::TcpListener::bind(config.listen_address)?;
        listener.set_nonblocking(true)?;
        let listen_address = listener.local_addr()?;

        let left = layout.total_len;
        let (totals_tx, totals_rx) = watch::channel(TransferTotals {
            uploaded: 0,
            downloaded: 0,
            left,
        });

        let ctx = Arc::new(TorrentContext {
            info_hash: info.info_hash,
            layout,
            registry,
            torrent_tx: torrent_tx.clone(),
            disk_tx,
            config,
        });

        let handle = TorrentHandle {
            torrent_tx,
            totals: totals_rx,
            listen_address,
        };

        Ok((
            Torrent {
                ctx,
                swarm: Swarm::new(),
                torrent_rx,
                listener: Some(listener),
                listen_address,
                disk_handle: Some(disk_handle),
                totals_tx,
                departed_up: 0,
                downloaded: 0,
                left,
                hash_failures: 0,
            },
            handle,
        ))
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    pub async fn run(&mut self) -> Result<()> {

        let listener = self.listener.take().ok_or(TorrentError::AlreadyRunning)?;
        let listener = TcpListener::from_std(listener)?;
        tracing::info!("listening on {}", self.listen_address);

        loop { tokio::select! {

            new_peer_conn = listener.accept() => {
                match new_peer_conn {
                    Ok((stream, address)) => self.accept_peer(stream, address),
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::AddPeers(peers) => self.connect_to_peers(peers),

                    CommandToTorrent::PeerConnected { address, id } => {
                        if !self.swarm.register_id(address, id) {
                            tracing::warn!("duplicate session for peer id, closing {}", address);
                            self.swarm.send_to(&address, PeerCommand::Shutdown);
                        }
                    },

                    CommandToTorrent::PeerState { address, state } => {
                        if let Some(handle) = self.swarm.get_mut(&address) {
                            handle.state = state;
                        }
                        self.publish_totals();
                    },

                    CommandToTorrent::PeerDisconnected { address, id, state, bad } => {
                        if bad {
                            self.swarm.enter_bad(address, id);
                        }
                        self.departed_up += state.throughput.up.total();
                        self.swarm.remove(&address);
                        self.publish_totals();
                    },

                    CommandToTorrent::PieceCommitted { idx, valid } => {
                        self.handle_piece_committed(idx, valid).await;
                    },

                    CommandToTorrent::CancelDuplicates { chunk, peers } => {
                        for address in peers {
                            self.swarm.send_to(&address, PeerCommand::CancelChunk(chunk));
                        }
                    },

                    CommandToTorrent::SetChoke { address, choke } => {
                        let cmd = if choke { PeerCommand::Choke } else { PeerCommand::Unchoke };
                        self.swarm.send_to(&address, cmd);
                    },

                    CommandToTorrent::Shutdown => {
                        self.shutdown().await;
                        break;
                    },
                }
            }
        }}

        Ok(())
    }

    fn accept_peer(&mut self, stream: TcpStream, address: SocketAddr) {

        if self.swarm.len() >= self.ctx.config.max_peers {
            tracing::warn!("peer slots exhausted, rejecting {}", address);
            return;
        }
        if self.swarm.is_bad(&address) {
            tracing::warn!("rejecting bad peer {}", address);
            return;
        }
        if self.swarm.contains(&address) {
            tracing::warn!("rejecting duplicate connection from {}", address);
            return;
        }

        let handle = PeerHandle::start_session(address, Arc::clone(&self.ctx), Some(stream));
        self.swarm.insert(address, handle);
    }

    fn connect_to_peers(&mut self, peers: Vec<SocketAddr>) {
        for address in peers {
            if self.swarm.len() >= self.ctx.config.max_peers {
                tracing::warn!("peer slots exhausted, not connecting further");
                break;
            }
            if self.swarm.contains(&address) || self.swarm.is_bad(&address) {
                continue;
            }
            let handle = PeerHandle::start_session(address, Arc::clone(&self.ctx), None);
            self.swarm.insert(address, handle);
        }
    }

    async fn handle_piece_committed(&mut self, idx: usize, valid: bool) {

        if valid {
            let piece_len = self.ctx.layout.piece_len(idx) as u64;
            self.downloaded += piece_len;
            self.left = self.left.saturating_sub(piece_len);
            let remaining = self.ctx.registry.pieces_left().await;
            tracing::info!("piece {} committed, {} pieces remain", idx, remaining);

            self.swarm.broadcast_have(idx);
            self.publish_totals();

            if remaining == 0 {
                tracing::info!("download complete, seeding");
            }

        } else {
            // The registry already reopened the piece; peers will
            // re-request its chunks.
            self.hash_failures += 1;
            tracing::warn!("piece {} failed verification ({} failures so far)", idx, self.hash_failures);
        }
    }

    fn publish_totals(&self) {
        let mut uploaded = self.departed_up;
        for state in self.swarm.states() {
            uploaded += state.throughput.up.total();
        }
        self.totals_tx.send_replace(TransferTotals {
            uploaded,
            downloaded: self.downloaded,
            left: self.left,
        });
    }

    async fn shutdown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.swarm.len());
        self.swarm.shutdown_all();
        let peers: Vec<_> = self.swarm.drain().collect();
        for (address, handle) in peers {
            if handle.session_handle.await.is_err() {
                tracing::warn!("session task for {} panicked", address);
            }
        }

        self.ctx.disk_tx.send(CommandToDisk::Shutdown).ok();
        if let Some(disk_handle) = self.disk_handle.take() {
            match disk_handle.await {
                Ok(Err(e)) => tracing::warn!("disk shutdown error: {}", e),
                Err(_) => tracing::warn!("disk task panicked"),
                Ok(Ok(())) => {},
            }
        }
    }
}
