use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    chunk::{ChunkData, ChunkInfo},
    pieceset::PieceSetError,
    torrent::TorrentContext,
    PeerId,
};

mod handshake;
mod message;
mod session;
pub mod state;

pub use message::{Message, MessageCodec};
pub use session::PeerSession;
use state::SessionState;

pub type Result<T> = std::result::Result<T, PeerError>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield after piece set was already known")]
    UnexpectedBitfield,

    #[error(transparent)]
    InvalidBitfield(#[from] PieceSetError),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("fast-extension message without negotiation")]
    FastNotNegotiated,

    #[error("extended message without negotiation")]
    ExtendedNotNegotiated,

    #[error("connection timeout")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

impl PeerError {
    // Violations that should put the peer on the bad list.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::IncorrectProtocol
                | PeerError::IncorrectInfoHash
                | PeerError::InvalidMessageId(_)
                | PeerError::UnexpectedBitfield
                | PeerError::InvalidBitfield(_)
                | PeerError::InvalidMessage
                | PeerError::FastNotNegotiated
                | PeerError::ExtendedNotNegotiated
        )
    }
}

// Commands that can be sent to a peer session.
pub enum PeerCommand {

    // Chunk read from disk for serving.
    ChunkRead(ChunkData),

    // A piece was verified and committed; announce it if worthwhile.
    PieceStored(usize),

    // Endgame: another peer delivered this chunk first.
    CancelChunk(ChunkInfo),

    // Choke policy decisions.
    Choke,
    Unchoke,

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Commands to the session.
    pub peer_tx: PeerTx,

    pub session_handle: JoinHandle<()>,

    // Known after the handshake.
    pub id: Option<PeerId>,

    // Latest state snapshot reported by the session.
    pub state: SessionState,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<TcpStream>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(
            async move {
                let bad = match session.start(socket).await {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::error!("session error: {}", e);
                        e.is_protocol_violation()
                    }
                };
                session.disconnect(bad).await;
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx,
            session_handle,
            id: None,
            state: SessionState::default(),
        }
    }
}
