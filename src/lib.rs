mod chunk;
mod config;
mod disk;
mod layout;
mod pieceset;
mod sched;
mod stats;
mod swarm;
mod torrent;
mod wire;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// 20-byte identifier exchanged in the handshake.
pub type PeerId = [u8; 20];

/// SHA-1 of the metainfo's info dictionary.
pub type InfoHash = [u8; 20];

pub use chunk::{ChunkData, ChunkInfo, DEFAULT_CHUNK_SIZE};
pub use config::Config;
pub use disk::DiskError;
pub use layout::{FileEntry, Layout, Span, TorrentInfo};
pub use pieceset::{PieceSet, PieceSetError};
pub use stats::{Flow, Throughput, TransferTotals};
pub use torrent::{CommandToTorrent, Torrent, TorrentError, TorrentHandle};
pub use wire::state::{ConnState, SessionState};
