use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::{chunk::DEFAULT_CHUNK_SIZE, PeerId};

const DEFAULT_CLIENT_ID: PeerId = *b"-PW0010-73b3b0b0b0b0";

#[derive(Debug, Clone)]
pub struct Config {

    pub download_dir: PathBuf,

    pub listen_address: SocketAddr,

    // Open file handles the engine converges to at steady state.
    pub max_open_files: usize,

    pub chunk_size: usize,

    // Stop topping up a peer's request queue above this many in-flight.
    pub low_watermark: usize,

    // Target in-flight requests per unchoked peer.
    pub high_watermark: usize,

    pub handshake_timeout: Duration,

    // Peers idle beyond this are dropped; we transmit keep-alives at
    // half this interval.
    pub keep_alive_timeout: Duration,

    pub max_peers: usize,

    pub client_id: PeerId,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            max_open_files: 128,
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_watermark: 5,
            high_watermark: 30,
            handshake_timeout: Duration::from_secs(120),
            keep_alive_timeout: Duration::from_secs(120),
            max_peers: 60,
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}
