use std::time::Duration;
use crate::stats::Throughput;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub am_choking: bool,

    // Whether we are interested in the peer's pieces.
    pub am_interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    // Negotiated in the handshake's reserved bytes.
    pub fast: bool,
    pub extended: bool,

    // The peer has every piece.
    pub seeder: bool,

    pub num_pieces: usize,

    pub throughput: Throughput,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            fast: false,
            extended: false,
            seeder: false,
            num_pieces: 0,
            throughput: Throughput::default(),
            changed: false,
        }
    }
}

impl SessionState {

    // Closes the throughput report window spanning `elapsed`.
    pub fn tick(&mut self, elapsed: Duration) {
        self.throughput.flush(elapsed);
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
