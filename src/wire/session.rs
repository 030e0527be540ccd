use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    chunk::{ChunkData, ChunkInfo},
    disk::CommandToDisk,
    pieceset::PieceSet,
    sched::ChunkRequests,
    torrent::{CommandToTorrent, TorrentContext},
    PeerId,
};
use super::{handshake::*, message::*, state::*, PeerCommand, PeerError, PeerRx, PeerTx, Result};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Read-only torrent state shared by all sessions.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the session.
    peer_rx: PeerRx,

    // Internal send handle, loaned to the disk task for read replies.
    peer_tx: PeerTx,

    // Known after the handshake.
    peer_id: Option<PeerId>,

    // The peer's piece set; unknown until the first bitfield, have or
    // have-all/have-none message.
    remote_pieces: Option<PieceSet>,

    // Pieces the peer is still missing; zero marks a seeder.
    pieces_left: usize,

    // Chunk requests from the peer awaiting our piece messages.
    requests_in: HashSet<ChunkInfo>,

    // Chunk requests we have in flight with the peer.
    requests_out: HashSet<ChunkInfo>,

    // Pieces the peer permits requesting while it chokes us. Advisory.
    allowed_fast: HashSet<usize>,

    state: SessionState,

    last_rx: Instant,

    last_tx: Instant,

    // Start of the open throughput report window.
    last_tick: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                peer_id: None,
                remote_pieces: None,
                pieces_left: 0,
                requests_in: HashSet::new(),
                requests_out: HashSet::new(),
                allowed_fast: HashSet::new(),
                state: SessionState::default(),
                last_rx: Instant::now(),
                last_tx: Instant::now(),
                last_tick: Instant::now(),
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let timeout = self.torrent_ctx.config.handshake_timeout;
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        time::timeout(timeout, self.exchange_handshake(&mut socket, inbound))
            .await
            .map_err(|_| PeerError::Timeout)??;

        // Carry over anything the peer pipelined behind its handshake.
        let old_parts = socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, MessageCodec);
        parts.read_buf = old_parts.read_buf;
        self.run(Framed::from_parts(parts)).await
    }

    // Session teardown: every in-flight chunk goes back to the registry.
    pub async fn disconnect(&mut self, bad: bool) {
        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.torrent_ctx.registry.mark_all_dropped(self.address).await;
        self.torrent_ctx
            .torrent_tx
            .send(CommandToTorrent::PeerDisconnected {
                address: self.address,
                id: self.peer_id,
                state: self.state,
                bad,
            })
            .ok();
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let ours = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.config.client_id);

        if !inbound {
            tracing::info!("send handshake");
            socket.send(ours).await?;
        }

        tracing::trace!("waiting for handshake");
        if let Some(Ok(theirs)) = socket.next().await {
            tracing::info!("read: {:?}", theirs);

            if theirs.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if theirs.info_hash != self.torrent_ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }

            // Respond with our record if the connection is inbound.
            if inbound {
                tracing::info!("send handshake");
                let ours = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.config.client_id);
                socket.send(ours).await?;
            }

            // Capabilities hold only when both sides advertise them; our
            // record always does.
            self.state.update(|state| {
                state.fast = theirs.supports_fast();
                state.extended = theirs.supports_extended();
            });
            self.peer_id = Some(theirs.peer_id);
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerConnected {
                address: self.address,
                id: theirs.peer_id,
            })?;

            tracing::info!("handshake successful, peer connected");
            Ok(())

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Introducing);
        self.last_rx = Instant::now();
        self.last_tx = Instant::now();
        self.last_tick = Instant::now();
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(time::Duration::from_secs(1));

        self.introduce(&mut sink).await?;

        loop { tokio::select! {

            // Message from peer; decode errors are fatal.
            msg = stream.next() => match msg {
                Some(msg) => self.handle_msg(&mut sink, msg?).await?,
                None => {
                    tracing::info!("peer closed connection");
                    break;
                }
            },

            // Command from elsewhere in the engine.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::ChunkRead(chunk) => self.send_chunk(&mut sink, chunk).await?,

                    PeerCommand::PieceStored(idx) => self.handle_piece_stored(&mut sink, idx).await?,

                    PeerCommand::CancelChunk(chunk) => self.handle_losing_race(&mut sink, chunk).await?,

                    PeerCommand::Choke => self.handle_policy_choke(&mut sink).await?,

                    PeerCommand::Unchoke => self.handle_policy_unchoke(&mut sink).await?,

                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },

                }
            }

            _ = ticker.tick() => self.tick(&mut sink).await?,

        }}

        Ok(())
    }

    // Right after the handshake each side declares what it has.
    async fn introduce(&mut self, sink: &mut MessageSink) -> Result<()> {

        let have = self.torrent_ctx.registry.have().await;
        let msg = if self.state.fast && have.is_full() {
            Message::HaveAll
        } else if self.state.fast && have.is_empty() {
            Message::HaveNone
        } else {
            Message::Bitfield(have.serialize())
        };
        self.send_message(sink, msg).await?;

        if self.state.extended {
            // Empty payload; we don't consume extension data.
            self.send_message(sink, Message::Extended { id: 0, payload: vec![] }).await?;
        }
        Ok(())
    }

    // Logs a message and sends it to the peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        sink.send(msg).await?;
        self.last_tx = Instant::now();
        Ok(())
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);
        self.last_rx = Instant::now();

        match msg {

            Message::KeepAlive => {},

            // Bitfield is only valid while the piece set is unknown.
            Message::Bitfield(bytes) => {
                if self.remote_pieces.is_some() {
                    tracing::error!("bitfield after piece set was known");
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, &bytes).await?;
            },

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Without the fast extension nothing in flight will be
                    // answered; free it all for other peers. With it the
                    // peer owes a reject or piece per request.
                    if !self.state.fast {
                        self.torrent_ctx.registry.mark_all_dropped(self.address).await;
                        self.requests_out.clear();
                    }
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    self.fill_requests(sink).await?;
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    // The choke policy reacts through the state report.
                    self.state.update(|state| state.peer_interested = true);
                }
            },

            Message::NotInterested => {
                if self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = false);
                }
            },

            Message::Have { idx } => self.handle_have(sink, idx as usize).await?,

            Message::HaveAll => {
                self.require_fast()?;
                self.handle_have_summary(sink, true).await?;
            },

            Message::HaveNone => {
                self.require_fast()?;
                self.handle_have_summary(sink, false).await?;
            },

            Message::Request(chunk) => self.handle_request(sink, chunk).await?,

            Message::Piece(chunk) => self.handle_piece(sink, chunk).await?,

            Message::Cancel(chunk) => {
                self.requests_in.remove(&chunk);
            },

            Message::Reject(chunk) => {
                self.require_fast()?;
                if self.requests_out.remove(&chunk) {
                    self.torrent_ctx.registry.mark_dropped(&chunk, self.address).await;
                } else {
                    tracing::trace!("reject for chunk not in flight: {:?}", chunk);
                }
            },

            Message::Suggest { idx } => {
                self.require_fast()?;
                // Advisory; selection stays with the registry.
                tracing::trace!("peer suggests piece {}", idx);
            },

            Message::AllowedFast { idx } => {
                self.require_fast()?;
                if idx as usize >= self.torrent_ctx.layout.num_pieces {
                    return Err(PeerError::InvalidMessage);
                }
                self.allowed_fast.insert(idx as usize);
            },

            Message::Port { port: _ } => {},

            Message::Extended { id, payload: _ } => {
                if !self.state.extended {
                    return Err(PeerError::ExtendedNotNegotiated);
                }
                tracing::trace!("extended message id {} ignored", id);
            },
        }

        if self.state.conn_state == ConnState::Introducing && self.remote_pieces.is_some() {
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, bytes: &[u8]) -> Result<()> {

        let num_pieces = self.torrent_ctx.layout.num_pieces;
        let pieces = PieceSet::parse(bytes, num_pieces)?;
        tracing::info!("peer has {}/{} pieces", pieces.count(), num_pieces);

        self.pieces_left = num_pieces - pieces.count();
        self.state.update(|state| {
            state.num_pieces = pieces.count();
            state.seeder = pieces.is_full();
        });

        let interested = self.torrent_ctx.registry.observe_bitfield(&pieces).await;
        self.remote_pieces = Some(pieces);
        self.update_interest(sink, interested).await
    }

    // Fast-extension replacement for an all-ones or all-zeros bitfield.
    async fn handle_have_summary(&mut self, sink: &mut MessageSink, all: bool) -> Result<()> {

        if self.remote_pieces.is_some() {
            tracing::error!("have-all/have-none after piece set was known");
            return Err(PeerError::InvalidMessage);
        }
        let num_pieces = self.torrent_ctx.layout.num_pieces;
        let pieces = if all { PieceSet::full(num_pieces) } else { PieceSet::empty(num_pieces) };

        self.pieces_left = num_pieces - pieces.count();
        self.state.update(|state| {
            state.num_pieces = pieces.count();
            state.seeder = all;
        });

        let interested = self.torrent_ctx.registry.observe_bitfield(&pieces).await;
        self.remote_pieces = Some(pieces);
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        // If idx is not valid, disconnect.
        if idx >= self.torrent_ctx.layout.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }

        // A have before any bitfield implies an otherwise empty set.
        let num_pieces = self.torrent_ctx.layout.num_pieces;
        if self.remote_pieces.is_none() {
            self.pieces_left = num_pieces;
        }
        let pieces = self.remote_pieces.get_or_insert_with(|| PieceSet::empty(num_pieces));
        if !pieces.insert(idx) {
            // Peer already had the piece.
            return Ok(());
        }
        self.pieces_left -= 1;
        let seeder = self.pieces_left == 0;
        self.state.update(|state| {
            state.num_pieces += 1;
            state.seeder = seeder;
        });

        let interesting = self.torrent_ctx.registry.observe_have(idx).await;
        self.update_interest(sink, interesting).await
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, chunk: ChunkInfo) -> Result<()> {

        if !chunk.is_valid(&self.torrent_ctx.layout) {
            tracing::error!("invalid request: {:?}", chunk);
            return Err(PeerError::InvalidMessage);
        }

        // While choking, fast peers get an explicit reject; others are
        // silently ignored.
        if self.state.am_choking {
            if self.state.fast {
                self.send_message(sink, Message::Reject(chunk)).await?;
            }
            return Ok(());
        }

        if !self.torrent_ctx.registry.has_piece(chunk.piece).await {
            tracing::warn!("request for piece we lack: {:?}", chunk);
            if self.state.fast {
                self.send_message(sink, Message::Reject(chunk)).await?;
            }
            return Ok(());
        }

        if !self.requests_in.insert(chunk) {
            tracing::warn!("duplicate request: {:?}", chunk);
            return Ok(());
        }
        self.torrent_ctx.disk_tx.send(CommandToDisk::ReadChunk {
            chunk,
            tx: self.peer_tx.clone(),
        })?;

        Ok(())
    }

    async fn handle_piece(&mut self, sink: &mut MessageSink, chunk: ChunkData) -> Result<()> {

        let info = chunk.info();
        if !self.requests_out.remove(&info) {
            // Stray data is dropped without a state change.
            tracing::trace!("chunk not in flight, dropped: {:?}", info);
            return Ok(());
        }
        self.state.update(|state| state.throughput.down += chunk.data.len() as u64);

        match self.torrent_ctx.registry.mark_fetched(&info, self.address).await {
            Some(losers) => {
                self.torrent_ctx.disk_tx.send(CommandToDisk::WriteChunk {
                    chunk: info,
                    data: chunk.data,
                })?;
                // In endgame the same chunk rides with other peers; they
                // get cancels through the coordinator.
                if !losers.is_empty() {
                    self.torrent_ctx.torrent_tx.send(CommandToTorrent::CancelDuplicates {
                        chunk: info,
                        peers: losers,
                    })?;
                }
            },
            None => tracing::trace!("chunk already delivered elsewhere: {:?}", info),
        }

        self.fill_requests(sink).await
    }

    // When the coordinator announces a committed piece:
    // - send a have message unless the peer already has it,
    // - step out of interested if nothing is left to want.
    async fn handle_piece_stored(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        let peer_has = matches!(&self.remote_pieces, Some(pieces) if pieces.contains(idx));
        if !peer_has {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }

        if self.state.am_interested {
            if let Some(pieces) = &self.remote_pieces {
                if !self.torrent_ctx.registry.check_interest(pieces).await {
                    self.state.update(|state| state.am_interested = false);
                    self.send_message(sink, Message::NotInterested).await?;
                }
            }
        }
        Ok(())
    }

    // Endgame: another peer delivered the chunk first.
    async fn handle_losing_race(&mut self, sink: &mut MessageSink, chunk: ChunkInfo) -> Result<()> {
        if self.requests_out.remove(&chunk) {
            self.send_message(sink, Message::Cancel(chunk)).await?;
        }
        Ok(())
    }

    async fn handle_policy_choke(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.am_choking {
            return Ok(());
        }
        self.state.update(|state| state.am_choking = true);
        self.send_message(sink, Message::Choke).await?;

        // Fast peers are owed an answer for every queued request.
        let queued: Vec<_> = self.requests_in.drain().collect();
        if self.state.fast {
            for chunk in queued {
                self.send_message(sink, Message::Reject(chunk)).await?;
            }
        }
        Ok(())
    }

    async fn handle_policy_unchoke(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.state.am_choking {
            return Ok(());
        }
        self.state.update(|state| state.am_choking = false);
        self.send_message(sink, Message::Unchoke).await
    }

    /// Tops the request queue back up to the high watermark, once it has
    /// drained below the low watermark.
    async fn fill_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.am_interested {
            return Ok(());
        }
        if self.requests_out.len() > self.torrent_ctx.config.low_watermark {
            return Ok(());
        }
        let Some(pieces) = &self.remote_pieces else { return Ok(()) };
        let want = self.torrent_ctx.config.high_watermark - self.requests_out.len();
        let granted = self.torrent_ctx.registry.request_chunks(self.address, pieces, want).await;

        match granted {

            ChunkRequests::Granted(chunks) => {
                for chunk in chunks {
                    tracing::trace!("send request: {:?}", chunk);
                    self.requests_out.insert(chunk);
                    self.send_message(sink, Message::Request(chunk)).await?;
                }
            },

            ChunkRequests::NotInterested => {
                if self.state.am_interested {
                    self.state.update(|state| state.am_interested = false);
                    self.send_message(sink, Message::NotInterested).await?;
                }
            },

            ChunkRequests::NoneAvailable => {},
        }

        Ok(())
    }

    // If we have become interested, say so and start requesting.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if interested && !self.state.am_interested {
            self.state.update(|state| state.am_interested = true);
            self.send_message(sink, Message::Interested).await?;
            self.fill_requests(sink).await?;
        }
        Ok(())
    }

    // Serve a chunk the disk task read for us, unless the request was
    // cancelled or the choke flipped meanwhile.
    async fn send_chunk(&mut self, sink: &mut MessageSink, chunk: ChunkData) -> Result<()> {

        let info = chunk.info();
        if !self.requests_in.remove(&info) {
            tracing::trace!("chunk read but request gone: {:?}", info);
            return Ok(());
        }
        if self.state.am_choking {
            return Ok(());
        }
        self.state.update(|state| state.throughput.up += info.len as u64);
        self.send_message(sink, Message::Piece(chunk)).await
    }

    fn require_fast(&self) -> Result<()> {
        if self.state.fast {
            Ok(())
        } else {
            Err(PeerError::FastNotNegotiated)
        }
    }

    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {

        let now = Instant::now();
        if now.saturating_duration_since(self.last_rx) >= self.torrent_ctx.config.keep_alive_timeout {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }
        if now.saturating_duration_since(self.last_tx) >= self.torrent_ctx.config.keep_alive_timeout / 2 {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.state.tick(elapsed);

        // Report stats if there was a state change.
        if self.state.changed {
            self.state.changed = false;
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }

        Ok(())
    }
}
