use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Capability bits in the 8 reserved handshake bytes.
const FAST_BYTE: usize = 7;
const FAST_BIT: u8 = 0x04;
const EXTENDED_BYTE: usize = 5;
const EXTENDED_BIT: u8 = 0x10;

pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0; 8];
        reserved[FAST_BYTE] |= FAST_BIT;
        reserved[EXTENDED_BYTE] |= EXTENDED_BIT;
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_BYTE] & FAST_BIT != 0
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[EXTENDED_BYTE] & EXTENDED_BIT != 0
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Fixed 68-byte record: pstrlen, pstr, reserved, info hash, peer id.
        dst.reserve(68);
        dst.put_u8(item.protocol.len() as u8);
        dst.put_slice(&item.protocol);
        dst.put_slice(&item.reserved);
        dst.put_slice(&item.info_hash);
        dst.put_slice(&item.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.remaining() < 68 {
            // Handshake not fully received.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}
