use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::chunk::{ChunkData, ChunkInfo};
use super::PeerError;

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq, Eq)]
pub enum Message {

    // Advises the peer not to close the connection even if nothing has
    // been transferred for a while.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // We intend to request chunks from the peer.
    Interested,

    NotInterested,

    // The sender acquired the piece at this index.
    Have { idx: u32 },

    // Raw piece-set bytes, sent once right after the handshake.
    Bitfield(Vec<u8>),

    Request(ChunkInfo),

    // Chunk payload: piece index, offset within the piece, data.
    Piece(ChunkData),

    Cancel(ChunkInfo),

    // DHT listen port; this engine ignores it.
    Port { port: u16 },

    // Fast extension: a hint which piece to request next.
    Suggest { idx: u32 },

    // Fast extension: replaces an all-ones / all-zeros bitfield.
    HaveAll,
    HaveNone,

    // Fast extension: the request will never be served.
    Reject(ChunkInfo),

    // Fast extension: pieces requestable even while choked.
    AllowedFast { idx: u32 },

    // BEP-10 extended messaging; payloads are opaque here.
    Extended { id: u8, payload: Vec<u8> },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            }

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bytes) => {
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(&bytes);
            }

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(chunk) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(chunk.piece as u32);
                dst.put_u32(chunk.offset as u32);
                dst.put_u32(chunk.len as u32);
            }

            // piece: <len=0009+X><id=7><index><begin><data>
            Message::Piece(chunk) => {
                dst.put_u32(9 + chunk.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(chunk.piece as u32);
                dst.put_u32(chunk.offset as u32);
                dst.extend_from_slice(&chunk.data);
            }

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(chunk) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(chunk.piece as u32);
                dst.put_u32(chunk.offset as u32);
                dst.put_u32(chunk.len as u32);
            }

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            }

            // suggest: <len=0005><id=13><piece index>
            Message::Suggest { idx } => {
                dst.put_u32(5);
                dst.put_u8(13);
                dst.put_u32(idx);
            }

            // <len=0001><id=14>
            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(14);
            }

            // <len=0001><id=15>
            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(15);
            }

            // reject: <len=0013><id=16><index><begin><length>
            Message::Reject(chunk) => {
                dst.put_u32(13);
                dst.put_u8(16);
                dst.put_u32(chunk.piece as u32);
                dst.put_u32(chunk.offset as u32);
                dst.put_u32(chunk.len as u32);
            }

            // allowed fast: <len=0005><id=17><piece index>
            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(17);
                dst.put_u32(idx);
            }

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;

        if src.remaining() < 4 + msg_len {
            // Haven't received all of the message.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        // Each message parses out of exactly its framed payload.
        let mut payload = src.split_to(msg_len);
        let id = payload.get_u8();
        let msg = match (id, msg_len) {
            (0, 1) => Message::Choke,
            (1, 1) => Message::Unchoke,
            (2, 1) => Message::Interested,
            (3, 1) => Message::NotInterested,
            (4, 5) => Message::Have { idx: payload.get_u32() },
            (5, _) => Message::Bitfield(payload.to_vec()),
            (6, 13) => Message::Request(read_chunk_info(&mut payload)),
            (7, n) if n >= 9 => {
                let piece = payload.get_u32() as usize;
                let offset = payload.get_u32() as usize;
                Message::Piece(ChunkData { piece, offset, data: payload.to_vec() })
            }
            (8, 13) => Message::Cancel(read_chunk_info(&mut payload)),
            (9, 3) => Message::Port { port: payload.get_u16() },
            (13, 5) => Message::Suggest { idx: payload.get_u32() },
            (14, 1) => Message::HaveAll,
            (15, 1) => Message::HaveNone,
            (16, 13) => Message::Reject(read_chunk_info(&mut payload)),
            (17, 5) => Message::AllowedFast { idx: payload.get_u32() },
            (20, n) if n >= 2 => {
                let id = payload.get_u8();
                Message::Extended { id, payload: payload.to_vec() }
            }
            (id @ (0..=9 | 13..=17 | 20), len) => {
                tracing::warn!("message id {} with invalid length {}", id, len);
                return Err(PeerError::InvalidMessage);
            }
            (id, _) => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

fn read_chunk_info(payload: &mut BytesMut) -> ChunkInfo {
    ChunkInfo {
        piece: payload.get_u32() as usize,
        offset: payload.get_u32() as usize,
        len: payload.get_u32() as usize,
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bytes) => write!(f, "bitfield of {} bytes", bytes.len()),
            Message::Request(chunk) => write!(f, "request for chunk {{ piece: {}, offset: {}, length: {} }}",
                chunk.piece,
                chunk.offset,
                chunk.len,
            ),
            Message::Piece(chunk) => write!(f, "chunk data {{ piece: {}, offset: {}, length: {} }}",
                chunk.piece,
                chunk.offset,
                chunk.data.len(),
            ),
            Message::Cancel(chunk) => write!(f, "cancel for chunk {{ piece: {}, offset: {}, length: {} }}",
                chunk.piece,
                chunk.offset,
                chunk.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Suggest { idx } => write!(f, "suggest piece idx: {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::Reject(chunk) => write!(f, "reject for chunk {{ piece: {}, offset: {}, length: {} }}",
                chunk.piece,
                chunk.offset,
                chunk.len,
            ),
            Message::AllowedFast { idx } => write!(f, "allowed fast piece idx: {}", idx),
            Message::Extended { id, payload } => write!(f, "extended id {} with {} bytes", id, payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Port
        buf.extend_from_slice(&[0, 0, 0, 3, 0x9, 0x1a, 0xe1]);
        // Suggest
        buf.extend_from_slice(&[0, 0, 0, 5, 0xd, 0, 0, 0, 0x2]);
        // Have all / have none
        buf.extend_from_slice(&[0, 0, 0, 1, 0xe]);
        buf.extend_from_slice(&[0, 0, 0, 1, 0xf]);
        // Reject
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x10, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Allowed fast
        buf.extend_from_slice(&[0, 0, 0, 5, 0x11, 0, 0, 0, 0x7]);
        // Extended handshake
        buf.extend_from_slice(&[0, 0, 0, 4, 0x14, 0, 0x64, 0x65]);

        let chunk = ChunkInfo { piece: 0xb, offset: 0x134000, len: 0x4000 };
        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(vec![0x1, 0x2, 0x3]),
            Message::Request(chunk),
            Message::Piece(ChunkData { piece: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::Port { port: 6881 },
            Message::Suggest { idx: 0x2 },
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject(chunk),
            Message::AllowedFast { idx: 0x7 },
            Message::Extended { id: 0, payload: vec![0x64, 0x65] },
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        let decoded = MessageCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        let decoded = MessageCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[0x2, 0x3]);
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece(ChunkData { piece: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }));
    }

    #[test]
    fn test_msg_decode_empty() {
        let mut src = BytesMut::new();
        let message = MessageCodec.decode(&mut src).unwrap();
        assert_eq!(message, None);
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        let result = MessageCodec.decode(&mut src);
        match result {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected PeerError::InvalidMessageId, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_msg_decode_bad_length() {
        // A have message framed with 6 payload bytes.
        let mut src = BytesMut::from(&[0u8, 0, 0, 6, 4, 0, 0, 0, 1, 9][..]);
        assert!(matches!(MessageCodec.decode(&mut src), Err(PeerError::InvalidMessage)));
    }
}
