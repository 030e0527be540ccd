use sha1::{Digest, Sha1};
use crate::layout::Span;
use super::{directory::FileDirectory, Result};

// Scatters a chunk's bytes over its file spans.
pub async fn write_spans(directory: &mut FileDirectory, spans: &[Span], data: &[u8]) -> Result<()> {
    let mut cursor = 0;
    for span in spans {
        directory
            .write(span.file, span.offset, data[cursor..cursor + span.len].to_vec())
            .await?;
        cursor += span.len;
    }
    debug_assert_eq!(cursor, data.len());
    Ok(())
}

// Gathers contiguous bytes back from file spans.
pub async fn read_spans(directory: &mut FileDirectory, spans: &[Span], len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    for span in spans {
        buf.extend_from_slice(&directory.read(span.file, span.offset, span.len).await?);
    }
    debug_assert_eq!(buf.len(), len);
    Ok(buf)
}

// Hashing a whole piece is the expensive part of the commit path.
pub fn verify(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected
}
