use std::path::{Path, PathBuf};
use crate::chunk::ChunkInfo;

// Parsed metainfo the engine consumes; producing it from bencode is the
// metainfo parser's job.
#[derive(Debug, Clone)]
pub struct TorrentInfo {

    // SHA-1 of the metainfo's info dictionary.
    pub info_hash: [u8; 20],

    // Torrent name: single-file torrents store under this file name,
    // multi-file torrents under a directory of this name.
    pub name: String,

    // Nominal piece length in bytes.
    pub piece_len: usize,

    // Expected SHA-1 per piece, index aligned.
    pub piece_hashes: Vec<[u8; 20]>,

    // Ordered (relative path, length) for every payload file.
    pub files: Vec<(PathBuf, u64)>,

}

#[derive(Debug, Clone)]
pub struct FileEntry {

    // Path relative to the layout root.
    pub path: PathBuf,

    pub len: u64,

    // Offset in bytes from the start of the torrent payload.
    pub offset: u64,

}

// A contiguous byte range of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {

    // Index into `Layout::files`.
    pub file: usize,

    // Offset in bytes within that file.
    pub offset: u64,

    pub len: usize,

}

/// Maps pieces and chunks onto the torrent's file list.
#[derive(Debug, Clone)]
pub struct Layout {

    pub name: String,

    pub total_len: u64,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub num_pieces: usize,

    pub files: Vec<FileEntry>,

    // Directory the file paths are relative to.
    pub root: PathBuf,

}

impl Layout {

    pub fn new(info: &TorrentInfo, download_dir: &Path) -> Self {

        debug_assert!(!info.files.is_empty());
        debug_assert!(info.piece_len > 0);

        let mut offset = 0;
        let mut files = Vec::with_capacity(info.files.len());
        for (path, len) in info.files.iter() {
            files.push(FileEntry { path: path.clone(), len: *len, offset });
            offset += len;
        }
        let total_len = offset;

        let num_pieces = ((total_len + info.piece_len as u64 - 1) / info.piece_len as u64) as usize;
        debug_assert_eq!(num_pieces, info.piece_hashes.len());
        let last_piece_len = match (total_len % info.piece_len as u64) as usize {
            0 => info.piece_len,
            rem => rem,
        };

        // Single-file torrents live directly in the download directory,
        // multi-file torrents under a directory named after the torrent.
        let root = if files.len() == 1 {
            download_dir.to_path_buf()
        } else {
            download_dir.join(&info.name)
        };

        Self {
            name: info.name.clone(),
            total_len,
            piece_len: info.piece_len,
            last_piece_len,
            num_pieces,
            files,
            root,
        }
    }

    // Length of the piece at `idx`; only the last piece may be short.
    pub fn piece_len(&self, idx: usize) -> usize {
        debug_assert!(idx < self.num_pieces);
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    /// Ordered file spans covering the piece at `idx`. Span lengths sum
    /// to the piece length.
    pub fn piece_spans(&self, idx: usize) -> Vec<Span> {

        let mut spans = Vec::with_capacity(1);
        let mut pos = self.piece_offset(idx);
        let mut remaining = self.piece_len(idx);

        // First file whose range reaches past the piece start.
        let mut file = self.files.partition_point(|f| f.offset + f.len <= pos);

        while remaining > 0 {
            let f = &self.files[file];
            if f.len == 0 {
                file += 1;
                continue;
            }
            let offset = pos - f.offset;
            let take = remaining.min((f.len - offset) as usize);
            spans.push(Span { file, offset, len: take });
            pos += take as u64;
            remaining -= take;
            file += 1;
        }

        spans
    }

    /// File spans covering `chunk`, truncated at both ends to the chunk's
    /// byte range within its piece.
    pub fn chunk_spans(&self, chunk: &ChunkInfo) -> Vec<Span> {

        let mut out = Vec::with_capacity(1);
        let mut skip = chunk.offset;
        let mut remaining = chunk.len;

        for span in self.piece_spans(chunk.piece) {
            if remaining == 0 {
                break;
            }
            if skip >= span.len {
                skip -= span.len;
                continue;
            }
            let take = (span.len - skip).min(remaining);
            out.push(Span {
                file: span.file,
                offset: span.offset + skip as u64,
                len: take,
            });
            remaining -= take;
            skip = 0;
        }

        debug_assert_eq!(remaining, 0, "chunk exceeds its piece");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_file_info() -> TorrentInfo {
        // a.dat of 3 bytes and b.dat of 5 bytes with 4-byte pieces:
        // piece 0 = [(a, 0, 3), (b, 0, 1)], piece 1 = [(b, 1, 4)].
        TorrentInfo {
            info_hash: [0; 20],
            name: "pair".into(),
            piece_len: 4,
            piece_hashes: vec![[0; 20]; 2],
            files: vec![(PathBuf::from("a.dat"), 3), (PathBuf::from("b.dat"), 5)],
        }
    }

    #[test]
    fn test_piece_spans_two_files() {
        let layout = Layout::new(&two_file_info(), Path::new("dl"));
        assert_eq!(layout.num_pieces, 2);
        assert_eq!(layout.last_piece_len, 4);
        assert_eq!(layout.root, PathBuf::from("dl/pair"));

        assert_eq!(
            layout.piece_spans(0),
            vec![
                Span { file: 0, offset: 0, len: 3 },
                Span { file: 1, offset: 0, len: 1 },
            ]
        );
        assert_eq!(layout.piece_spans(1), vec![Span { file: 1, offset: 1, len: 4 }]);
    }

    #[test]
    fn test_span_coverage() {
        let info = TorrentInfo {
            info_hash: [0; 20],
            name: "many".into(),
            piece_len: 7,
            piece_hashes: vec![[0; 20]; 6],
            files: vec![
                (PathBuf::from("a"), 10),
                (PathBuf::from("b"), 1),
                (PathBuf::from("c"), 25),
            ],
        };
        let layout = Layout::new(&info, Path::new("dl"));
        assert_eq!(layout.total_len, 36);
        assert_eq!(layout.num_pieces, 6);
        assert_eq!(layout.last_piece_len, 1);

        let mut total = 0;
        for idx in 0..layout.num_pieces {
            let spans = layout.piece_spans(idx);
            let sum: usize = spans.iter().map(|s| s.len).sum();
            assert_eq!(sum, layout.piece_len(idx));
            for span in spans {
                assert!(span.offset + span.len as u64 <= layout.files[span.file].len);
            }
            total += sum;
        }
        assert_eq!(total as u64, layout.total_len);
    }

    #[test]
    fn test_exact_multiple_last_piece() {
        let info = TorrentInfo {
            info_hash: [0; 20],
            name: "even".into(),
            piece_len: 8,
            piece_hashes: vec![[0; 20]; 2],
            files: vec![(PathBuf::from("a"), 16)],
        };
        let layout = Layout::new(&info, Path::new("dl"));
        assert_eq!(layout.last_piece_len, 8);
        assert_eq!(layout.root, PathBuf::from("dl"));
    }

    #[test]
    fn test_chunk_spans() {
        let layout = Layout::new(&two_file_info(), Path::new("dl"));

        // Whole piece 0 crosses the file boundary.
        let whole = ChunkInfo { piece: 0, offset: 0, len: 4 };
        assert_eq!(
            layout.chunk_spans(&whole),
            vec![
                Span { file: 0, offset: 0, len: 3 },
                Span { file: 1, offset: 0, len: 1 },
            ]
        );

        // Interior chunk lands in the middle of the first span.
        let interior = ChunkInfo { piece: 0, offset: 1, len: 2 };
        assert_eq!(layout.chunk_spans(&interior), vec![Span { file: 0, offset: 1, len: 2 }]);

        // Offset past the first span.
        let tail = ChunkInfo { piece: 0, offset: 3, len: 1 };
        assert_eq!(layout.chunk_spans(&tail), vec![Span { file: 1, offset: 0, len: 1 }]);
    }

    #[test]
    fn test_chunk_spans_sum() {
        let info = TorrentInfo {
            info_hash: [0; 20],
            name: "many".into(),
            piece_len: 64,
            piece_hashes: vec![[0; 20]; 4],
            files: vec![
                (PathBuf::from("a"), 100),
                (PathBuf::from("b"), 56),
                (PathBuf::from("c"), 100),
            ],
        };
        let layout = Layout::new(&info, Path::new("dl"));
        for piece in 0..layout.num_pieces {
            let piece_len = layout.piece_len(piece);
            for offset in (0..piece_len).step_by(16) {
                let len = 16.min(piece_len - offset);
                let chunk = ChunkInfo { piece, offset, len };
                let sum: usize = layout.chunk_spans(&chunk).iter().map(|s| s.len).sum();
                assert_eq!(sum, len);
            }
        }
    }
}
