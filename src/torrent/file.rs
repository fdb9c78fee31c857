use std::ops::Range;
use std::path::PathBuf;

/// A file of the torrent and its position in the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64, offset: u64) -> Self {
        Self {
            path: path.into(),
            length,
            offset,
        }
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.byte_range().contains(&offset)
    }
}

/// Expected size, position and SHA-1 of one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: u32,
    pub hash: [u8; 20],
    pub offset: u64,
    pub length: u64,
}

impl PieceInfo {
    pub fn new(index: u32, hash: [u8; 20], offset: u64, length: u64) -> Self {
        Self {
            index,
            hash,
            offset,
            length,
        }
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// The part of a single file covered by a byte range of the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps the content range `start..start + length` onto `files`.
///
/// Zero-length files never produce a span.
pub fn file_spans(files: &[FileEntry], start: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current = start;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if !file.contains_offset(current) {
            continue;
        }

        let file_offset = current - file.offset;
        let take = remaining.min(file.offset + file.length - current);
        spans.push(FileSpan {
            file_index,
            file_offset,
            length: take,
        });

        current += take;
        remaining -= take;
    }

    spans
}
