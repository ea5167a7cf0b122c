//! Random access into the package index.
//!
//! The index is a tar archive (optionally delivered gzipped) holding one
//! metadata file per package. [`TarIndex`] scans the archive once, builds a
//! path → offset table, and then serves point lookups without re-walking the
//! archive. The [`IndexReader`] trait is the seam package resolution goes
//! through, so alternative index encodings can slot in behind it.

use std::collections::BTreeMap;
use std::io::Read;

use thiserror::Error;

/// Size of one tar block.
const BLOCK: usize = 512;

/// Errors from reading the package index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The archive ended mid-entry.
    #[error("package index is truncated at offset {0}")]
    Truncated(u64),
    /// An entry header could not be decoded.
    #[error("invalid index entry at offset {offset}: {cause}")]
    Header { offset: u64, cause: String },
    /// The gzipped index could not be decompressed.
    #[error("cannot decompress package index: {0}")]
    Gzip(#[from] std::io::Error),
}

/// Convenience alias for index results.
type Result<T> = std::result::Result<T, IndexError>;

/// Header of one index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Archive-relative path of the entry.
    pub path: String,
    /// Size of the entry's contents in bytes.
    pub size: u64,
}

/// Random-access reader over the package index.
pub trait IndexReader {
    /// Byte offset of the entry header for `path`, when present.
    fn lookup(&self, path: &str) -> Option<u64>;

    /// Reads the entry whose header starts at `offset`.
    fn read_at(&self, offset: u64) -> Result<(IndexEntry, Vec<u8>)>;
}

/// In-memory tar archive with a path → offset table.
#[derive(Debug, Clone)]
pub struct TarIndex {
    data: Vec<u8>,
    offsets: BTreeMap<String, u64>,
}

impl TarIndex {
    /// Builds the offset table by walking the archive once.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mut offsets = BTreeMap::new();
        let mut offset = 0usize;
        while offset + BLOCK <= data.len() {
            let header = &data[offset..offset + BLOCK];
            if header.iter().all(|b| *b == 0) {
                // Terminator block; the archive ends here.
                break;
            }
            let entry = parse_header(header, offset as u64)?;
            let data_end = offset + BLOCK + padded(entry.size as usize);
            if data_end > data.len() {
                return Err(IndexError::Truncated(offset as u64));
            }
            // Only regular files participate in lookups.
            if matches!(header[156], b'0' | 0) {
                offsets.insert(entry.path, offset as u64);
            }
            offset = data_end;
        }
        Ok(TarIndex { data, offsets })
    }

    /// Number of addressable entries.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// `true` when the archive holds no addressable entries.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Contents of the entry at `path`, when present.
    pub fn entry_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.lookup(path) {
            Some(offset) => self.read_at(offset).map(|(_, bytes)| Some(bytes)),
            None => Ok(None),
        }
    }

    /// Iterates the archive paths in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.offsets.keys().map(String::as_str)
    }
}

impl IndexReader for TarIndex {
    fn lookup(&self, path: &str) -> Option<u64> {
        self.offsets.get(path).copied()
    }

    fn read_at(&self, offset: u64) -> Result<(IndexEntry, Vec<u8>)> {
        let start = offset as usize;
        if start + BLOCK > self.data.len() {
            return Err(IndexError::Truncated(offset));
        }
        let entry = parse_header(&self.data[start..start + BLOCK], offset)?;
        let data_start = start + BLOCK;
        let data_end = data_start + entry.size as usize;
        if data_end > self.data.len() {
            return Err(IndexError::Truncated(offset));
        }
        let bytes = self.data[data_start..data_end].to_vec();
        Ok((entry, bytes))
    }
}

/// Decompresses a gzipped index delivery.
pub fn decompress_index(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decodes the path and size fields of a tar header block.
fn parse_header(header: &[u8], offset: u64) -> Result<IndexEntry> {
    let name = str_field(&header[0..100], offset, "name")?;
    if name.is_empty() {
        return Err(IndexError::Header {
            offset,
            cause: "empty entry name".to_string(),
        });
    }
    // ustar archives may split long paths into a prefix field.
    let prefix = str_field(&header[345..500], offset, "prefix").unwrap_or_default();
    let path = if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    };
    let size = octal_field(&header[124..136], offset)?;
    Ok(IndexEntry { path, size })
}

/// NUL-trimmed UTF-8 string field.
fn str_field(bytes: &[u8], offset: u64, field: &str) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|e| IndexError::Header {
            offset,
            cause: format!("{field} is not utf-8: {e}"),
        })
}

/// Octal numeric field (NUL/space padded).
fn octal_field(bytes: &[u8], offset: u64) -> Result<u64> {
    let text: String = bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect();
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8).map_err(|e| IndexError::Header {
        offset,
        cause: format!("bad size field: {e}"),
    })
}

/// Rounds an entry size up to whole blocks.
fn padded(size: usize) -> usize {
    size.div_ceil(BLOCK) * BLOCK
}
