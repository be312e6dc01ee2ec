//! Build, parse, and validate the extent container.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! offset  size        field
//! 0       4           magic = 0x31545845 ("EXT1")
//! 4       2           version = 1
//! 6       2           flags (bit0 = compressed)
//! 8       2           page_size
//! 10      2           reserved
//! 12      4           page_count (highest present index + 1)
//! 16      4           extent_size (uncompressed page-data bytes)
//! 20      8           checksum (FNV-1a 64 over bitmap || page data)
//! 28      36          reserved
//! 64      ceil(pc/8)  presence bitmap, LSB first
//! ...                 present pages, ascending index, tightly packed
//! ```
//!
//! An empty extent is exactly the 64-byte header. When the compressed flag
//! is set the region after the bitmap is a gzip frame of the packed page
//! data; the checksum always covers the uncompressed bytes so a container
//! validates the same regardless of representation.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::errors::{FsxError, Result};
use crate::extent::bitmap;

pub const EXTENT_MAGIC: u32 = 0x3154_5845;
pub const EXTENT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 64;
pub const FLAG_COMPRESSED: u16 = 0x0001;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64 over the given regions in order.
fn fnv1a64(regions: &[&[u8]]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for region in regions {
        for &byte in *region {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Decoded 64-byte extent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub version: u16,
    pub flags: u16,
    pub page_size: u16,
    pub page_count: u32,
    pub extent_size: u32,
    pub checksum: u64,
}

impl ExtentHeader {
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    #[must_use]
    pub const fn bitmap_len(&self) -> usize {
        bitmap::size_for(self.page_count as usize)
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..10].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.extent_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }
}

/// Options for [`build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub compress: bool,
}

/// A parsed extent: header plus bitmap and the uncompressed page data.
#[derive(Debug, Clone)]
pub struct ParsedExtent {
    pub header: ExtentHeader,
    pub bitmap: Vec<u8>,
    pub page_data: Vec<u8>,
}

impl ParsedExtent {
    /// True when at least one index inside `[0, page_count)` is absent.
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        bitmap::popcount(&self.bitmap) < self.header.page_count as usize
    }

    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.header.is_compressed()
    }

    /// Payload of the page at `index`, or `None` when the bit is clear or
    /// the index is out of range.
    #[must_use]
    pub fn page(&self, index: u32) -> Option<&[u8]> {
        if index >= self.header.page_count || !bitmap::is_set(&self.bitmap, index as usize) {
            return None;
        }
        let ps = self.header.page_size as usize;
        let offset = bitmap::rank(&self.bitmap, index as usize) * ps;
        self.page_data.get(offset..offset + ps)
    }

    /// Present `(index, payload)` pairs in ascending index order.
    pub fn pages(&self) -> impl Iterator<Item = (u32, &[u8])> {
        (0..self.header.page_count).filter_map(|i| self.page(i).map(|p| (i, p)))
    }
}

/// Pack a sparse map of `index -> payload` into extent container bytes.
///
/// # Errors
/// `Invalid` when `page_size` is unusable or any payload length differs
/// from `page_size`.
pub fn build(pages: &BTreeMap<u32, Vec<u8>>, page_size: u32, opts: BuildOptions) -> Result<Vec<u8>> {
    let ps_u16 = u16::try_from(page_size)
        .map_err(|_| FsxError::Invalid(format!("page size {page_size} does not fit the header")))?;
    if page_size == 0 {
        return Err(FsxError::Invalid("page size must be non-zero".into()));
    }
    for (&index, payload) in pages {
        if payload.len() != page_size as usize {
            return Err(FsxError::Invalid(format!(
                "page {index} payload is {} bytes, expected {page_size}",
                payload.len()
            )));
        }
    }

    let page_count = pages.keys().next_back().map_or(0, |&max| max + 1);
    let mut bits = vec![0u8; bitmap::size_for(page_count as usize)];
    let mut page_data = Vec::with_capacity(pages.len() * page_size as usize);
    for (&index, payload) in pages {
        bitmap::set(&mut bits, index as usize);
        page_data.extend_from_slice(payload);
    }

    let checksum = fnv1a64(&[&bits, &page_data]);
    let extent_size = u32::try_from(page_data.len())
        .map_err(|_| FsxError::Invalid("page data area exceeds u32".into()))?;

    // An empty extent stays header-only; a gzip frame would only add bytes.
    let compress = opts.compress && !page_data.is_empty();
    let body = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&page_data)
            .and_then(|()| encoder.finish())
            .map_err(|e| FsxError::Io(format!("gzip encode: {e}")))?
    } else {
        page_data
    };

    let header = ExtentHeader {
        version: EXTENT_VERSION,
        flags: if compress { FLAG_COMPRESSED } else { 0 },
        page_size: ps_u16,
        page_count,
        extent_size,
        checksum,
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + bits.len() + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&bits);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode and sanity-check the 64-byte header.
///
/// # Errors
/// `Invalid` on short input, bad magic, unsupported version, or unknown
/// flag bits.
pub fn parse_header(bytes: &[u8]) -> Result<ExtentHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(FsxError::Invalid(format!(
            "extent too short: {} bytes, header needs {HEADER_SIZE}",
            bytes.len()
        )));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
    if magic != EXTENT_MAGIC {
        return Err(FsxError::Invalid(format!("bad extent magic {magic:#010x}")));
    }
    let version = u16::from_le_bytes(bytes[4..6].try_into().expect("2-byte slice"));
    if version != EXTENT_VERSION {
        return Err(FsxError::Invalid(format!("unsupported extent version {version}")));
    }
    let flags = u16::from_le_bytes(bytes[6..8].try_into().expect("2-byte slice"));
    if flags & !FLAG_COMPRESSED != 0 {
        return Err(FsxError::Invalid(format!("unknown extent flags {flags:#06x}")));
    }
    Ok(ExtentHeader {
        version,
        flags,
        page_size: u16::from_le_bytes(bytes[8..10].try_into().expect("2-byte slice")),
        page_count: u32::from_le_bytes(bytes[12..16].try_into().expect("4-byte slice")),
        extent_size: u32::from_le_bytes(bytes[16..20].try_into().expect("4-byte slice")),
        checksum: u64::from_le_bytes(bytes[20..28].try_into().expect("8-byte slice")),
    })
}

/// Decode a full extent, decompressing the page-data area when flagged.
///
/// # Errors
/// `Invalid` on any structural mismatch between header and body.
pub fn parse(bytes: &[u8]) -> Result<ParsedExtent> {
    let header = parse_header(bytes)?;
    let bitmap_len = header.bitmap_len();
    let data_start = HEADER_SIZE + bitmap_len;
    if bytes.len() < data_start {
        return Err(FsxError::Invalid(format!(
            "extent truncated: {} bytes, bitmap ends at {data_start}",
            bytes.len()
        )));
    }
    let bits = bytes[HEADER_SIZE..data_start].to_vec();

    let page_data = if header.is_compressed() {
        let mut decoder = GzDecoder::new(&bytes[data_start..]);
        let mut out = Vec::with_capacity(header.extent_size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| FsxError::Invalid(format!("gzip decode: {e}")))?;
        out
    } else {
        bytes[data_start..].to_vec()
    };

    if page_data.len() != header.extent_size as usize {
        return Err(FsxError::Invalid(format!(
            "page data is {} bytes, header says {}",
            page_data.len(),
            header.extent_size
        )));
    }
    let expected = bitmap::popcount(&bits) * header.page_size as usize;
    if page_data.len() != expected {
        return Err(FsxError::Invalid(format!(
            "page data is {} bytes, bitmap implies {expected}",
            page_data.len()
        )));
    }

    Ok(ParsedExtent { header, bitmap: bits, page_data })
}

/// Pull a single page out of raw extent bytes.
///
/// Returns `None` when the bit is clear or the index is out of range.
///
/// # Errors
/// `Invalid` when the bytes are malformed or `page_size` disagrees with
/// the header.
pub fn extract_page(bytes: &[u8], index: u32, page_size: u32) -> Result<Option<Vec<u8>>> {
    let parsed = parse(bytes)?;
    if u32::from(parsed.header.page_size) != page_size {
        return Err(FsxError::Invalid(format!(
            "page size {page_size} disagrees with extent header {}",
            parsed.header.page_size
        )));
    }
    Ok(parsed.page(index).map(<[u8]>::to_vec))
}

/// True iff magic, version, lengths, and checksum all agree.
#[must_use]
pub fn validate(bytes: &[u8]) -> bool {
    match parse(bytes) {
        Ok(parsed) => {
            fnv1a64(&[&parsed.bitmap, &parsed.page_data]) == parsed.header.checksum
        }
        Err(_) => false,
    }
}
