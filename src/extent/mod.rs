//! Extent container format: the serial representation of a packed run of
//! pages. The codec is pure byte transformation; it knows nothing about
//! blob keys, files, or branches.

pub mod bitmap;
pub mod codec;

pub use codec::{
    BuildOptions, EXTENT_MAGIC, EXTENT_VERSION, ExtentHeader, FLAG_COMPRESSED, HEADER_SIZE,
    ParsedExtent, build, extract_page, parse, parse_header, validate,
};
