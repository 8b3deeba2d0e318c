//! Key ordering and formatting
//!
//! The mini allocator stores byte-string key bounds in its metadata
//! entries and needs a total order over them when selecting entries for
//! a range operation. Both come from a `DataConfig` supplied by the
//! caller, so the allocator never assumes anything about key encoding.

use std::cmp::Ordering;

/// Key comparison and formatting supplied by the data layer
pub trait DataConfig: Send + Sync {
    /// Total order over keys
    fn key_compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Copy a key into a fixed destination slot
    fn key_copy(&self, dst: &mut [u8], src: &[u8]) {
        dst[..src.len()].copy_from_slice(src);
    }

    /// Render a key for diagnostics
    fn key_to_string(&self, key: &[u8]) -> String;
}

/// Unsigned bytewise key order (memcmp order)
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalKeyConfig;

impl DataConfig for LexicalKeyConfig {
    fn key_compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn key_to_string(&self, key: &[u8]) -> String {
        if key.is_empty() {
            return "<null>".to_string();
        }
        if key.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            String::from_utf8_lossy(key).into_owned()
        } else {
            key.iter().map(|b| format!("{:02x}", b)).collect()
        }
    }
}
