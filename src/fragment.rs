//! Splitting encoded payload into query-sized fragments
//!
//! A fragment is at most two full DNS labels of encoded text. Fragments carry
//! no sequence number; their order is the order the queries are sent in.

use crate::codec;
use crate::wire::MAX_LABEL_LEN;
use crate::{Result, TunnelError};

/// Maximum encoded characters carried by one query (two labels)
pub const MAX_FRAGMENT_LEN: usize = 2 * MAX_LABEL_LEN;

/// One query's worth of encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    text: String,
}

impl Fragment {
    /// The zero-length fragment that ends a transfer
    pub fn close() -> Self {
        Self {
            text: String::new(),
        }
    }

    /// Wrap already-encoded text, enforcing the two-label capacity
    pub fn from_encoded(text: String) -> Result<Self> {
        if text.len() > MAX_FRAGMENT_LEN {
            return Err(TunnelError::OversizeFragment(text.len()));
        }
        if !text.is_ascii() {
            return Err(TunnelError::Decode(
                "fragment text must be ASCII".to_string(),
            ));
        }
        Ok(Self { text })
    }

    /// Fragment that opens a session by naming the destination subpath
    pub fn destination(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(TunnelError::Argument(
                "destination path must not be empty".to_string(),
            ));
        }

        let encoded = codec::encode(path.as_bytes());
        if encoded.len() > MAX_FRAGMENT_LEN {
            return Err(TunnelError::Argument(format!(
                "destination path \"{}\" encodes to {} characters (max: {})",
                path,
                encoded.len(),
                MAX_FRAGMENT_LEN
            )));
        }

        Self::from_encoded(encoded)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// A close fragment carries no data labels at all
    pub fn is_close(&self) -> bool {
        self.text.is_empty()
    }

    /// Data labels for the query name: 63 bytes and the remainder, one label
    /// when it all fits, none for the close fragment
    pub fn labels(&self) -> Vec<&[u8]> {
        self.text.as_bytes().chunks(MAX_LABEL_LEN).collect()
    }
}

/// Cursor over an encoded payload yielding data fragments and then exactly
/// one close fragment
#[derive(Debug, Clone)]
pub struct Fragmenter<'a> {
    encoded: &'a str,
    cursor: usize,
    closed: bool,
}

impl<'a> Fragmenter<'a> {
    /// `encoded` must be codec output; anything that is not pure ASCII is
    /// refused
    pub fn new(encoded: &'a str) -> Result<Self> {
        if !encoded.is_ascii() {
            return Err(TunnelError::Decode(
                "encoded payload must be ASCII".to_string(),
            ));
        }
        Ok(Self {
            encoded,
            cursor: 0,
            closed: false,
        })
    }

    pub fn remaining(&self) -> usize {
        self.encoded.len() - self.cursor
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.remaining() > 0 {
            let end = (self.cursor + MAX_FRAGMENT_LEN).min(self.encoded.len());
            let text = self.encoded[self.cursor..end].to_string();
            self.cursor = end;
            return Some(Fragment { text });
        }

        if self.closed {
            return None;
        }
        self.closed = true;
        Some(Fragment::close())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = fragment_count(self.remaining()) - usize::from(self.closed);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragmenter<'_> {}

/// Number of queries needed for `encoded_len` characters of data, close
/// fragment included
pub fn fragment_count(encoded_len: usize) -> usize {
    encoded_len.div_ceil(MAX_FRAGMENT_LEN) + 1
}
