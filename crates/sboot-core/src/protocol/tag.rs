//! Magic tag matching and display.
//!
//! Upload mode speaks NUL-terminated mixed-case ASCII tags
//! (`PrEaMbLe`, `AcKnOwLeDgMeNt`, ...). Payloads may carry a tag
//! followed by arguments, so matching is by prefix.

use std::fmt;

/// Printable view of a payload's leading tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag<'a> {
    bytes: &'a [u8],
}

impl<'a> Tag<'a> {
    /// Take the tag from the start of `payload`, up to (not including) the first NUL.
    pub fn leading(payload: &'a [u8]) -> Self {
        let end = payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(payload.len());
        Self {
            bytes: &payload[..end],
        }
    }

    /// Tag text with unprintable bytes replaced by '.'.
    pub fn as_ascii(&self) -> String {
        self.bytes
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check against a wire constant (with or without its trailing NUL).
    pub fn matches(&self, expected: &[u8]) -> bool {
        let expected = expected.strip_suffix(&[0]).unwrap_or(expected);
        self.bytes == expected
    }
}

impl fmt::Debug for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag('{}')", self.as_ascii())
    }
}

impl fmt::Display for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ascii())
    }
}
