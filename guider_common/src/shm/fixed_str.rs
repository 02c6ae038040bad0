//! Fixed-width, NUL-terminated name fields.
//!
//! Every name stored in shared memory lives in a `[u8; N]` field holding at
//! most `N - 1` bytes followed by a NUL. Unused trailing bytes are zero.
//!
//! Encoding is strict (too long or interior NUL is rejected) so a published
//! name always reads back byte-identical. Decoding is lenient: it stops at the
//! first NUL (or the end of the field) and replaces invalid UTF-8.

/// `true` if `s` can be stored in an `N`-byte field without truncation.
#[inline]
pub fn fits<const N: usize>(s: &str) -> bool {
    N > 0 && s.len() < N && !s.as_bytes().contains(&0)
}

/// Encode `s` into a zero-padded `N`-byte field.
///
/// Returns `None` when `s` does not [`fits`].
#[inline]
pub fn encode<const N: usize>(s: &str) -> Option<[u8; N]> {
    if !fits::<N>(s) {
        return None;
    }
    let mut buf = [0u8; N];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    Some(buf)
}

/// Decode a name field, stopping at the first NUL.
#[inline]
pub fn decode(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// `true` if the field holds the empty string.
#[inline]
pub fn is_empty(field: &[u8]) -> bool {
    field.first().is_none_or(|&b| b == 0)
}
