//! Handling of secret key and certificate material
//!
//! Everything read or decoded here lives in [`SecretBytes`], which wipes its
//! full allocation when dropped.

use std::io::{self, Read};
use zeroize::{Zeroize, Zeroizing};

/// Byte buffer that is zeroed before its memory is released
pub type SecretBytes = Zeroizing<Vec<u8>>;

const READ_INCREMENT: usize = 16 * 1024;

/// Read `reader` to end-of-stream without leaving stale copies behind.
///
/// The buffer is never grown in place: each growth copies into a fresh
/// allocation and wipes the old one, so reallocation cannot strand key
/// material in freed memory.
pub fn read_all_defensively<R: Read>(mut reader: R) -> io::Result<SecretBytes> {
    let mut buf = Zeroizing::new(vec![0u8; READ_INCREMENT]);
    let mut len = 0;

    loop {
        match reader.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        if len == buf.len() {
            let mut larger = Zeroizing::new(vec![0u8; buf.len() + READ_INCREMENT]);
            larger[..len].copy_from_slice(&buf[..len]);
            // dropping the old buffer wipes it
            buf = larger;
        }
    }

    buf.truncate(len);
    Ok(buf)
}

/// Decode the base64 body of the PEM record labelled `label`.
///
/// Returns `None` when either marker is missing (some records, such as an
/// EC key, legitimately do not exist) or when the body is not valid base64.
pub fn decode_pem_block(blob: &[u8], label: &str) -> Option<SecretBytes> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = find(blob, begin.as_bytes())? + begin.len();
    let span = &blob[start..];
    let span = &span[..find(span, end.as_bytes())?];

    decode_base64(span)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn decode_base64(encoded: &[u8]) -> Option<SecretBytes> {
    let capacity = (encoded.len() * 6).div_ceil(8);
    let mut out = Zeroizing::new(Vec::with_capacity(capacity));
    let mut bits: u32 = 0;
    let mut count = 0;

    let mut symbols = encoded.iter();
    while let Some(&ch) = symbols.next() {
        let value = match ch {
            b'A'..=b'Z' => ch - b'A',
            b'a'..=b'z' => ch - b'a' + 26,
            b'0'..=b'9' => ch - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            b'=' => {
                // Padding ends the data; only more padding or whitespace may follow.
                if symbols.all(|&c| c == b'=' || c <= b' ') {
                    break;
                }
                return None;
            }
            c if c <= b' ' => continue,
            _ => return None,
        };

        bits = (bits << 6) | u32::from(value);
        count += 6;
        if count >= 8 {
            count -= 8;
            out.push((bits >> count) as u8);
        }
    }

    bits.zeroize();
    debug_assert!(out.len() <= capacity);
    Some(out)
}
