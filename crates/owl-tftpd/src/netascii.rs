//! NETASCII encoding for outgoing data (RFC 1350 / RFC 764).
//!
//! A bare LF goes out as CR LF and a bare CR as CR NUL. Each of those bytes
//! therefore costs one extra byte on the wire, which is what tsize reports.

use bytes::BufMut;
use std::io::Read;

/// Append the NETASCII form of `data` to `out`.
pub fn encode_into<B: BufMut>(data: &[u8], out: &mut B) {
    for &byte in data {
        match byte {
            b'\n' => out.put_slice(b"\r\n"),
            b'\r' => out.put_slice(b"\r\0"),
            _ => out.put_u8(byte),
        }
    }
}

/// Length of `reader` once encoded.
pub fn encoded_len<R: Read>(mut reader: R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let line_breaks = buf[..n]
            .iter()
            .filter(|&&b| b == b'\n' || b == b'\r')
            .count();
        total += (n + line_breaks) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_line_endings() {
        let mut out = Vec::new();
        encode_into(b"a\nb\rc", &mut out);
        assert_eq!(out, b"a\r\nb\r\0c");
    }

    #[test]
    fn translation_is_stream_safe() {
        // splitting the input anywhere gives the same output
        let input = b"line one\nline two\r\n\n";
        let mut whole = Vec::new();
        encode_into(input, &mut whole);
        for split in 0..input.len() {
            let mut parts = Vec::new();
            encode_into(&input[..split], &mut parts);
            encode_into(&input[split..], &mut parts);
            assert_eq!(parts, whole);
        }
    }

    #[test]
    fn encoded_len_matches_translation() {
        let input = b"one\ntwo\rthree\r\n".repeat(1000);
        let mut out = Vec::new();
        encode_into(&input, &mut out);
        assert_eq!(encoded_len(&input[..]).unwrap(), out.len() as u64);
    }
}
