//! Annex-B framing shared by the H.264 and H.265 handlers.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};

/// Length of the start code at the front of `b`: 4, 3, or None.
fn prefix_len(b: &[u8]) -> Option<usize> {
    if b.len() >= 4 && b[0] == 0 && b[1] == 0 && b[2] == 0 && b[3] == 1 {
        return Some(4);
    }
    if b.len() >= 3 && b[0] == 0 && b[1] == 0 && b[2] == 1 {
        return Some(3);
    }
    None
}

/// Position of the next 3-byte `00 00 01` in `b`, if any.
fn next_start_code(b: &[u8]) -> Option<usize> {
    if b.len() < 3 {
        return None;
    }
    (0..=b.len() - 3).find(|&i| b[i] == 0 && b[i + 1] == 0 && b[i + 2] == 1)
}

/// Pop the next NAL unit off `stream`.
///
/// The stream must start with a `00 00 01` or `00 00 00 01` prefix; the
/// returned frame runs from the byte after the prefix to the next start code
/// (or the end of the stream). Anything else is [`Error::AnnexbPrefix`] and
/// leaves the stream untouched.
pub fn demux(stream: &mut Bytes) -> Result<Bytes> {
    let prefix = prefix_len(stream.chunk()).ok_or(Error::AnnexbPrefix)?;
    stream.advance(prefix);

    let end = next_start_code(stream.chunk()).unwrap_or(stream.remaining());
    Ok(stream.copy_to_bytes(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_frames() {
        let mut b = Bytes::from_static(&[0, 0, 1, 0x0d, 0x0a, 0x0f, 0, 0, 1, 0x0a]);

        let frame = demux(&mut b).unwrap();
        assert_eq!(&frame[..], &[0x0d, 0x0a, 0x0f]);

        let frame = demux(&mut b).unwrap();
        assert_eq!(&frame[..], &[0x0a]);
        assert!(b.is_empty());
    }

    #[test]
    fn four_byte_prefix() {
        let mut b = Bytes::from_static(&[0, 0, 0, 1, 0x0d, 0x0a, 0x0f, 0x0a]);
        let frame = demux(&mut b).unwrap();
        assert_eq!(&frame[..], &[0x0d, 0x0a, 0x0f, 0x0a]);
    }

    #[test]
    fn missing_prefix_fails_without_a_frame() {
        for case in [
            &[0x00, 0x00, 0x02, 0x0d, 0x0a, 0x0f, 0x0a][..],
            &[0x00, 0x01, 0x0d, 0x0a, 0x0f, 0x0a][..],
            &[0x0d, 0x0a, 0x0f, 0x0a][..],
        ] {
            let mut b = Bytes::copy_from_slice(case);
            assert!(matches!(demux(&mut b), Err(Error::AnnexbPrefix)));
            assert_eq!(b.len(), case.len(), "stream must be untouched");
        }
    }
}
